#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use mirach_agent::agent::Agent;
use mirach_agent::config::AgentConfig;
use mirach_agent::error::AgentError;
use mirach_agent::transport::{Inbound, Publisher, Subscriber};
use mirach_common::codec::{self, Reassembled};
use mirach_common::types::{Message, PluginResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const BASE_CONFIG: &str = r#"
[customer]
id = "cust"

[asset]
id = "asset"

[broker]
host = "localhost"
"#;

#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn decoded(&self) -> Vec<Message> {
        self.messages()
            .iter()
            .map(|(_, body)| codec::decode(body).unwrap())
            .collect()
    }

    pub fn results(&self) -> Vec<PluginResult> {
        self.decoded()
            .iter()
            .filter_map(|m| match codec::reassemble(m).unwrap() {
                Reassembled::Result(result) => Some(result),
                Reassembled::Reference { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> mirach_agent::error::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct StubSubscriber {
    pub topics: Mutex<Vec<String>>,
    pub refuse: bool,
}

#[async_trait]
impl Subscriber for StubSubscriber {
    async fn subscribe(&self, topic: &str) -> mirach_agent::error::Result<()> {
        if self.refuse {
            return Err(AgentError::Subscription {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        self.topics.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

pub struct TestAgent {
    pub agent: Agent,
    pub publisher: Arc<RecordingPublisher>,
    pub subscriber: Arc<StubSubscriber>,
    pub inbound: mpsc::Sender<Inbound>,
    pub config: AgentConfig,
}

pub fn config_with(plugins: &str) -> Result<AgentConfig> {
    Ok(AgentConfig::from_toml_str(&format!("{BASE_CONFIG}\n{plugins}"))?)
}

pub fn start_agent(config: AgentConfig, subscriber: StubSubscriber) -> Result<TestAgent> {
    let publisher = Arc::new(RecordingPublisher::default());
    let subscriber = Arc::new(subscriber);
    let (inbound, inbound_rx) = mpsc::channel(16);
    let agent = Agent::start(&config, publisher.clone(), subscriber.clone(), inbound_rx)?;
    Ok(TestAgent {
        agent,
        publisher,
        subscriber,
        inbound,
        config,
    })
}

impl TestAgent {
    pub async fn send_command(&self, json: &str) -> Result<()> {
        self.inbound
            .send(Inbound::Message {
                topic: self.config.command_topic(),
                payload: json.as_bytes().to_vec(),
            })
            .await?;
        Ok(())
    }
}

/// Shell snippet that prints a JSON string of `len` `x` characters.
pub fn big_string_script(len: usize) -> String {
    format!(r#"printf '"'; head -c {len} /dev/zero | tr '\0' x; printf '"'"#)
}

pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
