//! Remote control over the command topic.
//!
//! Commands are JSON objects `{"type": "<verb>", "args": {...}}`:
//!
//! - `stop` (alias `shutdown`): stop the scheduler and shut the agent down.
//! - `run` with `args.plugin`: fire one plugin now.
//! - `ping`: publish a `pong` result with version and uptime to the data topic.

use crate::agent::ShutdownReason;
use crate::error::{AgentError, Result};
use crate::logging::truncate_text;
use crate::scheduler::SchedulerHandle;
use crate::transport::{Inbound, PublishContext, Subscriber};
use mirach_common::types::{Command, CommandKind, Payload, PluginResult};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

const PAYLOAD_LOG_LIMIT: usize = 256;

pub struct CommandListener {
    topic: String,
    scheduler: SchedulerHandle,
    ctx: Arc<PublishContext>,
    shutdown: mpsc::Sender<ShutdownReason>,
    started: Instant,
}

impl CommandListener {
    pub fn new(
        topic: impl Into<String>,
        scheduler: SchedulerHandle,
        ctx: Arc<PublishContext>,
        shutdown: mpsc::Sender<ShutdownReason>,
    ) -> Self {
        Self {
            topic: topic.into(),
            scheduler,
            ctx,
            shutdown,
            started: Instant::now(),
        }
    }

    /// Subscribes, then handles commands until the connection gives up.
    ///
    /// Only losing the subscription ends the loop, and always with an error.
    /// Malformed commands are logged and skipped.
    pub async fn run(
        self,
        subscriber: &dyn Subscriber,
        mut inbound: mpsc::Receiver<Inbound>,
    ) -> Result<()> {
        subscriber.subscribe(&self.topic).await?;
        tracing::info!(topic = %self.topic, "Listening for commands");

        while let Some(event) = inbound.recv().await {
            match event {
                Inbound::Message { topic, payload } => {
                    if topic != self.topic {
                        tracing::debug!(topic = %topic, "Ignoring message on foreign topic");
                        continue;
                    }
                    self.handle(&payload).await;
                }
                Inbound::SubscribeRejected { pkid } => {
                    return Err(AgentError::Subscription {
                        topic: self.topic.clone(),
                        reason: format!("broker rejected subscription (packet {pkid})"),
                    });
                }
                Inbound::SubscriptionLost { topic, reason } => {
                    return Err(AgentError::Subscription {
                        topic,
                        reason: format!("not renewed after reconnect: {reason}"),
                    });
                }
            }
        }

        Err(AgentError::Subscription {
            topic: self.topic,
            reason: "inbound channel closed".to_string(),
        })
    }

    async fn handle(&self, payload: &[u8]) {
        let command: Command = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    payload = %truncate_text(&String::from_utf8_lossy(payload), PAYLOAD_LOG_LIMIT),
                    "Discarding malformed command"
                );
                return;
            }
        };
        tracing::info!(command = %command.kind, "Received command");

        match command.kind {
            CommandKind::Stop => {
                self.scheduler.stop();
                if self.shutdown.send(ShutdownReason::RemoteStop).await.is_err() {
                    tracing::debug!("Shutdown already in progress");
                }
            }
            CommandKind::Run => match command.arg_str("plugin") {
                Some(name) => {
                    if let Err(e) = self.scheduler.run_now(name) {
                        tracing::warn!(plugin = %name, error = %e, "Cannot run plugin");
                    }
                }
                None => tracing::warn!("run command without args.plugin"),
            },
            CommandKind::Ping => {
                let pong = self.pong();
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctx.publish_result(&pong).await {
                        tracing::error!(error = %e, "Failed to publish pong");
                    }
                });
            }
        }
    }

    fn pong(&self) -> PluginResult {
        PluginResult::new(
            "pong",
            Payload::Structured(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_secs": self.started.elapsed().as_secs(),
                "in_flight": self.scheduler.in_flight(),
                "plugins": self.scheduler.plugin_names(),
            })),
        )
    }
}
