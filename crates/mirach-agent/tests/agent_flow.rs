mod common;

use anyhow::Result;
use common::{big_string_script, config_with, start_agent, wait_until, StubSubscriber};
use mirach_agent::agent::ShutdownReason;
use mirach_agent::error::AgentError;
use mirach_agent::scheduler::SchedulerState;
use mirach_agent::transport::Inbound;
use mirach_common::types::MessageBody;
use std::future::pending;
use std::time::Duration;

const HOURLY_ECHO: &str = r#"
[plugins.echo]
cmd = "sh"
args = ["-c", "printf '{\"n\":1}'"]
schedule = "@every 1h"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_command_shuts_agent_down() -> Result<()> {
    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;
    let scheduler = test.agent.scheduler().clone();

    test.send_command(r#"{"type":"stop"}"#).await?;
    let reason = tokio::time::timeout(Duration::from_secs(5), test.agent.wait(pending()))
        .await??;

    assert_eq!(reason, ShutdownReason::RemoteStop);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(
        *test.subscriber.topics.lock().unwrap(),
        vec!["mirach/cmd/cust/asset".to_string()]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_alias_and_interrupt() -> Result<()> {
    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;
    let reason = test
        .agent
        .wait(async { ShutdownReason::Interrupt })
        .await?;
    assert_eq!(reason, ShutdownReason::Interrupt);

    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;
    test.send_command(r#"{"type":"shutdown"}"#).await?;
    let reason = tokio::time::timeout(Duration::from_secs(5), test.agent.wait(pending()))
        .await??;
    assert_eq!(reason, ShutdownReason::RemoteStop);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_command_fires_plugin_once() -> Result<()> {
    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;

    test.send_command(r#"{"type":"run","args":{"plugin":"echo"}}"#)
        .await?;
    assert!(wait_until(Duration::from_secs(5), || test.publisher.messages().len() == 1).await);

    let (topic, body) = &test.publisher.messages()[0];
    assert_eq!(topic, "mirach/data/cust/asset");
    assert_eq!(body.as_slice(), br#"{"type":"echo","data":{"n":1}}"#);

    // unknown plugins and a missing name are logged, not fatal
    test.send_command(r#"{"type":"run","args":{"plugin":"nope"}}"#)
        .await?;
    test.send_command(r#"{"type":"run"}"#).await?;
    test.send_command(r#"{"type":"stop"}"#).await?;
    let reason = tokio::time::timeout(Duration::from_secs(5), test.agent.wait(pending()))
        .await??;
    assert_eq!(reason, ShutdownReason::RemoteStop);
    assert_eq!(test.publisher.messages().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_commands_are_discarded() -> Result<()> {
    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;

    test.send_command("not json at all").await?;
    test.send_command(r#"{"type":"reboot"}"#).await?;
    test.send_command(r#"{"args":{}}"#).await?;
    test.inbound
        .send(Inbound::Message {
            topic: "mirach/cmd/other/asset".to_string(),
            payload: br#"{"type":"stop"}"#.to_vec(),
        })
        .await?;
    test.send_command(r#"{"type":"ping"}"#).await?;

    assert!(wait_until(Duration::from_secs(5), || !test.publisher.messages().is_empty()).await);
    let results = test.publisher.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, "pong");
    let pong = results[0].data.to_value()?;
    assert_eq!(pong["plugins"], serde_json::json!(["echo"]));
    assert!(pong["version"].is_string());

    assert_eq!(test.agent.scheduler().state(), SchedulerState::Running);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_subscription_is_fatal() -> Result<()> {
    let subscriber = StubSubscriber {
        refuse: true,
        ..Default::default()
    };
    let test = start_agent(config_with(HOURLY_ECHO)?, subscriber)?;
    let scheduler = test.agent.scheduler().clone();

    let err = tokio::time::timeout(Duration::from_secs(5), test.agent.wait(pending()))
        .await?
        .unwrap_err();
    assert!(matches!(err, AgentError::Subscription { .. }));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_rejection_and_closed_stream_are_fatal() -> Result<()> {
    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;
    test.inbound
        .send(Inbound::SubscribeRejected { pkid: 1 })
        .await?;
    let err = tokio::time::timeout(Duration::from_secs(5), test.agent.wait(pending()))
        .await?
        .unwrap_err();
    assert!(matches!(err, AgentError::Subscription { .. }));

    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;
    let common::TestAgent { agent, inbound, .. } = test;
    drop(inbound);
    let err = tokio::time::timeout(Duration::from_secs(5), agent.wait(pending()))
        .await?
        .unwrap_err();
    assert!(err.to_string().contains("inbound channel closed"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrenewed_subscription_after_reconnect_is_fatal() -> Result<()> {
    let test = start_agent(config_with(HOURLY_ECHO)?, StubSubscriber::default())?;
    let scheduler = test.agent.scheduler().clone();
    test.inbound
        .send(Inbound::SubscriptionLost {
            topic: "mirach/cmd/cust/asset".to_string(),
            reason: "request channel closed".to_string(),
        })
        .await?;

    let err = tokio::time::timeout(Duration::from_secs(5), test.agent.wait(pending()))
        .await?
        .unwrap_err();
    match err {
        AgentError::Subscription { topic, reason } => {
            assert_eq!(topic, "mirach/cmd/cust/asset");
            assert!(reason.contains("request channel closed"));
        }
        other => panic!("expected a subscription error, got {other}"),
    }
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_output_goes_out_as_one_chunks_message() -> Result<()> {
    // {"type":"bulk","data":""} is 25 bytes, so the result is 300,000 bytes
    let plugins = format!(
        r#"
        [plugins.bulk]
        cmd = "sh"
        args = ["-c", '''
{}
''']
        schedule = "@every 1h"
        "#,
        big_string_script(299_975)
    );
    let test = start_agent(config_with(&plugins)?, StubSubscriber::default())?;

    test.send_command(r#"{"type":"run","args":{"plugin":"bulk"}}"#)
        .await?;
    assert!(wait_until(Duration::from_secs(10), || test.publisher.messages().len() == 1).await);

    let decoded = test.publisher.decoded();
    assert_eq!(decoded[0].kind, "bulk");
    let MessageBody::Chunks(chunks) = &decoded[0].body else {
        panic!("expected a chunks message, got {}", decoded[0].body.name());
    };
    let sizes: Vec<usize> = chunks.iter().map(String::len).collect();
    assert_eq!(sizes, vec![120_000, 120_000, 60_000]);

    let results = test.publisher.results();
    assert_eq!(results[0].kind, "bulk");
    assert_eq!(results[0].data.to_value()?.as_str().map(str::len), Some(299_975));
    Ok(())
}

#[tokio::test]
async fn invalid_schedule_prevents_start() -> Result<()> {
    let config = config_with(
        r#"
        [plugins.good]
        probe = "load"
        schedule = "@every 1m"

        [plugins.typo]
        probe = "sys"
        schedule = "*/5 * * *"
        "#,
    )?;
    let err = start_agent(config, StubSubscriber::default()).err().unwrap();
    let err = err.downcast::<AgentError>()?;
    assert!(matches!(err, AgentError::InvalidSchedule { ref plugin, .. } if plugin == "typo"));
    Ok(())
}
