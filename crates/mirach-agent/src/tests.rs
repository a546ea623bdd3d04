use crate::error::AgentError;
use crate::plugin::{ExternalPlugin, InternalPlugin, Plugin, PluginError};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::transport::{PublishContext, Publisher};
use async_trait::async_trait;
use mirach_common::codec::{self, Reassembled};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TOPIC: &str = "mirach/data/cust/asset";

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    panic_on_publish: AtomicBool,
}

impl RecordingPublisher {
    fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<String> {
        self.messages()
            .iter()
            .map(|(_, body)| codec::decode(body).unwrap().kind)
            .collect()
    }

    fn count_of(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> crate::error::Result<()> {
        if self.panic_on_publish.load(Ordering::SeqCst) {
            panic!("broker client blew up");
        }
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

fn context(publisher: &Arc<RecordingPublisher>, chunk_size: usize) -> Arc<PublishContext> {
    Arc::new(PublishContext::new(publisher.clone(), TOPIC, chunk_size))
}

fn sh(name: &str, schedule: &str, script: &str) -> Plugin {
    Plugin::External(ExternalPlugin {
        name: name.into(),
        label: name.into(),
        schedule: schedule.into(),
        cmd: "sh".into(),
        args: vec!["-c".into(), script.into()],
        timeout: None,
    })
}

async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn internal_plugin_publishes_data_message() {
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(&publisher, codec::CHUNK_SIZE);
    let plugin = Plugin::Internal(InternalPlugin::new("load", "@every 1m", "load", || {
        Ok(r#"{"avg":1.2}"#.to_string())
    }));

    plugin.run(&ctx).await;

    let sent = publisher.messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, TOPIC);
    assert_eq!(sent[0].1, br#"{"type":"load","data":{"avg":1.2}}"#.to_vec());
}

#[tokio::test]
async fn large_external_output_is_chunked() {
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(&publisher, 1000);
    // {"type":"big","data":""} is 24 bytes of framing
    let plugin = sh("big", "@every 1m", r#"printf '"%s"' "$(head -c 2976 /dev/zero | tr '\0' x)""#);

    plugin.run(&ctx).await;

    let sent = publisher.messages();
    assert_eq!(sent.len(), 1);
    let message = codec::decode(&sent[0].1).unwrap();
    match &message.body {
        mirach_common::types::MessageBody::Chunks(chunks) => {
            let sizes: Vec<usize> = chunks.iter().map(String::len).collect();
            assert_eq!(sizes, vec![1000, 1000, 1000]);
        }
        other => panic!("expected chunks, got {}", other.name()),
    }
    match codec::reassemble(&message).unwrap() {
        Reassembled::Result(result) => {
            assert_eq!(result.kind, "big");
            assert_eq!(result.data.to_value().unwrap().as_str().unwrap().len(), 2976);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn non_json_output_publishes_nothing() {
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(&publisher, codec::CHUNK_SIZE);
    let plugin = sh("broken", "@every 1m", "echo 'this is not json'");

    let err = plugin.execute().await.unwrap_err();
    assert!(matches!(err, PluginError::Decode(_)));

    plugin.run(&ctx).await;
    assert!(publisher.messages().is_empty());
}

#[tokio::test]
async fn failing_exit_status_publishes_nothing() {
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(&publisher, codec::CHUNK_SIZE);
    let plugin = sh("partial", "@every 1m", r#"printf '{"a":1}'; echo oops >&2; exit 3"#);

    match plugin.execute().await.unwrap_err() {
        PluginError::ExitStatus { stderr, .. } => assert_eq!(stderr, "oops"),
        other => panic!("expected exit status error, got {other}"),
    }

    plugin.run(&ctx).await;
    assert!(publisher.messages().is_empty());
}

#[tokio::test]
async fn hung_command_is_killed_after_timeout() {
    let plugin = ExternalPlugin {
        name: "hang".into(),
        label: "hang".into(),
        schedule: "@every 1m".into(),
        cmd: "sleep".into(),
        args: vec!["30".into()],
        timeout: Some(Duration::from_millis(200)),
    };
    let started = Instant::now();
    let err = plugin.execute().await.unwrap_err();
    assert!(matches!(err, PluginError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn unparsable_schedule_fails_registration() {
    let publisher = Arc::new(RecordingPublisher::default());
    let mut scheduler = Scheduler::new(context(&publisher, codec::CHUNK_SIZE));
    let err = scheduler
        .register(sh("bad", "every now and then", "true"))
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidSchedule { .. }));
    assert!(scheduler.is_empty());

    scheduler.register(sh("ok", "@every 1m", "true")).unwrap();
    let err = scheduler.register(sh("ok", "@every 2m", "true")).unwrap_err();
    assert!(matches!(err, AgentError::DuplicatePlugin(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_runs_keep_firing() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("runs");
    let publisher = Arc::new(RecordingPublisher::default());
    let mut scheduler = Scheduler::new(context(&publisher, codec::CHUNK_SIZE));
    scheduler
        .register(sh(
            "garbled",
            "@every 100ms",
            &format!("echo run >> {}; echo not-json", marker.display()),
        ))
        .unwrap();
    let handle = scheduler.start();

    let runs = || {
        std::fs::read_to_string(&marker)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    };
    assert!(wait_until(Duration::from_secs(5), || runs() >= 3).await);
    handle.stop();
    assert!(publisher.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_plugin_does_not_delay_others() {
    let publisher = Arc::new(RecordingPublisher::default());
    let mut scheduler = Scheduler::new(context(&publisher, codec::CHUNK_SIZE));
    scheduler
        .register(Plugin::Internal(InternalPlugin::new("slow", "@every 100ms", "slow", || {
            std::thread::sleep(Duration::from_secs(2));
            Ok("{}".to_string())
        })))
        .unwrap();
    scheduler
        .register(Plugin::Internal(InternalPlugin::new("fast", "@every 100ms", "fast", || {
            Ok("{}".to_string())
        })))
        .unwrap();
    let handle = scheduler.start();

    assert!(wait_until(Duration::from_secs(1), || publisher.count_of("fast") >= 4).await);
    assert_eq!(publisher.count_of("slow"), 0);
    // overlapping firings of the slow plugin are allowed
    assert!(handle.in_flight() >= 2);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_run_is_contained() {
    let publisher = Arc::new(RecordingPublisher::default());
    publisher.panic_on_publish.store(true, Ordering::SeqCst);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut scheduler = Scheduler::new(context(&publisher, codec::CHUNK_SIZE));
    scheduler
        .register(Plugin::Internal(InternalPlugin::new("boom", "@every 100ms", "boom", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("{}".to_string())
        })))
        .unwrap();
    let handle = scheduler.start();

    assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 3).await);
    assert_eq!(handle.state(), SchedulerState::Running);

    publisher.panic_on_publish.store(false, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || publisher.count_of("boom") >= 1).await);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_lets_in_flight_run_finish() {
    let publisher = Arc::new(RecordingPublisher::default());
    let mut scheduler = Scheduler::new(context(&publisher, codec::CHUNK_SIZE));
    scheduler
        .register(Plugin::Internal(InternalPlugin::new("report", "@every 1h", "report", || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(r#"{"done":true}"#.to_string())
        })))
        .unwrap();
    let handle = scheduler.start();

    let run = handle.run_now("report").unwrap();
    assert!(handle.stop());
    assert!(!handle.stop());
    assert_eq!(handle.state(), SchedulerState::Stopped);
    assert_eq!(handle.in_flight(), 1);

    run.await.unwrap();
    assert_eq!(handle.in_flight(), 0);
    assert_eq!(publisher.count_of("report"), 1);

    assert!(matches!(
        handle.run_now("report"),
        Err(AgentError::SchedulerStopped)
    ));
}

#[tokio::test]
async fn run_now_rejects_unknown_plugin() {
    let publisher = Arc::new(RecordingPublisher::default());
    let handle = Scheduler::new(context(&publisher, codec::CHUNK_SIZE)).start();
    assert!(matches!(
        handle.run_now("nope"),
        Err(AgentError::UnknownPlugin(name)) if name == "nope"
    ));
    assert!(handle.plugin_names().is_empty());
}
