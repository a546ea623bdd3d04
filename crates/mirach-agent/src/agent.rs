use crate::commands::CommandListener;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::logging::Feedback;
use crate::plugin::build_plugins;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::transport::{Inbound, MqttTransport, PublishContext, Publisher, Subscriber};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Why the agent stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// A `stop` command arrived on the command topic.
    RemoteStop,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate signal"),
            ShutdownReason::RemoteStop => write!(f, "remote stop command"),
        }
    }
}

/// A running agent: scheduler firing plus command listener subscribed.
pub struct Agent {
    scheduler: SchedulerHandle,
    listener: JoinHandle<Result<()>>,
    shutdown_rx: mpsc::Receiver<ShutdownReason>,
    command_topic: String,
}

impl Agent {
    /// Builds every configured plugin, starts the scheduler and spawns the
    /// command listener. Nothing fires if any plugin fails to register.
    pub fn start(
        config: &AgentConfig,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Result<Self> {
        let ctx = Arc::new(PublishContext::from_config(config, publisher));

        let mut scheduler = Scheduler::new(ctx.clone());
        for plugin in build_plugins(config)? {
            scheduler.register(plugin)?;
        }
        if scheduler.is_empty() {
            tracing::warn!("No plugins configured; only commands will be served");
        }
        let scheduler = scheduler.start();

        let command_topic = config.command_topic();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let listener =
            CommandListener::new(command_topic.clone(), scheduler.clone(), ctx, shutdown_tx);
        let listener =
            tokio::spawn(async move { listener.run(subscriber.as_ref(), inbound).await });

        tracing::info!(
            data_topic = %config.data_topic(),
            command_topic = %command_topic,
            plugins = ?scheduler.plugin_names(),
            "Agent started"
        );

        Ok(Self {
            scheduler,
            listener,
            shutdown_rx,
            command_topic,
        })
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Blocks until `interrupt` resolves, a stop command arrives, or the
    /// command listener fails. The scheduler is stopped in every case;
    /// in-flight runs are not awaited.
    pub async fn wait<F>(mut self, interrupt: F) -> Result<ShutdownReason>
    where
        F: Future<Output = ShutdownReason>,
    {
        let outcome = tokio::select! {
            reason = interrupt => Ok(reason),
            Some(reason) = self.shutdown_rx.recv() => Ok(reason),
            joined = &mut self.listener => match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(AgentError::Subscription {
                    topic: self.command_topic.clone(),
                    reason: "command listener exited".to_string(),
                }),
                Err(e) => Err(AgentError::Subscription {
                    topic: self.command_topic.clone(),
                    reason: format!("command listener crashed: {e}"),
                }),
            },
        };

        self.scheduler.stop();
        self.listener.abort();
        match &outcome {
            Ok(reason) => tracing::info!(reason = %reason, "Agent shutting down"),
            Err(e) => tracing::error!(error = %e, "Agent shutting down"),
        }
        outcome
    }
}

/// Connects to the broker and runs until shutdown.
pub async fn run(config: &AgentConfig, feedback: &Feedback) -> Result<ShutdownReason> {
    let (transport, inbound) = MqttTransport::connect(config).await?;
    let transport = Arc::new(transport);

    let agent = Agent::start(config, transport.clone(), transport.clone(), inbound)?;
    feedback.report("mirach entered running state; plugins loaded", None);

    let outcome = agent.wait(wait_for_signal()).await;
    transport.disconnect().await;
    outcome
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
pub async fn wait_for_signal() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = signal::ctrl_c() => ShutdownReason::Interrupt,
                _ = term.recv() => ShutdownReason::Terminate,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                ShutdownReason::Interrupt
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        ShutdownReason::Interrupt
    }
}
