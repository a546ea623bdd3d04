use crate::error::{AgentError, Result};
use crate::plugin::Plugin;
use crate::transport::PublishContext;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// When a plugin fires.
///
/// Accepts cron expressions with five fields (minute precision), six or
/// seven fields (leading seconds, optional trailing year), the `@hourly`
/// style shorthands, and `@every <duration>` with `ms`, `s`, `m` and `h`
/// units, e.g. `@every 1h30m`.
///
/// # Examples
///
/// ```
/// use mirach_agent::scheduler::Cadence;
/// use std::time::Duration;
///
/// let every: Cadence = "@every 1m30s".parse().unwrap();
/// assert_eq!(every, Cadence::Every(Duration::from_secs(90)));
/// assert!("*/15 * * * *".parse::<Cadence>().is_ok());
/// assert!("every minute".parse::<Cadence>().is_err());
/// ```
#[derive(Debug, Clone)]
pub enum Cadence {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cadence::Cron(a), Cadence::Cron(b)) => a.to_string() == b.to_string(),
            (Cadence::Every(a), Cadence::Every(b)) => a == b,
            _ => false,
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("@every") {
            return parse_every(rest.trim()).map(Cadence::Every);
        }
        let expr = if s.split_whitespace().count() == 5 {
            format!("0 {s}")
        } else {
            s.to_string()
        };
        cron::Schedule::from_str(&expr)
            .map(|schedule| Cadence::Cron(Box::new(schedule)))
            .map_err(|e| e.to_string())
    }
}

impl Cadence {
    /// First firing strictly after `after`, or `None` if there is none left.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron(schedule) => schedule.after(&after).next(),
            Cadence::Every(every) => chrono::Duration::from_std(*every)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
        }
    }
}

fn parse_every(s: &str) -> std::result::Result<Duration, String> {
    if s.is_empty() {
        return Err("@every needs a duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number in '{s}'"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number too large in '{s}'"))?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "" => return Err(format!("missing unit in '{s}'")),
            unit => return Err(format!("unknown unit '{unit}' in '{s}'")),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    if total.is_zero() {
        return Err("@every duration must be positive".to_string());
    }
    Ok(total)
}

/// State of a started scheduler. An unstarted [`Scheduler`] is the idle
/// state; [`Scheduler::start`] consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    /// Terminal; a stopped scheduler cannot be restarted.
    Stopped,
}

struct Job {
    plugin: Arc<Plugin>,
    cadence: Cadence,
}

/// Collects plugins before start. Consumed by [`Scheduler::start`].
pub struct Scheduler {
    ctx: Arc<PublishContext>,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(ctx: Arc<PublishContext>) -> Self {
        Self {
            ctx,
            jobs: Vec::new(),
        }
    }

    /// Adds a plugin. An unparsable schedule or a reused name is an error.
    pub fn register(&mut self, plugin: Plugin) -> Result<()> {
        let cadence: Cadence =
            plugin
                .schedule()
                .parse()
                .map_err(|reason| AgentError::InvalidSchedule {
                    plugin: plugin.name().to_string(),
                    schedule: plugin.schedule().to_string(),
                    reason,
                })?;
        if self.jobs.iter().any(|j| j.plugin.name() == plugin.name()) {
            return Err(AgentError::DuplicatePlugin(plugin.name().to_string()));
        }
        tracing::debug!(
            plugin = %plugin.name(),
            schedule = %plugin.schedule(),
            "Registered plugin"
        );
        self.jobs.push(Job {
            plugin: Arc::new(plugin),
            cadence,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Spawns one timer task per plugin. Must be called inside a tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            ctx: self.ctx,
            plugins: self.jobs.iter().map(|j| j.plugin.clone()).collect(),
            stop: stop_tx,
            in_flight: AtomicUsize::new(0),
        });

        for job in self.jobs {
            tokio::spawn(timer(shared.clone(), job));
        }
        tracing::info!(plugins = shared.plugins.len(), "Scheduler started");

        SchedulerHandle { shared }
    }
}

struct Shared {
    ctx: Arc<PublishContext>,
    plugins: Vec<Arc<Plugin>>,
    stop: watch::Sender<bool>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Runs one execution in its own task so a panic stays contained.
    fn fire(self: &Arc<Self>, plugin: Arc<Plugin>) -> JoinHandle<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();
        tokio::spawn(async move {
            let name = plugin.name().to_string();
            let ctx = shared.ctx.clone();
            let run = tokio::spawn(async move { plugin.run(&ctx).await });
            if let Err(e) = run.await {
                if e.is_panic() {
                    tracing::error!(plugin = %name, "Plugin run panicked");
                } else {
                    tracing::warn!(plugin = %name, error = %e, "Plugin run cancelled");
                }
            }
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

async fn timer(shared: Arc<Shared>, job: Job) {
    let mut stop_rx = shared.stop.subscribe();
    let mut cursor = Utc::now();

    while !*stop_rx.borrow() {
        let Some(next) = job.cadence.next_after(cursor) else {
            tracing::info!(plugin = %job.plugin.name(), "Schedule has no further firings");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        if *stop_rx.borrow() {
            break;
        }
        tracing::trace!(plugin = %job.plugin.name(), "Firing plugin");
        shared.fire(job.plugin.clone());
        // skip firings missed while the runtime was busy
        cursor = next.max(Utc::now());
    }
    tracing::debug!(plugin = %job.plugin.name(), "Timer stopped");
}

/// Control surface of a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Halts future firings. In-flight runs are left to finish.
    /// Returns `false` if the scheduler was already stopped.
    pub fn stop(&self) -> bool {
        let was_running = !self.shared.stop.send_replace(true);
        if was_running {
            tracing::info!(
                in_flight = self.in_flight(),
                "Scheduler stopped"
            );
        }
        was_running
    }

    pub fn state(&self) -> SchedulerState {
        if self.shared.is_stopped() {
            SchedulerState::Stopped
        } else {
            SchedulerState::Running
        }
    }

    /// Fires `name` immediately, outside its schedule.
    pub fn run_now(&self, name: &str) -> Result<JoinHandle<()>> {
        if self.shared.is_stopped() {
            return Err(AgentError::SchedulerStopped);
        }
        let plugin = self
            .shared
            .plugins
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownPlugin(name.to_string()))?;
        tracing::info!(plugin = %name, "Running plugin on demand");
        Ok(self.shared.fire(plugin))
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.shared
            .plugins
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Executions started but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }
}
