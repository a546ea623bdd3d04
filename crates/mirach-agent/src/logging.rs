use std::fmt::Display;
use tracing_subscriber::EnvFilter;

/// Crate targets whose level follows the verbosity setting.
const TARGETS: &[&str] = &["mirach", "mirach_agent", "mirach_collector", "mirach_common"];

/// Log filter for a verbosity level: 0 warnings only, 1 info, 2 and up trace.
///
/// # Examples
///
/// ```
/// use mirach_agent::logging::filter_directives;
///
/// assert_eq!(filter_directives(0), "warn");
/// assert!(filter_directives(1).contains("mirach_agent=info"));
/// assert!(filter_directives(3).contains("mirach=trace"));
/// ```
pub fn filter_directives(verbosity: u8) -> String {
    let level = match verbosity {
        0 => return "warn".to_string(),
        1 => "info",
        _ => "trace",
    };
    std::iter::once("warn".to_string())
        .chain(TARGETS.iter().map(|t| format!("{t}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Installs the global subscriber. `RUST_LOG`, when set, wins over `verbosity`.
pub fn init(verbosity: u8) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(filter_directives(verbosity)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity > 1)
        .try_init();
}

/// The single top-level channel for operator-facing messages.
///
/// Quiet mode prints the message on stdout; verbose modes route it through
/// the log at info, or at error when an error is attached.
#[derive(Debug, Clone, Copy)]
pub struct Feedback {
    verbosity: u8,
}

impl Feedback {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    pub fn is_quiet(&self) -> bool {
        self.verbosity == 0
    }

    #[allow(clippy::print_stdout)]
    pub fn report(&self, msg: &str, err: Option<&dyn Display>) {
        match (self.is_quiet(), err) {
            (false, Some(err)) => tracing::error!(error = %err, "{msg}"),
            (false, None) => tracing::info!("{msg}"),
            (true, Some(err)) => println!("{msg}: {err}"),
            (true, None) => println!("{msg}"),
        }
    }
}

/// Truncate text to at most `max` bytes, snapping to a char boundary.
pub fn truncate_text(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
