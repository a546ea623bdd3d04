use anyhow::{anyhow, bail, Result};
use mirach_agent::agent;
use mirach_agent::config::AgentConfig;
use mirach_agent::logging::{self, Feedback};
use std::env;
use std::path::PathBuf;

const DEFAULT_VERBOSITY: u8 = 1;

struct Cli {
    config_path: Option<PathBuf>,
    verbosity: Option<u8>,
}

enum CliAction {
    Run(Cli),
    Help,
    Version,
}

fn usage() {
    println!(
        "Usage:\n  mirach [options] [config.toml]\n\nOptions:\n  -c, --config <path>  config file (default: search ., ~/.config/mirach, /etc/mirach)\n  -v                   more log detail, repeat for trace (-vv)\n  -q, --quiet          only top-level feedback\n  -V, --version        print version\n  -h, --help           show this help\n\nEnvironment:\n  MIRACH_VERBOSITY     0 quiet, 1 info, 2 trace (flags win)\n  MIRACH_CUSTOMER_ID, MIRACH_ASSET_ID, MIRACH_BROKER_HOST, MIRACH_BROKER_PORT\n  RUST_LOG             full tracing filter, overrides verbosity"
    );
}

fn parse_cli() -> Result<CliAction> {
    parse_args(env::args().skip(1))
}

fn parse_args<I>(args: I) -> Result<CliAction>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        config_path: None,
        verbosity: None,
    };
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            "-q" | "--quiet" => cli.verbosity = Some(0),
            "-c" | "--config" => {
                cli.config_path = Some(PathBuf::from(next_value(&mut args, "--config")?));
            }
            flag if flag.starts_with("-v") && flag[1..].chars().all(|c| c == 'v') => {
                let count = u8::try_from(flag.len() - 1).unwrap_or(u8::MAX);
                cli.verbosity = Some(count.saturating_add(cli.verbosity.unwrap_or(0)));
            }
            other if other.starts_with('-') => bail!("unknown argument: {other}"),
            path => {
                if cli.config_path.is_some() {
                    bail!("more than one config path given");
                }
                cli.config_path = Some(PathBuf::from(path));
            }
        }
    }

    Ok(CliAction::Run(cli))
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| anyhow!("missing value for {flag}"))
}

fn env_verbosity() -> Result<Option<u8>> {
    match env::var("MIRACH_VERBOSITY") {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("MIRACH_VERBOSITY must be 0-255, got '{value}'")),
        Err(_) => Ok(None),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AgentConfig> {
    let path = match path {
        Some(path) => path,
        None => AgentConfig::find_in_dirs(&AgentConfig::search_dirs())?,
    };
    tracing::info!(path = %path.display(), "Loading config");
    Ok(AgentConfig::load(&path)?)
}

#[tokio::main]
async fn main() {
    let cli = match parse_cli() {
        Ok(CliAction::Run(cli)) => cli,
        Ok(CliAction::Help) => {
            usage();
            return;
        }
        Ok(CliAction::Version) => {
            println!("mirach {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Err(e) => {
            eprintln!("{e}");
            usage();
            std::process::exit(2);
        }
    };

    let verbosity = match cli.verbosity {
        Some(v) => v,
        None => match env_verbosity() {
            Ok(v) => v.unwrap_or(DEFAULT_VERBOSITY),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        },
    };
    logging::init(verbosity);
    let feedback = Feedback::new(verbosity);

    let config = match load_config(cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            feedback.report("failed to load configuration", Some(&e));
            std::process::exit(1);
        }
    };
    tracing::info!(
        customer = %config.customer.id,
        asset = %config.asset.id,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        "mirach starting"
    );

    match agent::run(&config, &feedback).await {
        Ok(reason) => {
            feedback.report(&format!("mirach stopped ({reason})"), None);
        }
        Err(e) => {
            feedback.report("mirach failed", Some(&e));
        }
    }
    // the process never resumes after the agent stops, for any reason
    std::process::exit(1);
}
