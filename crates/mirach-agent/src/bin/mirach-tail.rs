use anyhow::{anyhow, bail, Result};
use mirach_agent::config::AgentConfig;
use mirach_agent::logging;
use mirach_agent::transport::{Inbound, MqttTransport, Subscriber};
use mirach_common::codec::{self, Reassembled};
use serde_json::json;
use std::env;
use std::path::PathBuf;
use tokio::signal;

struct Config {
    config_path: Option<PathBuf>,
    topic: Option<String>,
    wire: bool,
}

enum CliAction {
    Run(Config),
    Help,
}

fn usage() {
    println!(
        "Usage:\n  mirach-tail [options] [config.toml]\n\nPrints every result published to the asset's data topic as one JSON line,\nreassembling chunked messages.\n\nOptions:\n  -c, --config <path>  agent config file (default: same search as mirach)\n  --topic <topic>      subscribe to this topic instead of the data topic\n  --wire               print a summary of each wire message instead\n  -h, --help           show this help"
    );
}

fn parse_cli() -> Result<CliAction> {
    let mut config = Config {
        config_path: None,
        topic: None,
        wire: false,
    };
    let mut args = env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-c" | "--config" => {
                config.config_path = Some(PathBuf::from(next_value(&mut args, "--config")?));
            }
            "--topic" => config.topic = Some(next_value(&mut args, "--topic")?),
            "--wire" => config.wire = true,
            other if other.starts_with('-') => bail!("unknown argument: {other}"),
            path => config.config_path = Some(PathBuf::from(path)),
        }
    }

    Ok(CliAction::Run(config))
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| anyhow!("missing value for {flag}"))
}

/// Renders one received payload as an output line.
fn render(payload: &[u8], wire: bool) -> Result<String> {
    let message = codec::decode(payload)?;
    if wire {
        let fragments = match &message.body {
            mirach_common::types::MessageBody::Chunks(chunks) => chunks.len(),
            _ => 0,
        };
        return Ok(json!({
            "type": message.kind,
            "body": message.body.name(),
            "bytes": payload.len(),
            "fragments": fragments,
        })
        .to_string());
    }
    match codec::reassemble(&message)? {
        Reassembled::Result(result) => Ok(serde_json::to_string(&result)?),
        Reassembled::Reference { kind, url } => Ok(json!({ "type": kind, "url": url }).to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(0);

    let config = match parse_cli()? {
        CliAction::Run(config) => config,
        CliAction::Help => {
            usage();
            return Ok(());
        }
    };

    let path = match config.config_path {
        Some(path) => path,
        None => AgentConfig::find_in_dirs(&AgentConfig::search_dirs())?,
    };
    let mut agent_config = AgentConfig::load(&path)?;
    // never collide with the running agent's session
    agent_config.broker.client_id = Some(format!("{}-tail", agent_config.client_id()));
    let topic = config.topic.unwrap_or_else(|| agent_config.data_topic());

    let (transport, mut inbound) = MqttTransport::connect(&agent_config).await?;
    transport.subscribe(&topic).await?;
    eprintln!("tailing {topic}");

    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(Inbound::Message { payload, .. }) => match render(&payload, config.wire) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("undecodable message ({} bytes): {e}", payload.len()),
                },
                Some(Inbound::SubscribeRejected { .. }) => {
                    transport.disconnect().await;
                    bail!("broker rejected subscription to {topic}");
                }
                Some(Inbound::SubscriptionLost { topic, reason }) => {
                    transport.disconnect().await;
                    bail!("lost subscription to {topic}: {reason}");
                }
                None => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }

    transport.disconnect().await;
    Ok(())
}
