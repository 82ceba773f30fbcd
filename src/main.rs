use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use stm_sensor_link::{
    config::AppConfig,
    externals::{
        config_store::InMemoryConfigStore, event_logging::adapters::TracingAuditSink,
        serial::services::SerialPortDriver,
    },
    models::{command::Command, sensor_key::SensorKey},
    system::LinkSystem,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "stm_sensor_link.toml";
const DEFAULT_USERNAME: &str = "operator";
const CONSOLE_SCREEN: &str = "Console";

/// A line typed by the operator. Lines starting with `:` control the link,
/// anything else is sent to the device verbatim.
#[derive(Debug, PartialEq)]
enum ConsoleInput {
    Connect,
    Disconnect,
    Enable(SensorKey),
    Disable(SensorKey),
    Limits(SensorKey),
    Readings,
    Quit,
    Send(Command),
}

fn parse_console_input(text: &str) -> Result<Option<ConsoleInput>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let Some(control) = text.strip_prefix(':') else {
        return Ok(Some(ConsoleInput::Send(Command::Raw(text.to_owned()))));
    };

    let words: Vec<&str> = control.split_whitespace().collect();
    let input = match words.as_slice() {
        ["connect"] => ConsoleInput::Connect,
        ["disconnect"] => ConsoleInput::Disconnect,
        ["enable", key] => ConsoleInput::Enable(SensorKey::try_from(*key)?),
        ["disable", key] => ConsoleInput::Disable(SensorKey::try_from(*key)?),
        ["limits", key] => ConsoleInput::Limits(SensorKey::try_from(*key)?),
        ["readings"] => ConsoleInput::Readings,
        ["quit"] => ConsoleInput::Quit,
        _ => anyhow::bail!("Unknown console command '{}'.", text),
    };
    Ok(Some(input))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = std::env::args().skip(1);
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.into()));
    let username = args.next().unwrap_or_else(|| DEFAULT_USERNAME.into());

    let config = AppConfig::load(&config_path)?;
    let system = LinkSystem::start(
        config.serial.clone(),
        Arc::new(SerialPortDriver::new(config.device.clone())),
        Arc::new(InMemoryConfigStore::from(&config)),
        Arc::new(TracingAuditSink),
    );

    let state = system.connect().await;
    info!("Connection state: {}", state);
    system.login(&username);

    let origin = system
        .origin(CONSOLE_SCREEN)
        .ok_or_else(|| anyhow::anyhow!("No operator logged in."))?;
    let mut lines = system.broadcaster.latest_lines();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to listen for ctrl_c. Error: {}", e);
                }
                break;
            },
            Some(line) = lines.next() => {
                println!("{}", line);
            },
            input = stdin.next_line() => {
                let text = match input {
                    Ok(Some(text)) => text,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read from stdin. Error: {}", e);
                        break;
                    }
                };
                match parse_console_input(&text) {
                    Ok(None) => {}
                    Ok(Some(ConsoleInput::Quit)) => break,
                    Ok(Some(ConsoleInput::Connect)) => {
                        let state = system.connect().await;
                        info!("Connection state: {}", state);
                    },
                    Ok(Some(ConsoleInput::Disconnect)) => system.session.close(),
                    Ok(Some(ConsoleInput::Enable(key))) => system.scheduler.enable(&key),
                    Ok(Some(ConsoleInput::Disable(key))) => system.scheduler.disable(&key),
                    Ok(Some(ConsoleInput::Limits(key))) => {
                        if let Some(range) =
                            system.push_current_limits(CONSOLE_SCREEN, &key).await
                        {
                            info!(
                                "Sent current limits {}..{} for {}.",
                                range.min, range.max, key
                            );
                        }
                    },
                    Ok(Some(ConsoleInput::Readings)) => {
                        let mut readings: Vec<_> =
                            system.broadcaster.readings().into_iter().collect();
                        readings.sort_by(|a, b| a.0.cmp(&b.0));
                        for (key, value) in readings {
                            println!("{} = {}", key, value);
                        }
                    },
                    Ok(Some(ConsoleInput::Send(command))) => {
                        system.dispatcher.send(&origin, command).await;
                    },
                    Err(e) => warn!("{}", e),
                }
            },
        }
    }

    system.shutdown().await;
    Ok(())
}
