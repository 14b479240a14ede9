pub mod cli;

use std::io;

use anyhow::{anyhow, Result};
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use log::error;
use tokio::sync::mpsc;

use dooya_lib::bus::{Bus, BusConfig, SerialTransport};
use dooya_lib::device::{Channel, CurtainDevice, DeviceStatus, StateUpdate};
use dooya_lib::protocol::{DeviceAddress, Direction, MotionState};

use cli::{Cli, Commands, StructOpt};

enum OutputFormat {
    Plain,
    Json,
}

type Updates = mpsc::UnboundedReceiver<(DeviceAddress, StateUpdate)>;

async fn cmd_status(
    device: &CurtainDevice,
    updates: &mut Updates,
    fmt: OutputFormat,
) -> Result<String> {
    device.link(Channel::Position);
    device.link(Channel::Motion);
    device.link(Channel::Direction);
    device.poll_once().await;

    let mut position: Option<u8> = None;
    let mut motion: Option<MotionState> = None;
    let mut direction: Option<Direction> = None;
    while let Ok((_, update)) = updates.try_recv() {
        match update {
            StateUpdate::Position(p) => position = Some(p),
            StateUpdate::Motion(m) => motion = Some(m),
            StateUpdate::Direction(d) => direction = Some(d),
            _ => {}
        }
    }

    if position.is_none() && motion.is_none() && direction.is_none() {
        return Err(anyhow!("no valid answer from {}", device.address()));
    }

    Ok(match fmt {
        OutputFormat::Plain => {
            let mut lines = Vec::new();
            if let Some(p) = position {
                lines.push(format!("position {}", p));
            }
            if let Some(m) = motion {
                lines.push(format!("state {}", m));
            }
            if let Some(d) = direction {
                lines.push(format!("direction {}", d));
            }
            lines.join("\n")
        }
        OutputFormat::Json => {
            let mut obj = json::JsonValue::new_object();
            if let Some(p) = position {
                obj["position"] = p.into();
            }
            if let Some(m) = motion {
                obj["state"] = m.to_string().into();
            }
            if let Some(d) = direction {
                obj["direction"] = d.to_string().into();
            }
            obj.dump()
        }
    })
}

async fn cmd_probe(
    device: &CurtainDevice,
    updates: &mut Updates,
    fmt: OutputFormat,
) -> Result<String> {
    match device.init().await {
        DeviceStatus::Online => {
            let mut version = None;
            while let Ok((_, update)) = updates.try_recv() {
                if let StateUpdate::Version(v) = update {
                    version = Some(v);
                }
            }
            let version = version.ok_or_else(|| anyhow!("no version in probe answer"))?;
            Ok(match fmt {
                OutputFormat::Plain => format!("version {}", version),
                OutputFormat::Json => json::stringify(version),
            })
        }
        DeviceStatus::Offline(reason) => Err(anyhow!("device offline: {}", reason)),
        DeviceStatus::Unknown => Err(anyhow!("bus did not come up")),
    }
}

#[tokio::main]
async fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut cli::Cli::command(),
            "dooya-tool",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let bus = Bus::start(
        SerialTransport::new(&cli.port, cli.force),
        BusConfig::default(),
    );
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let device = CurtainDevice::new(cli.command.address(), bus.handle(), updates_tx)
        .with_attempts(cli.attempts);

    let result = match cli.command {
        Commands::Open { .. } => {
            device.open().await;
            Ok(String::new())
        }
        Commands::Close { .. } => {
            device.close().await;
            Ok(String::new())
        }
        Commands::Stop { .. } => {
            device.stop().await;
            Ok(String::new())
        }
        Commands::Position { percent, .. } => device
            .move_to(percent)
            .await
            .map(|_| String::new())
            .map_err(Into::into),
        Commands::SetDirection { direction, .. } => {
            device.set_direction(direction).await;
            Ok(String::new())
        }
        Commands::Status { .. } => cmd_status(&device, &mut updates, fmt).await,
        Commands::Probe { .. } => cmd_probe(&device, &mut updates, fmt).await,
        Commands::Program { .. } => {
            if device.program().await {
                Ok(format!("address {} programmed", device.address()))
            } else {
                Err(anyhow!("programming not acknowledged"))
            }
        }
    };

    bus.shutdown().await;
    result
}

fn main() {
    match do_main() {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}
