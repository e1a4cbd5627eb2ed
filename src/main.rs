use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use fluidics_ipc_rust::devices::axis::Axis;
use fluidics_ipc_rust::{Config, DeviceController, PortRegistry, RunState, VERSION};

const DEFAULT_AXIS_RPM: f64 = 5.0;

fn cli() -> Command {
    Command::new("fluidics-ipc")
        .version(VERSION)
        .about("Fluidics instrument control core (Modbus RTU)")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .subcommand(Command::new("status").about("Print the current device snapshot"))
        .subcommand(Command::new("config").about("Print the effective configuration"))
        .subcommand(
            Command::new("run")
                .about("Run a fluidic sequence to completion")
                .arg(
                    Arg::new("sequence")
                        .required(true)
                        .help("maf_sampling | sequence2"),
                ),
        )
        .subcommand(Command::new("home").about("Home both axes and the syringe"))
        .subcommand(
            Command::new("relay")
                .about("Switch a relay channel")
                .arg(Arg::new("channel").required(true).help("1..8"))
                .arg(Arg::new("state").required(true).help("on | off")),
        )
        .subcommand(
            Command::new("valve")
                .about("Select a rotary valve port")
                .arg(Arg::new("port").required(true).help("1..12")),
        )
        .subcommand(
            Command::new("syringe")
                .about("Move the syringe to an absolute volume")
                .arg(Arg::new("volume_ml").required(true))
                .arg(Arg::new("flow_ml_min").required(true)),
        )
        .subcommand(
            Command::new("axis")
                .about("Move an axis to an absolute position")
                .arg(Arg::new("axis").required(true).help("x | z"))
                .arg(Arg::new("position_mm").required(true))
                .arg(Arg::new("rpm").help("defaults to 5 RPM")),
        )
        .subcommand(
            Command::new("home-axis")
                .about("Home a single axis")
                .arg(Arg::new("axis").required(true).help("x | z")),
        )
        .subcommand(
            Command::new("emergency-stop")
                .about("Quick-stop every drive and drop the relay bank"),
        )
        .subcommand(Command::new("monitor").about("Stream status snapshots until Ctrl+C"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let default_level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("📋 Loading configuration from {}", path);
            Config::from_file(path)?
        }
        None => {
            info!("📋 Using built-in default configuration");
            Config::default()
        }
    };

    let ports = PortRegistry::new();
    let controller = DeviceController::new(config, &ports);

    let result = dispatch(&controller, &matches).await;
    controller.shutdown();
    result
}

async fn dispatch(controller: &Arc<DeviceController>, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("config", _)) => {
            println!("{}", controller.config().to_toml_string()?);
        }
        Some(("run", sub)) => {
            let sequence = required(sub, "sequence")?;
            controller.start_poller();
            let mut events = controller.subscribe();
            controller.start_sequence(sequence)?;
            watch_until_terminal(controller, &mut events).await?;
        }
        Some(("home", _)) => {
            controller.start_poller();
            let mut events = controller.subscribe();
            controller.home_all()?;
            watch_until_terminal(controller, &mut events).await?;
        }
        Some(("relay", sub)) => {
            let channel: u8 = required(sub, "channel")?.parse()?;
            let on = match required(sub, "state")?.to_ascii_lowercase().as_str() {
                "on" => true,
                "off" => false,
                other => return Err(anyhow!("relay state must be on|off, got '{}'", other)),
            };
            controller.set_relay(channel, on).await?;
            println!("✅ relay {} -> {}", channel, if on { "ON" } else { "OFF" });
        }
        Some(("valve", sub)) => {
            let port: u8 = required(sub, "port")?.parse()?;
            controller.set_rotary_port(port).await?;
            println!("✅ rotary valve -> port {}", port);
        }
        Some(("syringe", sub)) => {
            let volume_ml: f64 = required(sub, "volume_ml")?.parse()?;
            let flow_ml_min: f64 = required(sub, "flow_ml_min")?.parse()?;
            controller.move_syringe(volume_ml, flow_ml_min).await?;
            println!("✅ syringe at {:.3} mL", volume_ml);
        }
        Some(("axis", sub)) => {
            let axis: Axis = required(sub, "axis")?.parse()?;
            let position_mm: f64 = required(sub, "position_mm")?.parse()?;
            let rpm: f64 = match sub.get_one::<String>("rpm") {
                Some(raw) => raw.parse()?,
                None => DEFAULT_AXIS_RPM,
            };
            controller.axis_connect_if_needed(axis).await?;
            controller.move_axis(axis, position_mm, rpm).await?;
            println!("✅ {} axis at {:.3} mm", axis, position_mm);
        }
        Some(("home-axis", sub)) => {
            let axis: Axis = required(sub, "axis")?.parse()?;
            controller.axis_connect_if_needed(axis).await?;
            controller.home_axis(axis).await?;
            println!("✅ {} axis homed", axis);
        }
        Some(("emergency-stop", _)) => {
            controller.emergency_stop().await?;
            println!("🛑 emergency stop issued");
        }
        Some(("monitor", _)) => {
            controller.start_poller();
            let mut events = controller.subscribe();
            println!(
                "{}",
                serde_json::to_string_pretty(&controller.get_status()?)?
            );
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(snapshot) => println!("{}", serde_json::to_string(&snapshot)?),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("⚠️ dropped {} snapshots", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        // "status" and no subcommand both print the snapshot once
        _ => {
            println!(
                "{}",
                serde_json::to_string_pretty(&controller.get_status()?)?
            );
        }
    }
    Ok(())
}

/// Follow snapshot events until the worker leaves the Running state.
/// Ctrl+C requests a cooperative stop and keeps following until the
/// worker acknowledges it.
async fn watch_until_terminal(
    controller: &Arc<DeviceController>,
    events: &mut tokio::sync::broadcast::Receiver<fluidics_ipc_rust::StatusSnapshot>,
) -> Result<()> {
    let mut last_step: Option<String> = None;
    let mut stop_requested = false;
    loop {
        let snapshot = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                warn!("🛑 Ctrl+C: requesting stop");
                controller.stop_sequence()?;
                stop_requested = true;
                continue;
            }
            // fallback poll in case terminal events were dropped by lag
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                controller.get_status()?
            }
            event = events.recv() => match event {
                Ok(snapshot) => snapshot,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        };
        if snapshot.sequence_step != last_step {
            if let Some(step) = &snapshot.sequence_step {
                println!("▶ {}", step);
            }
            last_step = snapshot.sequence_step.clone();
        }
        if snapshot.current_sequence.is_none() && snapshot.run_state != RunState::Running {
            match snapshot.run_state {
                RunState::Idle => println!("✅ complete"),
                RunState::Error => println!("❌ {}", snapshot.last_error.unwrap_or_default()),
                RunState::Running => {}
            }
            break;
        }
    }
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing argument '{}'", name))
}
