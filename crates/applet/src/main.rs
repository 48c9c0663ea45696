//! usb-applet
//!
//! Command-line front end for the USB passthrough coordinator. Lists devices
//! known to the hotplug service, moves them between VMs and, in watch mode,
//! follows selection prompts pushed by the service.

use anyhow::{Context, Result};
use applet::config::AppletConfig;
use applet::{
    AssignmentChange, AssignmentCoordinator, ControlChannel, CoordinatorEvent, DETACH_SENTINEL,
    Device, NotificationChannel,
};
use clap::{Parser, Subcommand};
use common::setup_logging;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-applet")]
#[command(author, version, about = "USB passthrough applet - assign USB devices to VMs")]
#[command(long_about = "
Client for the host's USB hotplug service. Shows which VM holds each USB
device, moves devices between VMs and reacts to selection requests the
service pushes when a device is plugged in.

EXAMPLES:
    # Show all devices
    usb-applet list

    # Only devices that can be moved between VMs
    usb-applet list --multi-vm-only

    # Pass a device through to a VM (device node or display name)
    usb-applet attach /dev/bus/usb/001/002 gui-vm
    usb-applet attach \"Logi Mouse\" chrome-vm

    # Follow selection requests until Ctrl+C
    usb-applet watch

CONFIGURATION:
    The applet looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-applet/applet.toml
    3. /etc/usb-applet/applet.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices and their current VM
    List {
        /// Only devices with at least two VM choices
        #[arg(long)]
        multi_vm_only: bool,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Attach a device to a VM
    Attach {
        /// Device node or display name
        device: String,
        vm: String,
    },
    /// Detach a device from its VM
    Detach {
        /// Device node or display name
        device: String,
    },
    /// Apply a menu choice; "eject" detaches
    Select { device: String, choice: String },
    /// Follow notifications until Ctrl+C (default)
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = AppletConfig::default();
        let path = AppletConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        AppletConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        AppletConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.applet.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    debug!("usb-applet v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = Arc::new(AssignmentCoordinator::new(
        ControlChannel::new(config.control.endpoint.clone()),
        config.coordinator_options(),
    ));

    match args.command.unwrap_or(Commands::Watch) {
        Commands::List {
            multi_vm_only,
            json,
        } => list(&coordinator, multi_vm_only, json).await,
        Commands::Attach { device, vm } => {
            prepare(&coordinator).await?;
            let change = coordinator
                .attach(&device, &vm)
                .await
                .with_context(|| format!("Failed to attach {} to {}", device, vm))?;
            report(change, &device, &vm);
            Ok(())
        }
        Commands::Detach { device } => {
            prepare(&coordinator).await?;
            let change = coordinator
                .detach(&device)
                .await
                .with_context(|| format!("Failed to detach {}", device))?;
            report(change, &device, DETACH_SENTINEL);
            Ok(())
        }
        Commands::Select { device, choice } => {
            prepare(&coordinator).await?;
            let change = coordinator
                .select(&device, &choice)
                .await
                .with_context(|| format!("Failed to apply '{}' to {}", choice, device))?;
            report(change, &device, &choice);
            Ok(())
        }
        Commands::Watch => watch(coordinator, &config).await,
    }
}

/// Connect and load the device list every command operates on
async fn prepare(coordinator: &AssignmentCoordinator) -> Result<()> {
    coordinator
        .connect()
        .await
        .with_context(|| format!("Failed to reach {}", coordinator.control().endpoint()))?;
    coordinator
        .refresh()
        .await
        .context("Failed to list devices")?;
    Ok(())
}

async fn list(coordinator: &AssignmentCoordinator, multi_vm_only: bool, json: bool) -> Result<()> {
    prepare(coordinator).await?;
    let snapshot = coordinator.snapshot().await;

    let devices: Vec<&Device> = if multi_vm_only {
        snapshot.multi_vm_only()
    } else {
        snapshot.devices().iter().collect()
    };

    if json {
        let out = serde_json::to_string_pretty(&devices).context("Failed to encode devices")?;
        println!("{}", out);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices");
        return Ok(());
    }
    for device in devices {
        println!("{}", format_device(device));
    }
    Ok(())
}

fn format_device(device: &Device) -> String {
    let choices: Vec<&str> = device.vm_choices().collect();
    format!(
        "{:<24} {:<24} {:<12} [{}]",
        device.name,
        device.device_node,
        device.attached_vm().unwrap_or("-"),
        choices.join(", ")
    )
}

fn report(change: AssignmentChange, device: &str, target: &str) {
    match change {
        AssignmentChange::Applied => println!("{}: {}", device, target),
        AssignmentChange::Unchanged => println!("{}: already {}", device, target),
    }
}

/// Long-running mode: follow pushed prompts until Ctrl+C
async fn watch(coordinator: Arc<AssignmentCoordinator>, config: &AppletConfig) -> Result<()> {
    let events = coordinator.subscribe();

    match coordinator.connect().await {
        Ok(()) => {
            if let Err(e) = coordinator.refresh().await {
                warn!("Initial refresh failed: {}", e);
            }
        }
        Err(e) => warn!("Control channel unavailable: {}", e),
    }

    let notifications = if config.notifications.enabled {
        let channel = NotificationChannel::new(config.notifications.endpoint.clone())
            .with_reconnect_delay(config.notifications.reconnect_delay());
        Some(coordinator.start_notifications(channel))
    } else {
        info!("Notifications disabled");
        None
    };

    let consumer = tokio::spawn(consume_events(
        coordinator.clone(),
        events,
        config.devices.refresh_on_notification,
    ));

    info!("Watching for USB events. Press Ctrl+C to exit.");
    signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    consumer.abort();
    if let Some(handle) = notifications {
        handle.shutdown().await;
    }
    coordinator.control().close().await;
    Ok(())
}

async fn consume_events(
    coordinator: Arc<AssignmentCoordinator>,
    mut events: broadcast::Receiver<CoordinatorEvent>,
    refresh_on_notification: bool,
) {
    loop {
        match events.recv().await {
            Ok(CoordinatorEvent::SnapshotChanged(snapshot)) => {
                info!("{} device(s), generation {}", snapshot.len(), snapshot.generation());
                for device in snapshot.devices() {
                    info!("  {}", format_device(device));
                }
            }
            Ok(CoordinatorEvent::SelectionRequired(prompt)) => {
                info!(
                    "Select VM for {} ({}): {}",
                    prompt.device.name,
                    prompt.device.device_node,
                    prompt.choices().join(", ")
                );
                if refresh_on_notification {
                    // Reconnect here; the control channel never retries on its own
                    if let Err(e) = coordinator.connect().await {
                        warn!("Control channel unavailable: {}", e);
                        continue;
                    }
                    coordinator.spawn_refresh();
                }
            }
            Ok(CoordinatorEvent::SelectionRejected { device, error }) => {
                warn!("{}: {} ({})", error.title(), error, device);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event consumer lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                error!("Event bus closed");
                break;
            }
        }
    }
}
