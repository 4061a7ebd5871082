use std::env;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use bus_client::LocalBus;
use der_app::commands::{execute, parse_command, Flow, HELP};
use der_app::monitor::spawn_property_monitor;
use der_app::DerConfig;
use device_publisher::DevicePublisher;
use discovery::SubscriptionManager;
use resource_controller::{ControlLoop, ResourceController};
use signal_store::SignalStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = DerConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    if let Some(ref listen) = config.metrics_listen {
        install_metrics_exporter(listen).context("metrics exporter init failed")?;
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (bus, events) = LocalBus::new(config.bus.clone());
    info!(app = %config.bus.app_name, "bus attachment ready");

    let controller = Arc::new(ResourceController::with_setpoints(
        config.import_watts,
        config.export_watts,
    ));
    let manager = Arc::new(SubscriptionManager::new(
        bus.clone(),
        Arc::new(SignalStore::new()),
        config.subscription.clone(),
    ));
    let publisher = DevicePublisher::new(
        bus.clone(),
        Arc::clone(&controller),
        config.device.clone(),
    );
    info!(
        path = %config.device.path,
        interface = %config.device.interface,
        server_interface = %config.subscription.server_interface,
        "device object registered"
    );

    let monitor_handle = spawn_property_monitor(&bus, shutdown_rx.clone());

    let dispatch_handle = {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { manager.run(events, shutdown).await })
    };
    let control_handle = tokio::spawn(
        ControlLoop::new(
            Arc::clone(&controller),
            shutdown_rx.clone(),
            config.control.clone(),
        )
        .run(),
    );

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    println!("{HELP}");
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                break;
            }
            maybe_line = lines.recv(), if stdin_open => {
                let Some(line) = maybe_line else {
                    info!("stdin closed, waiting for shutdown signal");
                    stdin_open = false;
                    continue;
                };
                let Some(command) = parse_command(&line) else {
                    continue;
                };
                let outcome = execute(command, &controller, &publisher, &manager).await;
                if !outcome.output.is_empty() {
                    println!("{}", outcome.output);
                }
                if outcome.flow == Flow::Quit {
                    info!("quit requested");
                    break;
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match control_handle.await {
        Ok(stats) => info!(
            ticks = stats.ticks,
            overruns = stats.overruns,
            "control loop joined"
        ),
        Err(err) => warn!(error = %err, "control loop join failed"),
    }
    if let Err(err) = dispatch_handle.await {
        warn!(error = %err, "dispatch task join failed");
    }
    match monitor_handle.await {
        Ok(seen) => info!(pushes = seen, "property monitor joined"),
        Err(err) => warn!(error = %err, "property monitor join failed"),
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }

    let state = controller.snapshot();
    info!(
        import_energy_wh = state.import_energy_wh,
        export_energy_wh = state.export_energy_wh,
        "shutdown complete"
    );
    Ok(())
}

/// Reads stdin on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

fn install_metrics_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen.parse().context("parse metrics listen address")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install prometheus exporter")?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
