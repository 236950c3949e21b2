use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use tokio::signal;

use phmeter_serial_lib::events;
use phmeter_serial_lib::{
    ConnectionManager, DeviceDescriptor, ManagerSettings, Notifier, SimulatedUsbHost,
    SystemUsbHost, UsbHost,
};

use crate::cli::Cli;

mod cli;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SIMULATED_PORT: &str = "/dev/ttySIM0";

async fn wait_for_connection(manager: &ConnectionManager, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if manager.is_open().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    manager.is_open().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        args.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    info!("Starting phmeter v{}", VERSION);

    let settings = match &args.settings {
        Some(path) => ManagerSettings::load(path)
            .with_context(|| format!("Could not load settings from {}", path.display()))?,
        None => ManagerSettings::default(),
    };

    let host: Arc<dyn UsbHost> = if args.simulate {
        info!("Using a simulated meter on {}", SIMULATED_PORT);
        Arc::new(SimulatedUsbHost::new().with_device(DeviceDescriptor::new(SIMULATED_PORT, 0x0403, 0x6001)))
    } else {
        Arc::new(SystemUsbHost::new(settings.poll_interval()))
    };

    let (sink, mut host_events) = events::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = host_events.recv().await {
            println!("{} {}", event.name, event.payload);
        }
    });

    let manager = ConnectionManager::new(host, Notifier::new(sink), settings);
    if args.auto_connect {
        manager.set_auto_connect_baud_rate(args.baud_rate).await;
        manager.set_auto_connect_data_bits(args.data_bits).await;
        manager.set_auto_connect(true).await;
    }

    manager.start_service().await;
    if !args.auto_connect {
        manager.connect(args.baud_rate, args.data_bits).await;
    }

    if wait_for_connection(&manager, Duration::from_secs(args.connect_wait_secs)).await {
        if let Some(session) = manager.session_info().await {
            info!(
                "Connected to {} (session {})",
                session.device.device_name, session.session_id
            );
        }

        let timeout = Duration::from_millis(args.timeout_ms);
        for query in &args.query {
            let response = manager.write_and_read(query.0.clone(), Some(timeout)).await;
            println!("{} -> {}", query, response.trim_end());
        }
    } else {
        warn!("No connection after {}s", args.connect_wait_secs);
    }

    if args.watch {
        info!("Watching for USB events, press Ctrl-C to exit");
        signal::ctrl_c().await.context("Could not listen for Ctrl-C")?;
    }

    manager.disconnect().await;
    manager.stop_service().await;
    drop(manager);

    // Let the printer drain whatever is still queued.
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    info!("Shutting down");
    Ok(())
}
