mod cloud;
mod config;
mod error;
mod hardware;
mod models;
mod queue;
mod runtime;
mod scheduler;
mod transport;
mod utils;

use std::sync::Arc;

use log::{error, info, warn};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use cloud::{run_forwarder, HttpCloudSink, LogCloudSink};
use config::{NodeConfig, Role};
use hardware::{
    run_watchdog_feeder, DeviceWatchdog, HostLink, LogWatchdog, RelaySource, SimulatedRelay,
    SimulatedSensors, SysfsRelay, Watchdog,
};
use queue::{run_drain_loop, Deliver, FsStorage, RetryQueue};
use runtime::{RuntimeState, Shutdown};
use scheduler::{Scheduler, SchedulerConfig};
use transport::server::LIVENESS_INTERVALS;
use transport::{
    run_command_loop, ClientConfig, ClientTransport, GatewayOutbox, GatewayServer, Registry,
    ServerConfig, WatchdogGate,
};
use utils::format_datetime;

const WATCHDOG_TICK_SECS: u64 = 5;
const WATCHDOG_GRACE_SECS: u64 = 300; // 5 minutes without clients
const CLOUD_TIMEOUT_SECS: u64 = 10;
const SHUTDOWN_GRACE_SECS: u64 = 5;

fn open_watchdog(config: &NodeConfig) -> Arc<dyn Watchdog> {
    match &config.watchdog_device {
        Some(path) => match DeviceWatchdog::open(path) {
            Ok(watchdog) => {
                info!("Feeding watchdog device {}", path.display());
                Arc::new(watchdog)
            }
            Err(e) => {
                warn!("Cannot open watchdog {}: {}, using log watchdog", path.display(), e);
                Arc::new(LogWatchdog)
            }
        },
        None => Arc::new(LogWatchdog),
    }
}

async fn open_queue(
    config: &NodeConfig,
) -> Result<Arc<RetryQueue>, Box<dyn std::error::Error>> {
    let storage = FsStorage::open(&config.queue_dir)?;
    let queue = RetryQueue::new(Box::new(storage));
    info!(
        "Retry queue at {} holds {} reading(s)",
        config.queue_dir.display(),
        queue.len().await?
    );
    Ok(Arc::new(queue))
}

async fn start_node(
    config: &NodeConfig,
    shutdown: &Shutdown,
) -> Result<Vec<JoinHandle<()>>, Box<dyn std::error::Error>> {
    let runtime = RuntimeState::new(config.speed_factor);
    let queue = open_queue(config).await?;
    let drain_trigger = Arc::new(Notify::new());

    let relay: Arc<dyn RelaySource> = match &config.relay_gpio_path {
        Some(path) => Arc::new(SysfsRelay::new(path.clone())),
        None => {
            info!("No relay GPIO configured, simulating the aerator duty cycle");
            Arc::new(SimulatedRelay::new(
                config.aerator_on,
                config.aerator_off,
                runtime.clone(),
            ))
        }
    };

    let mut scheduler = Scheduler::new(
        SchedulerConfig {
            device_id: config.device_id.clone(),
            on_duration: config.aerator_on,
            off_duration: config.aerator_off,
            tick: config.monitor_tick,
            settle_delay: config.relay_settle,
        },
        relay,
        Arc::new(SimulatedSensors),
        runtime.clone(),
    );
    {
        let queue = queue.clone();
        let drain_trigger = drain_trigger.clone();
        scheduler.on_reading(Box::new(move |reading| {
            let queue = queue.clone();
            let drain_trigger = drain_trigger.clone();
            let reading = reading.clone();
            tokio::spawn(async move {
                match queue.enqueue(&reading).await {
                    Ok(_) => drain_trigger.notify_one(),
                    Err(e) => error!("Failed to queue reading {}: {}", reading.timestamp, e),
                }
            });
        }));
    }
    let scheduler_handle = scheduler.handle();

    let mut client_config = ClientConfig::new(
        &config.gateway.host,
        config.gateway.port,
        &config.gateway.path,
    );
    client_config.strict_handshake = config.strict_handshake;
    client_config.recv_timeout = config.ping_interval * LIVENESS_INTERVALS;

    let outbox = GatewayOutbox::new(client_config.write_timeout);
    let (command_tx, command_rx) = mpsc::channel(16);
    let transport = ClientTransport::new(
        client_config,
        HostLink::new(&config.gateway.host, config.gateway.port),
        runtime.clone(),
        outbox.clone(),
        drain_trigger.clone(),
        command_tx,
    );
    info!(
        "Node {} connecting to ws://{}:{}{}",
        config.device_id, config.gateway.host, config.gateway.port, config.gateway.path
    );

    let watchdog = open_watchdog(config);
    let feeder_runtime = runtime.clone();
    let deliver: Arc<dyn Deliver> = Arc::new(outbox);

    Ok(vec![
        tokio::spawn(scheduler.run(shutdown.clone())),
        tokio::spawn(transport.run(shutdown.clone())),
        tokio::spawn(run_drain_loop(
            queue,
            deliver,
            drain_trigger,
            config.drain_interval,
            config.drain_batch,
            shutdown.clone(),
        )),
        tokio::spawn(run_command_loop(
            command_rx,
            runtime,
            scheduler_handle,
            shutdown.clone(),
        )),
        tokio::spawn(run_watchdog_feeder(
            watchdog,
            Duration::from_secs(WATCHDOG_TICK_SECS),
            move |_| !feeder_runtime.reboot_requested(),
            shutdown.clone(),
        )),
    ])
}

async fn start_gateway(
    config: &NodeConfig,
    shutdown: &Shutdown,
) -> Result<Vec<JoinHandle<()>>, Box<dyn std::error::Error>> {
    let queue = open_queue(config).await?;
    let drain_trigger = Arc::new(Notify::new());
    let registry = Arc::new(Registry::new());
    let (reading_tx, reading_rx) = mpsc::channel(256);

    let sink: Arc<dyn Deliver> = match &config.cloud_url {
        Some(url) => {
            info!("Forwarding readings to {}", url);
            Arc::new(HttpCloudSink::new(
                url,
                Duration::from_secs(CLOUD_TIMEOUT_SECS),
            )?)
        }
        None => {
            info!("No CLOUD_URL configured, readings are logged only");
            Arc::new(LogCloudSink)
        }
    };

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let server = GatewayServer::new(
        ServerConfig::new(&config.listen_addr, config.ping_interval),
        registry.clone(),
        reading_tx,
    );

    let watchdog = open_watchdog(config);
    let mut gate = WatchdogGate::new(Duration::from_secs(WATCHDOG_GRACE_SECS));
    let feeder_registry = registry.clone();

    Ok(vec![
        tokio::spawn(server.run(listener, shutdown.clone())),
        tokio::spawn(run_forwarder(
            reading_rx,
            queue.clone(),
            drain_trigger.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(run_drain_loop(
            queue,
            sink,
            drain_trigger,
            config.drain_interval,
            config.drain_batch,
            shutdown.clone(),
        )),
        tokio::spawn(run_watchdog_feeder(
            watchdog,
            Duration::from_secs(WATCHDOG_TICK_SECS),
            move |now| gate.should_feed(feeder_registry.len(), now),
            shutdown.clone(),
        )),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match NodeConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Starting {} role at {}",
        config.role,
        format_datetime(&OffsetDateTime::now_utc())
    );

    let (trigger, shutdown) = Shutdown::channel();
    let tasks = match config.role {
        Role::Node => start_node(&config, &shutdown).await?,
        Role::Gateway => start_gateway(&config, &shutdown).await?,
    };

    // Handle Ctrl+C gracefully
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Program terminated by user. Exiting gracefully.");
    trigger.trigger();

    for task in tasks {
        match timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed during shutdown: {}", e),
            Err(_) => warn!("Task did not stop within {}s", SHUTDOWN_GRACE_SECS),
        }
    }

    Ok(())
}
