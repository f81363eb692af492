/// Gateway-side connection registry and heartbeat supervision
///
/// Every accepted connection gets a `HeartbeatRecord` and its own supervisor
/// task. The supervisor probes with `PING` every ping interval and evicts the
/// connection once no `PONG` has arrived for more than three intervals, or as
/// soon as a probe or read fails.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::error::{ProtocolError, TransportError};
use crate::models::{HeartbeatRecord, Reading};
use crate::runtime::Shutdown;
use crate::transport::frame::{FrameReader, FrameWriter, Message, Opcode};
use crate::transport::handshake::server_handshake;
use crate::transport::{PING, PONG};
use crate::utils::format_datetime;

/// Missed-probe budget, in ping intervals.
pub const LIVENESS_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    pub fn new(listen_addr: &str, ping_interval: Duration) -> Self {
        ServerConfig {
            listen_addr: listen_addr.to_string(),
            ping_interval,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Live connections keyed by client id.
#[derive(Debug, Default)]
pub struct Registry {
    records: Mutex<HashMap<u64, HeartbeatRecord>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<u64, HeartbeatRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, peer_address: SocketAddr, now: Instant) -> u64 {
        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.records()
            .insert(client_id, HeartbeatRecord::new(client_id, peer_address, now));
        client_id
    }

    pub fn record_pong(&self, client_id: u64, now: Instant) {
        if let Some(record) = self.records().get_mut(&client_id) {
            record.touch(now);
        }
    }

    pub fn get(&self, client_id: u64) -> Option<HeartbeatRecord> {
        self.records().get(&client_id).cloned()
    }

    pub fn evict(&self, client_id: u64) -> Option<HeartbeatRecord> {
        self.records().remove(&client_id)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn is_stale(record: &HeartbeatRecord, now: Instant, ping_interval: Duration) -> bool {
    now.saturating_duration_since(record.last_pong_time) > ping_interval * LIVENESS_INTERVALS
}

/// Decides whether the gateway keeps feeding the hardware watchdog.
///
/// Feeds while any client is registered and for `grace` after the registry
/// empties; after that the watchdog is left to reset the board.
#[derive(Debug, Clone)]
pub struct WatchdogGate {
    grace: Duration,
    empty_since: Option<Instant>,
}

impl WatchdogGate {
    pub fn new(grace: Duration) -> Self {
        WatchdogGate {
            grace,
            empty_since: None,
        }
    }

    pub fn should_feed(&mut self, clients: usize, now: Instant) -> bool {
        if clients > 0 {
            self.empty_since = None;
            return true;
        }
        let since = *self.empty_since.get_or_insert(now);
        now.saturating_duration_since(since) < self.grace
    }
}

/// Runs the heartbeat loop for one registered connection until it is evicted.
/// Application payloads (readings) are forwarded to `inbound`.
pub async fn supervise_connection<R, W>(
    client_id: u64,
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    registry: Arc<Registry>,
    ping_interval: Duration,
    inbound: mpsc::Sender<Reading>,
    mut shutdown: Shutdown,
) -> TransportError
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = shutdown.wait() => break TransportError::Closed,
            _ = ticker.tick() => {
                let Some(record) = registry.get(client_id) else {
                    break TransportError::Closed;
                };
                if is_stale(&record, Instant::now(), ping_interval) {
                    break TransportError::LivenessTimeout(ping_interval * LIVENESS_INTERVALS);
                }
                let probe = send_within(&mut writer, Opcode::Text, PING.as_bytes(), ping_interval);
                match probe.await {
                    Ok(()) => debug!("Sent PING to client {}", client_id),
                    Err(e) => break e.into(),
                }
            }
            message = reader.next_message() => {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => break e,
                };
                let handled = handle_inbound(
                    client_id,
                    message,
                    &mut writer,
                    ping_interval,
                    &registry,
                    &inbound,
                )
                .await;
                if let Err(e) = handled {
                    break e.into();
                }
            }
        }
    };

    if let Some(record) = registry.evict(client_id) {
        debug!(
            "Client {} at {} was connected since {} ({}s)",
            record.client_id,
            record.peer_address,
            format_datetime(&record.connected_at),
            record.connect_time.elapsed().as_secs()
        );
    }
    let _ = timeout(Duration::from_secs(1), writer.close()).await;
    reason
}

/// A peer that stops reading must not stall the supervisor.
async fn send_within<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    opcode: Opcode,
    payload: &[u8],
    limit: Duration,
) -> Result<(), ProtocolError> {
    timeout(limit, writer.send(opcode, payload))
        .await
        .map_err(|_| ProtocolError::Timeout(limit))?
}

async fn handle_inbound<W: AsyncWrite + Unpin>(
    client_id: u64,
    message: Message,
    writer: &mut FrameWriter<W>,
    write_timeout: Duration,
    registry: &Registry,
    inbound: &mpsc::Sender<Reading>,
) -> Result<(), ProtocolError> {
    match message {
        Message::Text(text) if text == PONG => registry.record_pong(client_id, Instant::now()),
        // client-initiated probe: answer it, but only our own probes count as liveness
        Message::Text(text) if text == PING => {
            send_within(writer, Opcode::Text, PONG.as_bytes(), write_timeout).await?
        }
        Message::Text(text) => match serde_json::from_str::<Reading>(&text) {
            Ok(reading) => {
                debug!("Reading {} from client {}", reading.timestamp, client_id);
                if inbound.send(reading).await.is_err() {
                    warn!("Reading forwarder is gone, dropping reading from client {}", client_id);
                }
            }
            Err(e) => warn!("Ignoring unrecognised payload from client {}: {}", client_id, e),
        },
        Message::Ping(payload) => send_within(writer, Opcode::Pong, &payload, write_timeout).await?,
        Message::Pong(_) => {}
        Message::Binary(payload) => {
            debug!("Ignoring {} byte binary message from client {}", payload.len(), client_id)
        }
    }
    Ok(())
}

pub struct GatewayServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    inbound: mpsc::Sender<Reading>,
}

impl GatewayServer {
    pub fn new(
        config: ServerConfig,
        registry: Arc<Registry>,
        inbound: mpsc::Sender<Reading>,
    ) -> Self {
        GatewayServer {
            config,
            registry,
            inbound,
        }
    }

    pub async fn run(self, listener: TcpListener, mut shutdown: Shutdown) {
        match listener.local_addr() {
            Ok(addr) => info!("Gateway listening on {}", addr),
            Err(_) => info!("Gateway listening on {}", self.config.listen_addr),
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        self.config.clone(),
                        self.registry.clone(),
                        self.inbound.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("Gateway stopped accepting connections");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: ServerConfig,
    registry: Arc<Registry>,
    inbound: mpsc::Sender<Reading>,
    shutdown: Shutdown,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", peer, e);
    }
    let handshake = timeout(config.handshake_timeout, server_handshake(&mut stream)).await;
    let (hello, leftover) = match handshake {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("Handshake with {} timed out", peer);
            return;
        }
    };

    let client_id = registry.register(peer, Instant::now());
    info!(
        "Client {} connected from {} on {} ({} live)",
        client_id,
        peer,
        hello.path,
        registry.len()
    );

    let (read_half, write_half) = stream.into_split();
    let reason = supervise_connection(
        client_id,
        FrameReader::new(read_half, leftover, true),
        FrameWriter::new(write_half, false),
        registry.clone(),
        config.ping_interval,
        inbound,
        shutdown,
    )
    .await;

    match reason {
        TransportError::Closed => info!("Client {} disconnected", client_id),
        other => warn!("Client {} evicted: {}", client_id, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AeratorStatus;
    use crate::transport::frame::encode_frame;
    use crate::transport::handshake::client_handshake;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    const PING_INTERVAL: Duration = Duration::from_secs(20);

    fn peer() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    #[test]
    fn staleness_threshold_is_three_intervals() {
        let t0 = Instant::now();
        let record = HeartbeatRecord::new(1, peer(), t0);
        let limit = PING_INTERVAL * 3;
        assert!(!is_stale(&record, t0 + limit - Duration::from_millis(1), PING_INTERVAL));
        assert!(!is_stale(&record, t0 + limit, PING_INTERVAL));
        assert!(is_stale(&record, t0 + limit + Duration::from_millis(1), PING_INTERVAL));
    }

    #[test]
    fn registry_tracks_liveness_per_client() {
        let registry = Registry::new();
        let t0 = Instant::now();
        let a = registry.register(peer(), t0);
        let b = registry.register(peer(), t0);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.record_pong(a, t0 + Duration::from_secs(5));
        assert_eq!(registry.get(a).unwrap().last_pong_time, t0 + Duration::from_secs(5));
        assert_eq!(registry.get(b).unwrap().last_pong_time, t0);

        assert!(registry.evict(a).is_some());
        assert!(registry.evict(a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn watchdog_gate_starves_after_grace() {
        let grace = Duration::from_secs(300);
        let mut gate = WatchdogGate::new(grace);
        let t0 = Instant::now();

        assert!(gate.should_feed(2, t0));
        assert!(gate.should_feed(0, t0 + Duration::from_secs(1)));
        assert!(gate.should_feed(0, t0 + Duration::from_secs(300)));
        assert!(!gate.should_feed(0, t0 + Duration::from_secs(301)));

        // a client coming back restores feeding and restarts the grace window
        assert!(gate.should_feed(1, t0 + Duration::from_secs(400)));
        assert!(gate.should_feed(0, t0 + Duration::from_secs(500)));
        assert!(gate.should_feed(0, t0 + Duration::from_secs(799)));
        assert!(!gate.should_feed(0, t0 + Duration::from_secs(801)));
    }

    struct Harness {
        client_id: u64,
        registry: Arc<Registry>,
        client_reader: FrameReader<ReadHalf<DuplexStream>>,
        client_writer: FrameWriter<WriteHalf<DuplexStream>>,
        inbound: mpsc::Receiver<Reading>,
        stop: crate::runtime::ShutdownTrigger,
        task: tokio::task::JoinHandle<TransportError>,
    }

    fn spawn_supervisor() -> Harness {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_r, server_w) = tokio::io::split(server_io);
        let (client_r, client_w) = tokio::io::split(client_io);
        let registry = Arc::new(Registry::new());
        let client_id = registry.register(peer(), Instant::now());
        let (tx, rx) = mpsc::channel(8);
        let (stop, shutdown) = Shutdown::channel();

        let task = tokio::spawn(supervise_connection(
            client_id,
            FrameReader::new(server_r, Vec::new(), true),
            FrameWriter::new(server_w, false),
            registry.clone(),
            PING_INTERVAL,
            tx,
            shutdown,
        ));
        Harness {
            client_id,
            registry,
            client_reader: FrameReader::new(client_r, Vec::new(), false),
            client_writer: FrameWriter::new(client_w, true),
            inbound: rx,
            stop,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_evicted() {
        let h = spawn_supervisor();
        let started = Instant::now();

        // keep draining probes but never answer
        let mut client_reader = h.client_reader;
        let drain = tokio::spawn(async move {
            while client_reader.next_message().await.is_ok() {}
        });

        let reason = h.task.await.unwrap();
        assert!(matches!(reason, TransportError::LivenessTimeout(_)));
        assert!(h.registry.get(h.client_id).is_none());
        let elapsed = started.elapsed();
        assert!(
            elapsed > PING_INTERVAL * 3 && elapsed <= PING_INTERVAL * 4 + Duration::from_secs(1)
        );
        drain.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn client_answering_every_other_probe_is_retained() {
        let mut h = spawn_supervisor();

        let mut probes = 0;
        while probes < 20 {
            match h.client_reader.next_message().await.unwrap() {
                Message::Text(text) if text == PING => {
                    probes += 1;
                    if probes % 2 == 0 {
                        h.client_writer.send_text(PONG).await.unwrap();
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(h.registry.get(h.client_id).is_some());

        h.stop.trigger();
        assert!(matches!(h.task.await.unwrap(), TransportError::Closed));
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn readings_are_forwarded_and_garbage_ignored() {
        let mut h = spawn_supervisor();
        let reading = Reading::new("node-a", Default::default(), AeratorStatus::Off);

        h.client_writer.send_text("not a reading").await.unwrap();
        h.client_writer
            .send_text(&serde_json::to_string(&reading).unwrap())
            .await
            .unwrap();
        assert_eq!(h.inbound.recv().await.unwrap(), reading);
        assert!(h.registry.get(h.client_id).is_some());

        h.client_writer.close().await.unwrap();
        assert!(matches!(h.task.await.unwrap(), TransportError::Closed));
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unmasked_client_frame_tears_down_connection() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (server_r, server_w) = tokio::io::split(server_io);
        let (_client_r, mut client_w) = tokio::io::split(client_io);
        let registry = Arc::new(Registry::new());
        let id = registry.register(peer(), Instant::now());
        let (tx, _rx) = mpsc::channel(1);
        let (_stop, shutdown) = Shutdown::channel();

        client_w
            .write_all(&encode_frame(Opcode::Text, PONG.as_bytes(), false))
            .await
            .unwrap();
        let reason = supervise_connection(
            id,
            FrameReader::new(server_r, Vec::new(), true),
            FrameWriter::new(server_w, false),
            registry.clone(),
            PING_INTERVAL,
            tx,
            shutdown,
        )
        .await;
        assert!(matches!(
            reason,
            TransportError::Protocol(ProtocolError::UnmaskedClientFrame)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn client_that_stops_reading_is_dropped_after_write_timeout() {
        let (client_io, server_io) = tokio::io::duplex(256);
        let (server_r, server_w) = tokio::io::split(server_io);
        let (_client_r, client_w) = tokio::io::split(client_io);
        let registry = Arc::new(Registry::new());
        let id = registry.register(peer(), Instant::now());
        let (tx, _rx) = mpsc::channel(1);
        let (_stop, shutdown) = Shutdown::channel();

        // floods PINGs and never reads the PONGs
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(client_w, true);
            for _ in 0..200 {
                if writer.send_text(PING).await.is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let reason = supervise_connection(
            id,
            FrameReader::new(server_r, Vec::new(), true),
            FrameWriter::new(server_w, false),
            registry.clone(),
            PING_INTERVAL,
            tx,
            shutdown,
        )
        .await;
        assert!(
            matches!(reason, TransportError::Protocol(ProtocolError::Timeout(_))),
            "{:?}",
            reason
        );
        assert!(started.elapsed() <= PING_INTERVAL + Duration::from_secs(2));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn gateway_accepts_tcp_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let (stop, shutdown) = Shutdown::channel();
        let server = GatewayServer::new(
            ServerConfig::new(&addr.to_string(), PING_INTERVAL),
            registry.clone(),
            tx,
        );
        let accept_loop = tokio::spawn(server.run(listener, shutdown));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let leftover = client_handshake(&mut stream, &addr.to_string(), "/ws", true)
            .await
            .unwrap();
        assert!(leftover.is_empty());

        let reading = Reading::new("node-b", Default::default(), AeratorStatus::On);
        let (_r, w) = stream.into_split();
        let mut writer = FrameWriter::new(w, true);
        writer
            .send_text(&serde_json::to_string(&reading).unwrap())
            .await
            .unwrap();
        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, reading);
        assert_eq!(registry.len(), 1);

        stop.trigger();
        accept_loop.await.unwrap();
    }
}
