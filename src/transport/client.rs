/// Node-side connection state machine
///
/// ```text
/// Disconnected ──▶ LinkConnecting ──▶ LinkUp ──▶ HandshakePending ──▶ Open
///      ▲                │                              │               │
///      │   link failure (backoff, reset, escalation)   │ tcp/handshake │ i/o, decode or
///      ├────────────────┘                              │ failure (3 s) │ liveness failure
///      ├───────────────────────────────────────────────┘               ▼
///      └───────────────────────────────────────────────────────────  Closing (3 s)
/// ```
///
/// Exactly one connection exists at a time. While it is open, its write half
/// is parked in the [`GatewayOutbox`], which is also the node's delivery path
/// for the retry queue. A write that fails or stalls past `write_timeout`
/// detaches the writer and ends the session.
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{timeout, Instant};

use crate::error::{LinkError, ProtocolError, TransportError};
use crate::hardware::Link;
use crate::models::{Command, ConnectionState, DeliveryOutcome, Reading};
use crate::queue::Deliver;
use crate::runtime::{RuntimeState, Shutdown};
use crate::scheduler::SchedulerHandle;
use crate::transport::frame::{FrameReader, FrameWriter, Message, Opcode};
use crate::transport::handshake::client_handshake;
use crate::transport::{PING, PONG};

type BoxedReader = FrameReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub strict_handshake: bool,
    pub link_timeout: Duration,
    pub link_retry_delay: Duration,
    pub max_link_failures: u32,
    pub escalation_cooldown: Duration,
    pub link_reset_every: Duration,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub recv_timeout: Duration,
    pub write_timeout: Duration,
    pub reboot_check_interval: Duration,
    /// How long to wait for an external reboot before resuming link attempts.
    pub reboot_hold: Duration,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        ClientConfig {
            host: host.to_string(),
            port,
            path: path.to_string(),
            strict_handshake: false,
            link_timeout: Duration::from_secs(15),
            link_retry_delay: Duration::from_secs(5),
            max_link_failures: 5,
            escalation_cooldown: Duration::from_secs(30),
            link_reset_every: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            recv_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            reboot_check_interval: Duration::from_secs(30),
            reboot_hold: Duration::from_secs(300),
        }
    }
}

/// What to do after a failed link bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureAction {
    pub reset_link: bool,
    pub escalate: bool,
    pub cooldown: Duration,
}

/// Consecutive link failure tracking.
#[derive(Debug, Clone)]
pub struct LinkBackoff {
    failures: u32,
    last_reset: Option<Instant>,
    max_failures: u32,
    reset_every: Duration,
    retry_delay: Duration,
    escalation_cooldown: Duration,
}

impl LinkBackoff {
    pub fn new(config: &ClientConfig) -> Self {
        LinkBackoff {
            failures: 0,
            last_reset: None,
            max_failures: config.max_link_failures,
            reset_every: config.link_reset_every,
            retry_delay: config.link_retry_delay,
            escalation_cooldown: config.escalation_cooldown,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Resets the interface on the first failure of a streak and again every
    /// `reset_every` while the streak lasts.
    pub fn on_failure(&mut self, now: Instant) -> FailureAction {
        self.failures = self.failures.saturating_add(1);
        let reset_link = match self.last_reset {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.reset_every,
        };
        if reset_link {
            self.last_reset = Some(now);
        }
        let escalate = self.failures >= self.max_failures;
        FailureAction {
            reset_link,
            escalate,
            cooldown: if escalate {
                self.escalation_cooldown
            } else {
                self.retry_delay
            },
        }
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
        self.last_reset = None;
    }
}

/// Write half of the open connection, shared with the drain loop.
#[derive(Clone)]
pub struct GatewayOutbox {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    write_timeout: Duration,
    broken: Arc<Notify>,
}

impl GatewayOutbox {
    pub fn new(write_timeout: Duration) -> Self {
        GatewayOutbox {
            writer: Arc::new(Mutex::new(None)),
            write_timeout,
            broken: Arc::new(Notify::new()),
        }
    }

    async fn attach(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
    }

    async fn detach(&self) -> Option<BoxedWriter> {
        self.writer.lock().await.take()
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Completes after a write failure detached the writer. May also
    /// complete for a failure of an earlier session; check `is_open`.
    pub async fn write_failed(&self) {
        self.broken.notified().await
    }

    /// Writes one frame. On error or timeout the writer is dropped so that
    /// later sends fail fast and the session loop is woken.
    pub async fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no open gateway connection",
            ))
        })?;
        let result = match timeout(self.write_timeout, writer.send(opcode, payload)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(self.write_timeout)),
        };
        if result.is_err() {
            *guard = None;
            self.broken.notify_one();
        }
        result
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ProtocolError> {
        self.send(Opcode::Text, text.as_bytes()).await
    }
}

impl Deliver for GatewayOutbox {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, DeliveryOutcome> {
        Box::pin(async move {
            if !self.is_open().await {
                return DeliveryOutcome::Failed;
            }
            let payload = match serde_json::to_string(reading) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Cannot serialize reading {}: {}", reading.timestamp, e);
                    return DeliveryOutcome::Failed;
                }
            };
            match self.send_text(&payload).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(e) => {
                    debug!("Gateway delivery of {} failed: {}", reading.timestamp, e);
                    DeliveryOutcome::Failed
                }
            }
        })
    }
}

pub struct ClientTransport<L: Link> {
    config: ClientConfig,
    link: L,
    runtime: RuntimeState,
    backoff: LinkBackoff,
    state: ConnectionState,
    outbox: GatewayOutbox,
    drain_trigger: Arc<Notify>,
    commands: mpsc::Sender<Command>,
    session: Option<BoxedReader>,
    reboot_hold_since: Option<Instant>,
}

impl<L: Link> ClientTransport<L> {
    pub fn new(
        config: ClientConfig,
        link: L,
        runtime: RuntimeState,
        outbox: GatewayOutbox,
        drain_trigger: Arc<Notify>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        ClientTransport {
            backoff: LinkBackoff::new(&config),
            config,
            link,
            runtime,
            state: ConnectionState::Disconnected,
            outbox,
            drain_trigger,
            commands,
            session: None,
            reboot_hold_since: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(
            "Client transport started, gateway {}:{}{}",
            self.config.host, self.config.port, self.config.path
        );
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = self.step() => {}
            }
        }
        if let Some(mut writer) = self.outbox.detach().await {
            let _ = timeout(Duration::from_secs(1), writer.close()).await;
        }
        info!("Client transport stopped ({})", self.state());
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Performs one transition.
    pub async fn step(&mut self) {
        match self.state {
            ConnectionState::Disconnected => self.on_disconnected().await,
            ConnectionState::LinkConnecting => self.bring_up_link().await,
            ConnectionState::LinkUp => self.set_state(ConnectionState::HandshakePending),
            ConnectionState::HandshakePending => self.open_session().await,
            ConnectionState::Open => self.run_session().await,
            ConnectionState::Closing => self.close_session().await,
        }
    }

    async fn on_disconnected(&mut self) {
        if self.runtime.reboot_requested() {
            let now = Instant::now();
            let since = *self.reboot_hold_since.get_or_insert(now);
            if now.saturating_duration_since(since) < self.config.reboot_hold {
                info!("Reboot pending, not connecting");
                tokio::time::sleep(self.config.reboot_check_interval).await;
                return;
            }
            if !self.config.reboot_hold.is_zero() {
                warn!(
                    "No reboot after {}s, resuming link attempts",
                    self.config.reboot_hold.as_secs()
                );
            }
        } else {
            self.reboot_hold_since = None;
        }
        self.set_state(ConnectionState::LinkConnecting);
    }

    async fn bring_up_link(&mut self) {
        let result = match timeout(self.config.link_timeout, self.link.connect()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(self.config.link_timeout)),
        };

        match result {
            Ok(()) => {
                if self.backoff.failures() > 0 {
                    info!("Link up after {} failed attempt(s)", self.backoff.failures());
                }
                self.backoff.on_success();
                self.runtime.clear_reboot_request();
                self.reboot_hold_since = None;
                self.set_state(ConnectionState::LinkUp);
            }
            Err(e) => {
                let action = self.backoff.on_failure(Instant::now());
                warn!(
                    "Link bring-up failed ({} consecutive): {}",
                    self.backoff.failures(),
                    e
                );
                if action.reset_link {
                    self.link.reset().await;
                }
                if action.escalate {
                    warn!(
                        "{} consecutive link failures, requesting reboot",
                        self.backoff.failures()
                    );
                    self.runtime.request_reboot();
                }
                tokio::time::sleep(action.cooldown).await;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn open_session(&mut self) {
        let host_header = format!("{}:{}", self.config.host, self.config.port);
        let host = self.config.host.clone();
        let port = self.config.port;
        let path = self.config.path.clone();
        let strict = self.config.strict_handshake;
        let header = host_header.clone();
        let connect = async move {
            let mut stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            let leftover = client_handshake(&mut stream, &header, &path, strict).await?;
            Ok::<_, ProtocolError>((stream, leftover))
        };

        match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok((stream, leftover))) => {
                let (read_half, write_half) = stream.into_split();
                let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
                let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
                self.outbox.attach(FrameWriter::new(write_half, true)).await;
                self.session = Some(FrameReader::new(read_half, leftover, false));
                info!("Connected to gateway {}", host_header);
                self.set_state(ConnectionState::Open);
                self.drain_trigger.notify_one();
            }
            Ok(Err(e)) => self.fail_session(TransportError::from(e)).await,
            Err(_) => {
                self.fail_session(ProtocolError::Timeout(self.config.connect_timeout).into())
                    .await
            }
        }
    }

    async fn fail_session(&mut self, err: TransportError) {
        warn!("Gateway connection failed: {}", err);
        tokio::time::sleep(self.config.reconnect_delay).await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(&mut self) {
        let Some(reader) = self.session.as_mut() else {
            self.set_state(ConnectionState::Closing);
            return;
        };

        let reason = loop {
            let received = tokio::select! {
                received = timeout(self.config.recv_timeout, reader.next_message()) => received,
                _ = self.outbox.write_failed() => {
                    if self.outbox.is_open().await {
                        continue;
                    }
                    break TransportError::WriteFailed;
                }
            };
            let message = match received {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => break e,
                Err(_) => break TransportError::LivenessTimeout(self.config.recv_timeout),
            };
            if let Err(e) =
                handle_inbound(message, &self.outbox, &self.drain_trigger, &self.commands).await
            {
                break e.into();
            }
        };

        match reason {
            TransportError::Closed => info!("Gateway closed the connection"),
            other => warn!("Gateway connection lost: {}", other),
        }
        self.set_state(ConnectionState::Closing);
    }

    async fn close_session(&mut self) {
        self.session = None;
        if let Some(mut writer) = self.outbox.detach().await {
            let _ = timeout(Duration::from_secs(1), writer.close()).await;
        }
        tokio::time::sleep(self.config.reconnect_delay).await;
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn handle_inbound(
    message: Message,
    outbox: &GatewayOutbox,
    drain_trigger: &Notify,
    commands: &mpsc::Sender<Command>,
) -> Result<(), ProtocolError> {
    match message {
        Message::Text(text) if text == PING => {
            outbox.send_text(PONG).await?;
            // a liveness exchange just succeeded: good moment to flush the backlog
            drain_trigger.notify_one();
        }
        Message::Text(text) if text == PONG => debug!("Unsolicited PONG from gateway"),
        Message::Text(text) => match Command::parse(&text) {
            Some(command) => {
                info!("Gateway command: {:?}", command);
                if commands.try_send(command).is_err() {
                    warn!("Command queue full, dropping command");
                }
            }
            None => warn!("Ignoring unrecognised gateway message: {}", text),
        },
        Message::Ping(payload) => outbox.send(Opcode::Pong, &payload).await?,
        Message::Pong(_) => {}
        Message::Binary(payload) => debug!("Ignoring {} byte binary message", payload.len()),
    }
    Ok(())
}

/// Applies gateway commands to the runtime state and the scheduler.
pub async fn run_command_loop(
    mut commands: mpsc::Receiver<Command>,
    runtime: RuntimeState,
    scheduler: SchedulerHandle,
    mut shutdown: Shutdown,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.wait() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            Command::ReadNow => {
                if !scheduler.read_now() {
                    debug!("On-demand read already pending");
                }
            }
            Command::SetSpeed { factor } => {
                runtime.set_speed_factor(factor);
            }
            Command::Reboot => runtime.request_reboot(),
        }
    }
}
