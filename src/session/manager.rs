//! Connection lifecycle between the host and the device.
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Handshaking ──▶ Live
//!      ▲               │               │            │
//!      └───────────────┴───────────────┴────────────┘  (error / retarget)
//! ```
//!
//! The [`SessionManager`] runs on a single worker thread and is the only
//! owner of the transport. Everything else talks to it through a
//! [`SessionHandle`], whose requests are applied between polls, so a
//! reconnect can never interleave with an in-flight read or write.

use super::transport::{Connector, PortTarget, Transport, TransportError};
use crate::device::DeviceConfig;
use crate::protocol::{decode, encode, Command, Frame, LineDecoder, Role, ValidationError};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 512;
/// Upper bound on reads per poll so a chatty device cannot starve requests.
const MAX_READS_PER_POLL: usize = 32;

/// Timing parameters of the session loop.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// Wait after a failed connection attempt
    pub reconnect_backoff: Duration,
    /// How long the reset line is held deasserted
    pub reset_pulse: Duration,
    /// Time the device needs to boot after a reset
    pub boot_settle: Duration,
    /// Sleep between drain reads while settling
    pub drain_poll: Duration,
    /// Gap between configuration commands during the handshake
    pub command_gap: Duration,
    /// Keepalive period while live
    pub ping_interval: Duration,
    /// Period of the session loop
    pub poll_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(2),
            reset_pulse: Duration::from_millis(100),
            boot_settle: Duration::from_secs(2),
            drain_poll: Duration::from_millis(10),
            command_gap: Duration::from_millis(100),
            ping_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl SessionTiming {
    /// No waiting anywhere. Used with in-memory transports.
    pub fn immediate() -> Self {
        Self {
            reconnect_backoff: Duration::ZERO,
            reset_pulse: Duration::ZERO,
            boot_settle: Duration::ZERO,
            drain_poll: Duration::ZERO,
            command_gap: Duration::ZERO,
            ping_interval: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }
}

/// Lifecycle phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Live,
}

/// What the session reports to the host side.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake finished; frames will follow
    Connected { port: String },
    /// A live connection was lost or closed
    Disconnected { reason: String },
    /// A decoded inbound frame, in arrival order
    Frame(Frame),
}

/// Requests accepted by the session worker.
#[derive(Debug, Clone)]
enum SessionRequest {
    Send(Command),
    ReplaceConfig(DeviceConfig),
    Retarget(Option<PortTarget>),
    Shutdown,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: Sender<SessionRequest>,
}

impl SessionHandle {
    /// Queue a command for the device.
    ///
    /// Out-of-range values are rejected here and never reach the wire.
    /// Commands queued while disconnected are dropped by the worker.
    pub fn send(&self, command: Command) -> Result<(), ValidationError> {
        command.validate()?;
        self.request(SessionRequest::Send(command));
        Ok(())
    }

    /// Replace the configuration replayed on every (re)connect.
    pub fn replace_config(&self, config: DeviceConfig) {
        self.request(SessionRequest::ReplaceConfig(config));
    }

    /// Close the current connection and connect to `target` instead.
    pub fn retarget(&self, target: Option<PortTarget>) {
        self.request(SessionRequest::Retarget(target));
    }

    /// Stop the worker after closing the transport.
    pub fn shutdown(&self) {
        self.request(SessionRequest::Shutdown);
    }

    fn request(&self, request: SessionRequest) {
        if self.tx.send(request).is_err() {
            tracing::warn!("Session worker is gone; request dropped");
        }
    }
}

/// The live connection. Exists only while the session is `Live`.
struct Session {
    transport: Box<dyn Transport>,
    port: String,
    last_keepalive_sent_at: Instant,
}

/// Owns the transport and pumps frames between the wire and the host.
pub struct SessionManager<C: Connector> {
    connector: C,
    target: Option<PortTarget>,
    config: DeviceConfig,
    timing: SessionTiming,
    state: SessionState,
    session: Option<Session>,
    decoder: LineDecoder,
    requests: Receiver<SessionRequest>,
    events: Sender<SessionEvent>,
    next_attempt: Option<Instant>,
    shutdown: bool,
}

impl<C: Connector + 'static> SessionManager<C> {
    /// Create a session manager, its handle and the event stream.
    pub fn new(
        connector: C,
        target: Option<PortTarget>,
        config: DeviceConfig,
        timing: SessionTiming,
    ) -> (Self, SessionHandle, Receiver<SessionEvent>) {
        let (req_tx, req_rx) = unbounded();
        let (evt_tx, evt_rx) = unbounded();

        let manager = Self {
            connector,
            target,
            config,
            timing,
            state: SessionState::Disconnected,
            session: None,
            decoder: LineDecoder::new(),
            requests: req_rx,
            events: evt_tx,
            next_attempt: None,
            shutdown: false,
        };

        (manager, SessionHandle { tx: req_tx }, evt_rx)
    }

    /// Run the loop on a dedicated thread until shut down.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("session".to_string())
            .spawn(move || self.run())
    }

    /// Run the loop on the current thread until shut down.
    pub fn run(mut self) {
        tracing::info!("Session worker started");
        while !self.shutdown {
            let started = Instant::now();
            self.poll_once();
            let elapsed = started.elapsed();
            if elapsed < self.timing.poll_interval {
                thread::sleep(self.timing.poll_interval - elapsed);
            }
        }
        self.close_session("shutdown");
        tracing::info!("Session worker stopped");
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a shutdown request has been applied.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// One iteration: apply requests, then connect or pump.
    pub fn poll_once(&mut self) {
        self.drain_requests();
        if self.shutdown {
            return;
        }

        match self.state {
            SessionState::Disconnected => {
                let due = self.next_attempt.map_or(true, |t| Instant::now() >= t);
                if self.target.is_some() && due {
                    self.connect();
                }
            }
            SessionState::Live => {
                if let Err(e) = self.pump_inbound().and_then(|_| self.keepalive()) {
                    self.lose_connection(&e.to_string());
                }
            }
            // Both phases complete inside connect()
            SessionState::Connecting | SessionState::Handshaking => {}
        }
    }

    fn drain_requests(&mut self) {
        loop {
            let request = match self.requests.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    // Every handle is gone; nobody can stop us any other way.
                    self.shutdown = true;
                    return;
                }
            };

            match request {
                SessionRequest::Send(command) => self.send_command(command),
                SessionRequest::ReplaceConfig(config) => {
                    tracing::debug!(?config, "Replay configuration replaced");
                    self.config = config;
                }
                SessionRequest::Retarget(target) => {
                    let port = target.as_ref().map(|t| t.to_string()).unwrap_or_default();
                    tracing::info!(%port, "Retargeting session");
                    self.close_session("retarget");
                    self.target = target;
                    self.next_attempt = None;
                }
                SessionRequest::Shutdown => {
                    self.shutdown = true;
                    return;
                }
            }
        }
    }

    fn send_command(&mut self, command: Command) {
        let result = match self.session.as_mut() {
            Some(session) => write_command(session.transport.as_mut(), command),
            None => {
                tracing::warn!(?command, "Not connected; command dropped");
                return;
            }
        };

        if let Err(e) = result {
            self.lose_connection(&e.to_string());
        }
    }

    fn connect(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };

        self.set_state(SessionState::Connecting);
        let mut transport = match self.connector.open(&target) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::debug!(error = %e, "Connection attempt failed");
                self.retry_later();
                return;
            }
        };

        self.set_state(SessionState::Handshaking);
        let last_ping = match self.handshake(transport.as_mut()) {
            Ok(last_ping) => last_ping,
            Err(e) => {
                tracing::warn!(error = %e, port = %target.path, "Handshake failed");
                self.retry_later();
                return;
            }
        };

        self.decoder.reset();
        self.session = Some(Session {
            transport,
            port: target.path.clone(),
            last_keepalive_sent_at: last_ping,
        });
        self.set_state(SessionState::Live);
        tracing::info!(port = %target, "Connected");
        self.emit(SessionEvent::Connected { port: target.path });
    }

    /// Reset the device, let it boot while draining stale bytes, then push
    /// the full configuration one command at a time.
    ///
    /// The device watchdog starts counting at boot, so keepalives go out
    /// during the settle window and once more after the configuration.
    /// Returns when the last PING was sent.
    fn handshake(&self, transport: &mut dyn Transport) -> Result<Instant, TransportError> {
        if transport.set_reset_line(false)? {
            thread::sleep(self.timing.reset_pulse);
            transport.set_reset_line(true)?;
        } else {
            tracing::debug!("Transport has no reset line; skipping reset pulse");
        }

        transport.discard_input()?;
        let mut last_ping = Instant::now();
        let deadline = last_ping + self.timing.boot_settle;
        let mut buf = [0u8; READ_CHUNK];
        let mut drained = 0usize;
        loop {
            let n = transport.read(&mut buf)?;
            drained += n;
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if now.duration_since(last_ping) >= self.timing.ping_interval {
                write_command(transport, Command::Ping)?;
                last_ping = now;
            }
            if n == 0 {
                thread::sleep(self.timing.drain_poll.min(deadline - now));
            }
        }
        if drained > 0 {
            tracing::debug!(bytes = drained, "Discarded bytes during boot settle");
        }

        for (i, command) in self.config.commands().into_iter().enumerate() {
            if i > 0 {
                thread::sleep(self.timing.command_gap);
            }
            write_command(transport, command)?;
        }
        write_command(transport, Command::Ping)?;
        Ok(Instant::now())
    }

    fn pump_inbound(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let mut buf = [0u8; READ_CHUNK];
        for _ in 0..MAX_READS_PER_POLL {
            let n = session.transport.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for line in self.decoder.push(&buf[..n]) {
                match decode(&line, Role::Host) {
                    Some(frame) => {
                        let _ = self.events.send(SessionEvent::Frame(frame));
                    }
                    None => tracing::debug!(%line, "Discarding unrecognised line"),
                }
            }
        }
        Ok(())
    }

    fn keepalive(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if session.last_keepalive_sent_at.elapsed() >= self.timing.ping_interval {
            write_command(session.transport.as_mut(), Command::Ping)?;
            session.last_keepalive_sent_at = Instant::now();
        }
        Ok(())
    }

    fn lose_connection(&mut self, reason: &str) {
        tracing::warn!(%reason, "Connection lost");
        self.close_session(reason);
        // Try again straight away; failures back off.
        self.next_attempt = None;
    }

    /// Release the transport. Reports a disconnect only if we were live.
    fn close_session(&mut self, reason: &str) {
        self.decoder.reset();
        if let Some(session) = self.session.take() {
            tracing::debug!(port = %session.port, "Transport released");
            drop(session);
            self.emit(SessionEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        self.set_state(SessionState::Disconnected);
    }

    fn retry_later(&mut self) {
        self.next_attempt = Some(Instant::now() + self.timing.reconnect_backoff);
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "Session state");
            self.state = state;
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn write_command(transport: &mut dyn Transport, command: Command) -> Result<(), TransportError> {
    match encode(&Frame::Command(command)) {
        Ok(line) => {
            tracing::debug!(line = %line.trim_end(), "TX");
            transport.write_all(line.as_bytes())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Refusing to send invalid command");
            Ok(())
        }
    }
}
