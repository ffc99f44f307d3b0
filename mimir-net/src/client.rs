//! Connection manager: owns the socket, reconnects forever, feeds
//! frames to the session.
//!
//! The client is poll-driven: the caller pumps [`MirrorClient::poll`]
//! from its event loop and reacts to the returned connection events.
//! All reconnect timing is expressed against the `Instant` passed in,
//! so the backoff ladder is deterministic.

use std::io::{self, BufWriter};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::framing::{read_frame, write_frame, Frame};
use crate::session::Session;

/// Event surfaced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and frames may flow.
    Open,
    /// One incoming frame.
    Frame(Frame),
    /// The connection is gone, expectedly or not.
    Closed,
}

/// Bidirectional text/binary frame socket, the seam to the real
/// network. Implementations surface events without blocking.
pub trait Transport {
    fn send(&mut self, frame: Frame) -> io::Result<()>;
    /// Next pending event, if any. Must not block.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

/// Opens a fresh [`Transport`] for each connection attempt.
pub trait Connector {
    type Transport: Transport;
    fn connect(&mut self, url: &str) -> io::Result<Self::Transport>;
}

/// Reconnect backoff tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after a clean start or a loss following a good connection.
    pub floor: Duration,
    /// Upper bound the delay never exceeds.
    pub ceiling: Duration,
    /// Growth factor applied per consecutive failed open.
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(500),
            ceiling: Duration::from_secs(20),
            factor: 1.5,
        }
    }
}

/// Connection lifecycle notification for consumers. There is no
/// user-facing exception channel; this is all they see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Lost a connection that had been established.
    Disconnected,
    /// An attempt never got as far as opening.
    FailedConnect,
}

/// Client endpoint of the mirror stream.
///
/// Owns at most one transport and one [`Session`] at a time; both are
/// discarded together when the connection dies, and reconnection
/// continues with a freshly computed URL until the client is dropped.
pub struct MirrorClient<C: Connector> {
    connector: C,
    url_fn: Box<dyn FnMut() -> String>,
    config: ReconnectConfig,
    delay: Duration,
    /// Whether the current transport has opened; reset on every close,
    /// so a loss followed by a failed attempt reports as failed-connect.
    opened: bool,
    next_attempt: Option<Instant>,
    transport: Option<C::Transport>,
    session: Option<Session>,
}

impl<C: Connector> MirrorClient<C> {
    /// The URL closure is consulted once per attempt, so the target
    /// endpoint may move between attempts.
    pub fn new(connector: C, url_fn: impl FnMut() -> String + 'static) -> Self {
        Self::with_config(connector, url_fn, ReconnectConfig::default())
    }

    pub fn with_config(
        connector: C,
        url_fn: impl FnMut() -> String + 'static,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            connector,
            url_fn: Box::new(url_fn),
            delay: config.floor,
            config,
            opened: false,
            next_attempt: None,
            transport: None,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.opened
    }

    /// Current reconnect delay, for status display.
    pub fn retry_delay(&self) -> Duration {
        self.delay
    }

    /// The live session, while connected. Cells and blocks obtained
    /// from it become orphaned when the connection dies.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Pump the connection: attempt reconnects that are due, consume
    /// transport events, and flush queued outgoing writes.
    pub fn poll(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();

        if self.transport.is_none() && self.next_attempt.map_or(true, |due| now >= due) {
            self.next_attempt = None;
            let url = (self.url_fn)();
            info!("connecting to {}", url);
            match self.connector.connect(&url) {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.opened = false;
                }
                Err(e) => {
                    warn!("connect to {} failed: {}", url, e);
                    self.fail_connect(&mut events, now);
                }
            }
        }

        loop {
            let event = match self.transport.as_mut() {
                Some(transport) => transport.poll_event(),
                None => None,
            };
            let Some(event) = event else { break };
            match event {
                TransportEvent::Open => {
                    self.opened = true;
                    self.delay = self.config.floor;
                    self.session = Some(Session::new());
                    info!("connected");
                    events.push(ConnectionEvent::Connected);
                }
                TransportEvent::Frame(Frame::Text(text)) => {
                    match self.session.as_mut() {
                        Some(session) => session.handle_text(&text),
                        None => warn!("text frame before open"),
                    }
                }
                TransportEvent::Frame(Frame::Binary(bytes)) => {
                    match self.session.as_mut() {
                        Some(session) => session.handle_binary(&bytes),
                        None => warn!("binary frame before open"),
                    }
                }
                TransportEvent::Closed => {
                    // the session dies with its socket; outstanding
                    // completions stay unresolved forever
                    self.transport = None;
                    self.session = None;
                    if self.opened {
                        self.opened = false;
                        self.next_attempt = Some(now + self.delay);
                        info!("connection lost, retrying in {:?}", self.delay);
                        events.push(ConnectionEvent::Disconnected);
                    } else {
                        self.fail_connect(&mut events, now);
                    }
                    break;
                }
            }
        }

        if self.opened {
            let outgoing = match self.session.as_mut() {
                Some(session) => session.drain_outbound(),
                None => Vec::new(),
            };
            if let Some(transport) = self.transport.as_mut() {
                for msg in outgoing {
                    if let Err(e) = transport.send(Frame::Text(msg.encode())) {
                        // the reader side will notice the close
                        warn!("send failed: {}", e);
                        break;
                    }
                }
            }
        }

        events
    }

    fn fail_connect(&mut self, events: &mut Vec<ConnectionEvent>, now: Instant) {
        self.opened = false;
        let grown = self.delay.as_secs_f64() * self.config.factor;
        self.delay = Duration::from_secs_f64(grown).min(self.config.ceiling);
        self.next_attempt = Some(now + self.delay);
        info!("retrying in {:?}", self.delay);
        events.push(ConnectionEvent::FailedConnect);
    }
}

/// TCP transport speaking the length-prefixed frame format, with a
/// background reader thread feeding an event channel.
pub struct TcpTransport {
    writer: BufWriter<TcpStream>,
    events: Receiver<TransportEvent>,
}

impl TcpTransport {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let read_stream = stream.try_clone()?;

        let (event_tx, event_rx) = mpsc::channel();
        // the stream is connected, so the transport is open as soon as
        // the caller starts polling
        let _ = event_tx.send(TransportEvent::Open);
        thread::spawn(move || reader_thread(read_stream, event_tx));

        Ok(Self {
            writer: BufWriter::new(stream),
            events: event_rx,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: Frame) -> io::Result<()> {
        write_frame(&mut self.writer, &frame)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(TransportEvent::Closed),
        }
    }
}

/// Background thread that reads frames until the stream dies.
fn reader_thread(stream: TcpStream, event_tx: Sender<TransportEvent>) {
    let mut reader = io::BufReader::new(stream);

    loop {
        match read_frame(&mut reader) {
            Ok(frame) => {
                if event_tx.send(TransportEvent::Frame(frame)).is_err() {
                    // receiver dropped, transport is being torn down
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    error!("stream read error: {}", e);
                }
                let _ = event_tx.send(TransportEvent::Closed);
                break;
            }
        }
    }
}

/// Connector dialing plain TCP addresses.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn connect(&mut self, url: &str) -> io::Result<Self::Transport> {
        TcpTransport::connect(url)
    }
}
