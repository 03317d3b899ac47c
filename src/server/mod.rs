//! Range server.
//!
//! Each connection is served by two threads joined only through a
//! `BoundedChannel<Reply>`:
//!
//! ```text
//! socket ──read──> [ingest] ──enqueue──> channel ──dequeue──> [transmit] ──write──> socket
//!                     │
//!                     └── advise(offset, length)
//! ```
//!
//! Ingestion advises the byte source as soon as a request is validated, so
//! paging hints run ahead of transmission by up to the channel capacity.
//! Transmission is the only writer, so responses leave in request order.
//!
//! The server handles one connection at a time: the accept loop does not
//! return to `accept` until the current session has ended.

mod ingest;
mod transmit;

use crate::channel::BoundedChannel;
use crate::config::ServeConfig;
use crate::cpu::{CpuClock, CpuTimes};
use crate::source::{open_source, ByteSource};
use crate::wire::{self, RangeRequest, ReadError, WireFormat};
use serde::Deserialize;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of channel slots per connection.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// What to do with a request that reaches past the end of the resource.
///
/// Responses carry no request id, so the peer matches them to requests by
/// position. `Drop` produces no response at all, which shifts every later
/// response by one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidRangePolicy {
    /// Log and skip the request; no response is sent for it.
    #[default]
    Drop,
    /// Send the in-bounds part of the range followed by zeros, so the
    /// response has the requested length.
    ZeroFill,
    /// End the connection.
    Disconnect,
}

/// A channel slot: one response the transmitter owes the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// A validated range, sent verbatim.
    Range(RangeRequest),
    /// An out-of-range request answered under `InvalidRangePolicy::ZeroFill`.
    Padded(RangeRequest),
}

impl Reply {
    pub fn request(&self) -> RangeRequest {
        match *self {
            Reply::Range(request) | Reply::Padded(request) => request,
        }
    }

    /// Number of response bytes that come from a resource of `size` bytes.
    pub fn in_bounds(&self, size: u64) -> u32 {
        let request = self.request();
        let available = size.saturating_sub(request.offset);
        available.min(u64::from(request.length)) as u32
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub queue_depth: usize,
    pub wire: WireFormat,
    pub max_message: usize,
    pub invalid_range: InvalidRangePolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            wire: WireFormat::default(),
            max_message: wire::DEFAULT_MAX_MESSAGE,
            invalid_range: InvalidRangePolicy::default(),
        }
    }
}

/// Summary of one finished connection.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Responses fully written.
    pub responses: u64,
    /// Requests that failed bounds validation.
    pub rejected: u64,
    /// Response bytes written.
    pub bytes: u64,
    pub elapsed: Duration,
    /// Process CPU time spent while the connection was open.
    pub cpu: CpuTimes,
}

impl SessionStats {
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Server errors.
#[derive(Debug)]
pub enum ServeError {
    /// The backing file could not be opened or mapped.
    Open(io::Error),
    /// The listening socket could not be set up.
    Bind(io::Error),
    /// `accept` failed.
    Accept(io::Error),
    /// A role thread could not be started.
    Spawn(io::Error),
    /// The peer's stream ended inside a message.
    Framing { expected: usize, got: usize },
    /// A complete message failed verification.
    Malformed(String),
    /// The paging hint for a validated range failed.
    Advise {
        request: RangeRequest,
        source: io::Error,
    },
    /// An out-of-range request under `InvalidRangePolicy::Disconnect`.
    OutOfRange { request: RangeRequest, size: u64 },
    /// Reading from or writing to the connection failed.
    Transport(io::Error),
}

impl ServeError {
    /// Whether the error ends the process rather than just the connection.
    ///
    /// Framing and payload errors leave no way to resynchronize, and a failed
    /// paging hint points at the I/O subsystem. Transport failures only
    /// affect the current peer.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ServeError::Transport(_) | ServeError::OutOfRange { .. }
        )
    }
}

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServeError::Open(e) => write!(f, "Failed to open byte source: {}", e),
            ServeError::Bind(e) => write!(f, "Failed to bind listener: {}", e),
            ServeError::Accept(e) => write!(f, "Accept failed: {}", e),
            ServeError::Spawn(e) => write!(f, "Failed to spawn connection thread: {}", e),
            ServeError::Framing { expected, got } => write!(
                f,
                "Partial read: expected {} bytes, got {}",
                expected, got
            ),
            ServeError::Malformed(msg) => write!(f, "Invalid request message: {}", msg),
            ServeError::Advise { request, source } => write!(
                f,
                "Paging advice failed for offset {} length {}: {}",
                request.offset, request.length, source
            ),
            ServeError::OutOfRange { request, size } => write!(
                f,
                "Requested range {}+{} exceeds resource size {}",
                request.offset, request.length, size
            ),
            ServeError::Transport(e) => write!(f, "Connection I/O failed: {}", e),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServeError::Open(e)
            | ServeError::Bind(e)
            | ServeError::Accept(e)
            | ServeError::Spawn(e)
            | ServeError::Transport(e) => Some(e),
            ServeError::Advise { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ReadError> for ServeError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Short { expected, got } => ServeError::Framing { expected, got },
            ReadError::Malformed(msg) => ServeError::Malformed(msg),
            ReadError::Io(e) => ServeError::Transport(e),
        }
    }
}

/// Serves byte ranges of one file.
pub struct Server {
    config: ServeConfig,
    source: Arc<dyn ByteSource>,
}

impl Server {
    /// Open the configured file and prepare to serve it.
    pub fn open(config: ServeConfig) -> Result<Self, ServeError> {
        let source = open_source(&config.path, config.source).map_err(ServeError::Open)?;
        if source.is_empty() {
            warn!(
                path = %config.path.display(),
                "Serving an empty file; every non-empty range will be rejected"
            );
        }
        Ok(Self::with_source(config, source))
    }

    /// Serve an already opened source.
    pub fn with_source(config: ServeConfig, source: Arc<dyn ByteSource>) -> Self {
        Self { config, source }
    }

    /// Create the listening socket.
    pub fn bind(&self) -> Result<TcpListener, ServeError> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| ServeError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        create_listener(addr).map_err(ServeError::Bind)
    }

    /// Accept and serve connections until a fatal error occurs.
    pub fn run(&self) -> Result<(), ServeError> {
        let listener = self.bind()?;
        info!(
            address = %self.config.listen,
            size = self.source.len(),
            queue_depth = self.config.queue_depth,
            wire = ?self.config.wire,
            "Server listening"
        );

        loop {
            match self.accept_one(&listener) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Connection failed"),
            }
        }
    }

    /// Accept one connection and serve it to completion.
    pub fn accept_one(&self, listener: &TcpListener) -> Result<SessionStats, ServeError> {
        debug!("Waiting for connections");
        let (stream, peer) = listener.accept().map_err(ServeError::Accept)?;
        info!(peer = %peer, "Accepted connection");

        let options = self.config.session_options();
        let stats = serve_connection(&stream, &*self.source, &options)?;

        info!(
            peer = %peer,
            responses = stats.responses,
            rejected = stats.rejected,
            bytes = stats.bytes,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            mib_per_sec = stats.mib_per_sec(),
            user_cpu_ms = stats.cpu.user.as_millis() as u64,
            system_cpu_ms = stats.cpu.system.as_millis() as u64,
            "Connection closed"
        );
        Ok(stats)
    }
}

/// Serve one connection until the peer stops sending or a role fails.
///
/// Runs the ingestion and transmission roles on their own threads and
/// returns once both have finished. When ingestion stops the channel is
/// closed and transmission drains what is already queued. When either role
/// fails the socket is shut down so a read or write blocked in the other
/// returns, and the first failure is the one reported.
pub fn serve_connection(
    stream: &TcpStream,
    source: &dyn ByteSource,
    options: &SessionOptions,
) -> Result<SessionStats, ServeError> {
    let mut reader = stream.try_clone().map_err(ServeError::Transport)?;
    let mut writer = stream.try_clone().map_err(ServeError::Transport)?;
    let channel = BoundedChannel::new(options.queue_depth);
    let torn_down = AtomicBool::new(false);
    let started = Instant::now();
    let cpu = CpuClock::start();
    debug!(
        capacity = channel.capacity(),
        wire = ?options.wire,
        "Session started"
    );

    // Returns whether this call was the first to tear the session down.
    let tear_down = || {
        channel.close();
        let first = !torn_down.swap(true, Ordering::SeqCst);
        if first {
            let _ = stream.shutdown(Shutdown::Both);
        }
        first
    };

    let (ingested, transmitted) = thread::scope(|scope| -> Result<_, ServeError> {
        let channel = &channel;
        let tear_down = &tear_down;

        let transmitter = thread::Builder::new()
            .name("transmit".to_string())
            .spawn_scoped(scope, move || {
                let result = transmit::run(&mut writer, source, channel);
                let first = result.is_err() && tear_down();
                (result, first)
            })
            .map_err(ServeError::Spawn)?;

        let ingester = thread::Builder::new()
            .name("ingest".to_string())
            .spawn_scoped(scope, move || {
                let result = ingest::run(&mut reader, source, channel, options);
                channel.close();
                let first = result.is_err() && tear_down();
                (result, first)
            });
        let ingester = match ingester {
            Ok(handle) => handle,
            Err(e) => {
                channel.close();
                return Err(ServeError::Spawn(e));
            }
        };

        let ingested = ingester
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        let transmitted = transmitter
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        Ok((ingested, transmitted))
    })?;

    let (ingested, transmitted) = match (ingested, transmitted) {
        ((Ok(ingested), _), (Ok(transmitted), _)) => {
            debug_assert!(channel.is_empty(), "transmission ended with queued replies");
            (ingested, transmitted)
        }
        ((Err(e), _), (Ok(_), _)) | ((Ok(_), _), (Err(e), _)) => return Err(e),
        ((Err(ingest_err), true), (Err(transmit_err), _)) => {
            debug!(error = %transmit_err, "Transmission stopped after ingestion failure");
            return Err(ingest_err);
        }
        ((Err(ingest_err), false), (Err(transmit_err), _)) => {
            debug!(error = %ingest_err, "Ingestion stopped after transmission failure");
            return Err(transmit_err);
        }
    };

    Ok(SessionStats {
        responses: transmitted.responses,
        rejected: ingested.rejected,
        bytes: transmitted.bytes,
        elapsed: started.elapsed(),
        cpu: cpu.elapsed(),
    })
}

/// Create a blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
