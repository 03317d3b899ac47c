//! Fetch client.
//!
//! Drives a range server with a cyclic read pattern. Two threads share one
//! connection and one `OutstandingLimiter`:
//! - requester: waits for a permit, sends the next range, commits the permit
//! - receiver: reads one `block_size` response, releases a permit
//!
//! Responses carry no framing; the receiver knows every response is exactly
//! `block_size` bytes because that is the only length the requester asks for.

mod receiver;
mod requester;

use crate::config::FetchConfig;
use crate::cpu::{CpuClock, CpuTimes};
use crate::limiter::OutstandingLimiter;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Offsets `0, B, 2B, ...` over a resource of `size` bytes, restarting at 0
/// whenever the next block would run past the end.
#[derive(Debug, Clone)]
pub struct OffsetCycle {
    next: u64,
    block: u64,
    size: u64,
}

impl OffsetCycle {
    pub fn new(block: u64, size: u64) -> Self {
        Self {
            next: 0,
            block,
            size,
        }
    }
}

impl Iterator for OffsetCycle {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.next;
        self.next = match current.checked_add(self.block) {
            Some(next) if next.saturating_add(self.block) <= self.size => next,
            _ => 0,
        };
        Some(current)
    }
}

/// Client errors.
#[derive(Debug)]
pub enum FetchError {
    /// No resolved address accepted the connection.
    Connect(io::Error),
    /// The server's stream ended inside a response.
    Framing { expected: usize, got: usize },
    /// Reading from or writing to the connection failed.
    Transport(io::Error),
    /// A role thread could not be started.
    Spawn(io::Error),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Connect(e) => write!(f, "Failed to connect: {}", e),
            FetchError::Framing { expected, got } => write!(
                f,
                "Short response: expected {} bytes, got {}",
                expected, got
            ),
            FetchError::Transport(e) => write!(f, "Connection I/O failed: {}", e),
            FetchError::Spawn(e) => write!(f, "Failed to spawn client thread: {}", e),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Connect(e) | FetchError::Transport(e) | FetchError::Spawn(e) => Some(e),
            FetchError::Framing { .. } => None,
        }
    }
}

/// Summary of one fetch session.
#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    /// Requests fully sent.
    pub requests: u64,
    /// Responses fully read.
    pub responses: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Highest number of unanswered requests observed.
    pub peak_outstanding: usize,
    /// Process CPU time spent during the session.
    pub cpu: CpuTimes,
}

impl FetchStats {
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

pub struct Fetcher {
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Resolve the configured host and connect to the first address that
    /// accepts.
    pub fn connect(&self) -> Result<TcpStream, FetchError> {
        let addrs = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(FetchError::Connect)?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    info!(address = %addr, "Connected");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(address = %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(FetchError::Connect(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", self.config.host),
            )
        })))
    }

    /// Connect and run one fetch session.
    pub fn run(&self) -> Result<FetchStats, FetchError> {
        let stream = self.connect()?;
        info!(
            block_size = self.config.block_size,
            max_outstanding = self.config.max_outstanding,
            resource_size = self.config.resource_size,
            requests = ?self.config.requests,
            wire = ?self.config.wire,
            "Fetching"
        );

        let stats = fetch_over(&stream, &self.config)?;

        info!(
            requests = stats.requests,
            responses = stats.responses,
            bytes = stats.bytes,
            peak_outstanding = stats.peak_outstanding,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            mib_per_sec = stats.mib_per_sec(),
            user_cpu_ms = stats.cpu.user.as_millis() as u64,
            system_cpu_ms = stats.cpu.system.as_millis() as u64,
            "Fetch finished"
        );
        Ok(stats)
    }
}

/// Run the requester and receiver roles over an established connection.
///
/// With a request count configured, the requester half-closes the
/// connection after the last request and the receiver stops after the
/// matching response. A failure in either role closes the limiter and shuts
/// the socket down so the other role wakes up.
pub fn fetch_over(stream: &TcpStream, config: &FetchConfig) -> Result<FetchStats, FetchError> {
    let mut reader = stream.try_clone().map_err(FetchError::Transport)?;
    let mut writer = stream.try_clone().map_err(FetchError::Transport)?;
    let limiter = OutstandingLimiter::new(config.max_outstanding);
    let started = Instant::now();
    let cpu = CpuClock::start();
    debug!(max_outstanding = limiter.max(), "Session started");

    let (sent, received) = thread::scope(|scope| -> Result<_, FetchError> {
        let limiter = &limiter;

        let receiver = thread::Builder::new()
            .name("receiver".to_string())
            .spawn_scoped(scope, move || {
                let result =
                    receiver::run(&mut reader, limiter, config.block_size as usize, config.requests);
                limiter.close();
                if result.is_err() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                result
            })
            .map_err(FetchError::Spawn)?;

        let requester = thread::Builder::new()
            .name("requester".to_string())
            .spawn_scoped(scope, move || {
                let offsets = OffsetCycle::new(u64::from(config.block_size), config.resource_size);
                let result = requester::run(
                    &mut writer,
                    limiter,
                    offsets,
                    config.block_size,
                    config.wire,
                    config.requests,
                );
                match result {
                    Ok(_) => {
                        let _ = stream.shutdown(Shutdown::Write);
                    }
                    Err(_) => {
                        limiter.close();
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
                result
            });
        let requester = match requester {
            Ok(handle) => handle,
            Err(e) => {
                limiter.close();
                let _ = stream.shutdown(Shutdown::Both);
                return Err(FetchError::Spawn(e));
            }
        };

        let sent = requester
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        let received = receiver
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        Ok((sent, received))
    })?;

    let (sent, received) = match (sent, received) {
        (Ok(sent), Ok(received)) => (sent, received),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => return Err(e),
        (Err(send_err), Err(receive_err)) => {
            debug!(error = %receive_err, "Receiver stopped after requester failure");
            return Err(send_err);
        }
    };

    Ok(FetchStats {
        requests: sent,
        responses: received.responses,
        bytes: received.bytes,
        elapsed: started.elapsed(),
        peak_outstanding: limiter.peak(),
        cpu: cpu.elapsed(),
    })
}
