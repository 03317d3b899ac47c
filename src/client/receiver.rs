//! Receiver role: read fixed-size responses and release permits.

use super::FetchError;
use crate::limiter::OutstandingLimiter;
use crate::wire::read_full;
use bytes::BytesMut;
use std::io::Read;
use tracing::trace;

#[derive(Debug, Default)]
pub(crate) struct ReceiveStats {
    pub responses: u64,
    pub bytes: u64,
}

/// Read `block_size`-byte responses until `limit` have arrived.
///
/// Without a limit the role runs until the connection fails. Any response
/// cut short, including by end of stream, is a framing error.
pub(crate) fn run<R: Read + ?Sized>(
    reader: &mut R,
    limiter: &OutstandingLimiter,
    block_size: usize,
    limit: Option<u64>,
) -> Result<ReceiveStats, FetchError> {
    let mut buf = BytesMut::zeroed(block_size);
    let mut stats = ReceiveStats::default();

    while limit.map_or(true, |limit| stats.responses < limit) {
        let got = read_full(reader, &mut buf[..]).map_err(FetchError::Transport)?;
        if got < block_size {
            return Err(FetchError::Framing {
                expected: block_size,
                got,
            });
        }

        limiter.release();
        stats.responses += 1;
        stats.bytes += got as u64;
        trace!(responses = stats.responses, "Response received");
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn limiter_with(outstanding: usize) -> OutstandingLimiter {
        let limiter = OutstandingLimiter::new(outstanding.max(1));
        for _ in 0..outstanding {
            limiter.acquire().unwrap();
            limiter.commit();
        }
        limiter
    }

    #[test]
    fn test_reads_fixed_blocks() {
        let limiter = limiter_with(3);
        let mut reader = Cursor::new(vec![7u8; 300]);

        let stats = run(&mut reader, &limiter, 100, Some(3)).unwrap();

        assert_eq!(stats.responses, 3);
        assert_eq!(stats.bytes, 300);
        assert_eq!(limiter.outstanding(), 0);
    }

    #[test]
    fn test_short_response() {
        let limiter = limiter_with(2);
        let mut reader = Cursor::new(vec![0u8; 150]);

        let err = run(&mut reader, &limiter, 100, Some(2)).unwrap_err();

        assert!(matches!(
            err,
            FetchError::Framing {
                expected: 100,
                got: 50
            }
        ));
        assert_eq!(limiter.outstanding(), 1);
    }
}
