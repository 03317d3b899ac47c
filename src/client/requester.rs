//! Requester role: issue ranges while the limiter admits them.

use super::{FetchError, OffsetCycle};
use crate::limiter::OutstandingLimiter;
use crate::source::write_fully;
use crate::wire::{encode, RangeRequest, WireFormat};
use std::io::Write;
use tracing::{debug, trace};

/// Send `block_size` requests at successive offsets until `limit` requests
/// have gone out or the limiter is closed. Returns the number sent.
///
/// A permit is committed only after the whole message has been written, so a
/// failed send is never counted as outstanding.
pub(crate) fn run<W: Write + ?Sized>(
    writer: &mut W,
    limiter: &OutstandingLimiter,
    offsets: OffsetCycle,
    block_size: u32,
    wire: WireFormat,
    limit: Option<u64>,
) -> Result<u64, FetchError> {
    let mut sent = 0u64;

    for offset in offsets {
        if limit.map_or(false, |limit| sent >= limit) {
            break;
        }
        if limiter.acquire().is_err() {
            debug!(sent, "Limiter closed, stopping requests");
            break;
        }

        let request = RangeRequest::new(offset, block_size);
        write_fully(writer, &encode(&request, wire)).map_err(FetchError::Transport)?;
        limiter.commit();
        sent += 1;

        trace!(
            offset,
            length = block_size,
            outstanding = limiter.outstanding(),
            "Request sent"
        );
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{read_request, DEFAULT_MAX_MESSAGE};
    use bytes::BytesMut;
    use std::io::{self, Cursor};

    #[test]
    fn test_sends_cyclic_offsets() {
        let limiter = OutstandingLimiter::new(16);
        let mut out = Vec::new();

        let sent = run(
            &mut out,
            &limiter,
            OffsetCycle::new(100, 250),
            100,
            WireFormat::Framed,
            Some(5),
        )
        .unwrap();

        assert_eq!(sent, 5);
        assert_eq!(limiter.outstanding(), 5);

        let mut reader = Cursor::new(out);
        let mut scratch = BytesMut::new();
        let mut offsets = Vec::new();
        while let Some(request) =
            read_request(&mut reader, WireFormat::Framed, DEFAULT_MAX_MESSAGE, &mut scratch).unwrap()
        {
            assert_eq!(request.length, 100);
            offsets.push(request.offset);
        }
        assert_eq!(offsets, vec![0, 100, 0, 100, 0]);
    }

    #[test]
    fn test_stops_when_limiter_closed() {
        let limiter = OutstandingLimiter::new(2);
        limiter.close();
        let mut out = Vec::new();

        let sent = run(
            &mut out,
            &limiter,
            OffsetCycle::new(10, 100),
            10,
            WireFormat::Raw,
            None,
        )
        .unwrap();

        assert_eq!(sent, 0);
        assert!(out.is_empty());
    }

    struct Refusing;

    impl Write for Refusing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer whose peer answers each request before `write` returns.
    struct AnsweredInline<'a> {
        limiter: &'a OutstandingLimiter,
        sent: Vec<u8>,
    }

    impl Write for AnsweredInline<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            self.limiter.release();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_response_before_commit() {
        let limiter = OutstandingLimiter::new(1);
        let mut writer = AnsweredInline {
            limiter: &limiter,
            sent: Vec::new(),
        };

        let sent = run(
            &mut writer,
            &limiter,
            OffsetCycle::new(10, 100),
            10,
            WireFormat::Raw,
            Some(4),
        )
        .unwrap();

        assert_eq!(sent, 4);
        assert_eq!(writer.sent.len(), 4 * crate::wire::RAW_LEN);
        assert_eq!(limiter.outstanding(), 0);
    }

    #[test]
    fn test_failed_send_not_counted() {
        let limiter = OutstandingLimiter::new(2);

        let err = run(
            &mut Refusing,
            &limiter,
            OffsetCycle::new(10, 100),
            10,
            WireFormat::Framed,
            Some(3),
        )
        .unwrap_err();

        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(limiter.outstanding(), 0);
    }
}
