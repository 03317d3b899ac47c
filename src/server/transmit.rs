//! Transmission role: drain the channel in order and write each range.

use super::{Reply, ServeError};
use crate::channel::BoundedChannel;
use crate::source::{write_fully, ByteSource, Sink};
use std::io;
use tracing::trace;

const ZEROS: [u8; 4096] = [0; 4096];

#[derive(Debug, Default)]
pub(crate) struct TransmitStats {
    pub responses: u64,
    pub bytes: u64,
}

/// Write every queued reply to `sink` until the channel reports end of
/// stream. The first transport error ends the role.
pub(crate) fn run(
    sink: &mut dyn Sink,
    source: &dyn ByteSource,
    channel: &BoundedChannel<Reply>,
) -> Result<TransmitStats, ServeError> {
    let mut stats = TransmitStats::default();

    while let Some(reply) = channel.dequeue() {
        let request = reply.request();
        match reply {
            Reply::Range(_) => source.transmit(sink, request.offset, request.length),
            Reply::Padded(_) => {
                let available = reply.in_bounds(source.len());
                send_padded(sink, source, request.offset, available, request.length)
            }
        }
        .map_err(ServeError::Transport)?;

        trace!(
            offset = request.offset,
            length = request.length,
            "Range sent"
        );
        stats.responses += 1;
        stats.bytes += u64::from(request.length);
    }

    Ok(stats)
}

fn send_padded(
    sink: &mut dyn Sink,
    source: &dyn ByteSource,
    offset: u64,
    available: u32,
    length: u32,
) -> io::Result<()> {
    if available > 0 {
        source.transmit(sink, offset, available)?;
    }
    let mut remaining = (length - available) as usize;
    while remaining > 0 {
        let n = remaining.min(ZEROS.len());
        write_fully(sink, &ZEROS[..n])?;
        remaining -= n;
    }
    Ok(())
}
