//! Ingestion role: read, validate, advise, enqueue.

use super::{InvalidRangePolicy, Reply, ServeError, SessionOptions};
use crate::channel::BoundedChannel;
use crate::source::ByteSource;
use crate::wire::{self, PAYLOAD_LEN};
use bytes::BytesMut;
use std::io::Read;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub(crate) struct IngestStats {
    pub queued: u64,
    pub rejected: u64,
}

/// Read requests until the peer stops sending or an error occurs.
///
/// Each validated request is advised to the source before it is queued, so
/// hints for later requests are issued while earlier ones are still being
/// transmitted. `enqueue` blocks while the channel is full. A closed channel
/// means transmission has stopped and ends ingestion quietly.
pub(crate) fn run<R: Read + ?Sized>(
    reader: &mut R,
    source: &dyn ByteSource,
    channel: &BoundedChannel<Reply>,
    options: &SessionOptions,
) -> Result<IngestStats, ServeError> {
    let size = source.len();
    let mut scratch = BytesMut::with_capacity(PAYLOAD_LEN);
    let mut stats = IngestStats::default();

    loop {
        let request =
            match wire::read_request(reader, options.wire, options.max_message, &mut scratch)? {
                Some(request) => request,
                None => {
                    debug!(
                        queued = stats.queued,
                        rejected = stats.rejected,
                        "Peer finished sending"
                    );
                    return Ok(stats);
                }
            };
        trace!(
            offset = request.offset,
            length = request.length,
            "Range requested"
        );

        let reply = if request.fits_within(size) {
            source
                .advise(request.offset, request.length)
                .map_err(|e| ServeError::Advise { request, source: e })?;
            Reply::Range(request)
        } else {
            stats.rejected += 1;
            warn!(
                offset = request.offset,
                length = request.length,
                size,
                policy = ?options.invalid_range,
                "Invalid read requested"
            );
            match options.invalid_range {
                InvalidRangePolicy::Drop => continue,
                InvalidRangePolicy::Disconnect => {
                    return Err(ServeError::OutOfRange { request, size })
                }
                InvalidRangePolicy::ZeroFill => {
                    let reply = Reply::Padded(request);
                    let available = reply.in_bounds(size);
                    if available > 0 {
                        source
                            .advise(request.offset, available)
                            .map_err(|e| ServeError::Advise { request, source: e })?;
                    }
                    reply
                }
            }
        };

        if channel.enqueue(reply).is_err() {
            debug!("Transmission stopped, ending ingestion");
            return Ok(stats);
        }
        stats.queued += 1;
        trace!(depth = channel.len(), "Reply queued");
    }
}
