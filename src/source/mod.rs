//! Byte sources: fixed-size, randomly addressable views of the backing file.
//!
//! The pipeline only needs two things from a source:
//! - `advise`: tell the OS a range will be read sequentially soon
//! - `transmit`: write exactly one range to a connection
//!
//! Two backends exist:
//! - `MappedSource`: memory-mapped file, `madvise` + plain writes
//! - `DescriptorSource`: open descriptor, `posix_fadvise` + `sendfile`
//!   (or positional reads when the sink is not a socket)
//!
//! Sources are read-only and shared between the ingestion and transmission
//! roles without locking.

mod descriptor;
mod mapped;

pub use descriptor::DescriptorSource;
pub use mapped::MappedSource;

use serde::Deserialize;
use std::fs::File;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Destination of transmitted bytes.
///
/// Anything writable qualifies. Sinks backed by a socket may expose the
/// descriptor so a source can hand the copy to the kernel.
pub trait Sink: Write {
    fn socket_fd(&self) -> Option<RawFd> {
        None
    }
}

impl Sink for TcpStream {
    fn socket_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl Sink for Vec<u8> {}

/// A read-only backing resource of fixed size.
pub trait ByteSource: Send + Sync {
    /// Size of the resource in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hint that `[offset, offset + length)` will be read sequentially soon.
    fn advise(&self, offset: u64, length: u32) -> io::Result<()>;

    /// Write exactly `length` bytes starting at `offset` to `sink`.
    ///
    /// Partial writes are retried with an advancing cursor until the whole
    /// range has been accepted.
    fn transmit(&self, sink: &mut dyn Sink, offset: u64, length: u32) -> io::Result<()>;
}

/// Backend used to serve the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Memory-map the file.
    #[default]
    Mmap,
    /// Keep a descriptor and read through the kernel.
    Descriptor,
}

/// Open `path` and build the selected source.
pub fn open_source(path: &Path, kind: SourceKind) -> io::Result<Arc<dyn ByteSource>> {
    let file = File::open(path)?;
    let source: Arc<dyn ByteSource> = match kind {
        SourceKind::Mmap => Arc::new(MappedSource::new(&file)?),
        SourceKind::Descriptor => Arc::new(DescriptorSource::new(file)?),
    };

    info!(
        path = %path.display(),
        size = source.len(),
        kind = ?kind,
        "Opened byte source"
    );

    Ok(source)
}

/// Write all of `buf`, retrying partial writes.
///
/// A write that accepts zero bytes is an error; an interrupted write is
/// retried.
pub fn write_fully<W: Write + ?Sized>(sink: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match sink.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reject ranges that do not lie inside a resource of `size` bytes.
pub(crate) fn check_range(size: u64, offset: u64, length: u32) -> io::Result<()> {
    match offset.checked_add(u64::from(length)) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "range {}+{} outside resource of {} bytes",
                offset, length, size
            ),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{check_range, write_fully, ByteSource, Sink};
    use std::io::{self, Write};
    use std::sync::Mutex;

    /// Sink that accepts at most `chunk` bytes per write call.
    pub struct ChunkedSink {
        pub data: Vec<u8>,
        pub chunk: usize,
        pub calls: usize,
    }

    impl ChunkedSink {
        pub fn new(chunk: usize) -> Self {
            Self {
                data: Vec::new(),
                chunk,
                calls: 0,
            }
        }
    }

    impl Write for ChunkedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            let n = buf.len().min(self.chunk);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink for ChunkedSink {}

    /// Deterministic, position-dependent file content.
    pub fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    pub fn backing_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pattern(len)).unwrap();
        file.flush().unwrap();
        file
    }

    /// In-memory source that records every advisory call.
    pub struct MemorySource {
        pub data: Vec<u8>,
        pub advised: Mutex<Vec<(u64, u32)>>,
        pub fail_advise: bool,
    }

    impl MemorySource {
        pub fn new(len: usize) -> Self {
            Self {
                data: pattern(len),
                advised: Mutex::new(Vec::new()),
                fail_advise: false,
            }
        }

        pub fn advised(&self) -> Vec<(u64, u32)> {
            self.advised.lock().unwrap().clone()
        }
    }

    impl ByteSource for MemorySource {
        fn len(&self) -> u64 {
            self.data.len() as u64
        }

        fn advise(&self, offset: u64, length: u32) -> io::Result<()> {
            check_range(self.len(), offset, length)?;
            if self.fail_advise {
                return Err(io::Error::new(io::ErrorKind::Other, "advice refused"));
            }
            self.advised.lock().unwrap().push((offset, length));
            Ok(())
        }

        fn transmit(&self, sink: &mut dyn Sink, offset: u64, length: u32) -> io::Result<()> {
            check_range(self.len(), offset, length)?;
            let start = offset as usize;
            write_fully(sink, &self.data[start..start + length as usize])
        }
    }
}
