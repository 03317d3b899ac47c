//! Descriptor-backed byte source.
//!
//! Advises with `posix_fadvise` and transmits with `sendfile` when the sink
//! is a socket. Other sinks get positional reads through a bounce buffer.

use super::{check_range, write_fully, ByteSource, Sink};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
#[cfg(target_os = "linux")]
use std::os::unix::io::{AsRawFd, RawFd};

/// Bounce buffer size for the read + write path.
const COPY_CHUNK: usize = 64 * 1024;

/// An open, read-only file of fixed size.
pub struct DescriptorSource {
    file: File,
    len: u64,
}

impl DescriptorSource {
    pub fn new(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    fn copy_range(&self, sink: &mut dyn Sink, offset: u64, length: u32) -> io::Result<()> {
        let mut remaining = length as usize;
        let mut cursor = offset;
        let mut buf = vec![0u8; remaining.min(COPY_CHUNK)];

        while remaining > 0 {
            let n = remaining.min(buf.len());
            self.file.read_exact_at(&mut buf[..n], cursor)?;
            write_fully(sink, &buf[..n])?;
            cursor += n as u64;
            remaining -= n;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn send_file(&self, socket: RawFd, offset: u64, length: u32) -> io::Result<()> {
        let mut cursor = libc::off_t::try_from(offset)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut remaining = length as usize;

        while remaining > 0 {
            // Safety: both descriptors stay open for the duration of the call
            // and `cursor` is a valid, exclusively borrowed off_t.
            let sent =
                unsafe { libc::sendfile(socket, self.file.as_raw_fd(), &mut cursor, remaining) };
            match sent {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "sendfile made no progress",
                    ))
                }
                n => remaining -= n as usize,
            }
        }
        Ok(())
    }
}

impl ByteSource for DescriptorSource {
    fn len(&self) -> u64 {
        self.len
    }

    #[cfg(target_os = "linux")]
    fn advise(&self, offset: u64, length: u32) -> io::Result<()> {
        check_range(self.len, offset, length)?;
        // A zero length means "to end of file" to the kernel.
        if length == 0 {
            return Ok(());
        }
        let start = libc::off_t::try_from(offset)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // Safety: plain syscall on a descriptor we own.
        let ret = unsafe {
            libc::posix_fadvise(
                self.file.as_raw_fd(),
                start,
                length as libc::off_t,
                libc::POSIX_FADV_SEQUENTIAL,
            )
        };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }

    // No per-range descriptor hint outside Linux.
    #[cfg(not(target_os = "linux"))]
    fn advise(&self, offset: u64, length: u32) -> io::Result<()> {
        check_range(self.len, offset, length)
    }

    fn transmit(&self, sink: &mut dyn Sink, offset: u64, length: u32) -> io::Result<()> {
        check_range(self.len, offset, length)?;

        #[cfg(target_os = "linux")]
        {
            if let Some(socket) = sink.socket_fd() {
                return self.send_file(socket, offset, length);
            }
        }

        self.copy_range(sink, offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{backing_file, pattern, ChunkedSink};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn test_copy_path_spans_chunks() {
        let file = backing_file(200_000);
        let source = DescriptorSource::new(file.reopen().unwrap()).unwrap();
        assert_eq!(source.len(), 200_000);

        let mut sink = ChunkedSink::new(4096);
        source.transmit(&mut sink, 10, 150_000).unwrap();
        assert_eq!(sink.data, pattern(200_000)[10..150_010].to_vec());
    }

    #[test]
    fn test_zero_length() {
        let file = backing_file(16);
        let source = DescriptorSource::new(file.reopen().unwrap()).unwrap();

        let mut sink = Vec::new();
        source.transmit(&mut sink, 16, 0).unwrap();
        assert!(sink.is_empty());
        source.advise(16, 0).unwrap();
    }

    #[test]
    fn test_socket_path() {
        let file = backing_file(65536);
        let source = DescriptorSource::new(file.reopen().unwrap()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).unwrap();
            received
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        source.transmit(&mut stream, 4096, 32768).unwrap();
        drop(stream);

        assert_eq!(reader.join().unwrap(), pattern(65536)[4096..36864].to_vec());
    }

    #[test]
    fn test_out_of_range() {
        let file = backing_file(1024);
        let source = DescriptorSource::new(file.reopen().unwrap()).unwrap();

        let mut sink = Vec::new();
        assert!(source.transmit(&mut sink, 1000, 100).is_err());
        assert!(source.advise(1000, 100).is_err());
    }
}
