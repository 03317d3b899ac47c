//! Memory-mapped byte source.

use super::{check_range, write_fully, ByteSource, Sink};
use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io;

/// A read-only mapping of the whole file.
pub struct MappedSource {
    map: Mmap,
}

impl MappedSource {
    /// Map `file` read-only.
    pub fn new(file: &File) -> io::Result<Self> {
        // Safety: the mapping is read-only and the file is not modified by
        // this process while it is served.
        let map = unsafe { Mmap::map(file)? };
        Ok(Self { map })
    }
}

impl ByteSource for MappedSource {
    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn advise(&self, offset: u64, length: u32) -> io::Result<()> {
        check_range(self.len(), offset, length)?;
        if length == 0 {
            return Ok(());
        }
        self.map
            .advise_range(Advice::Sequential, offset as usize, length as usize)
    }

    fn transmit(&self, sink: &mut dyn Sink, offset: u64, length: u32) -> io::Result<()> {
        check_range(self.len(), offset, length)?;
        let start = offset as usize;
        write_fully(sink, &self.map[start..start + length as usize])
    }
}
