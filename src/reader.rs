use std::io::{self, Read};

use crossbeam::channel::Receiver;

use crate::compute::TERMINATOR;

/// A span of the input holding only whole records.
///
/// Every chunk but the last ends with a line terminator. The last one may end
/// with a record that has no terminator, which the parser treats as complete.
#[derive(Debug)]
pub struct Chunk {
    pub index: u64,
    /// Byte position of `bytes[0]` in the input.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Reads its input in fixed-size windows and cuts each window back to the last
/// line terminator. The bytes after it are held back and become the start of
/// the next chunk.
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
    leftover: Vec<u8>,
    offset: u64,
    next_index: u64,
    eof: bool,
    recycled: Option<Receiver<Vec<u8>>>,
    allocations: u64,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
            leftover: Vec::new(),
            offset: 0,
            next_index: 0,
            eof: false,
            recycled: None,
            allocations: 0,
        }
    }

    /// Reuse buffers that come back over `recycled` before allocating new ones.
    pub fn with_recycler(mut self, recycled: Receiver<Vec<u8>>) -> Self {
        self.recycled = Some(recycled);
        self
    }

    /// How many fresh buffers this reader has had to allocate.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    fn buffer(&mut self) -> Vec<u8> {
        if let Some(mut buf) = self.recycled.as_ref().and_then(|rx| rx.try_recv().ok()) {
            buf.clear();
            return buf;
        }
        self.allocations += 1;
        Vec::with_capacity(self.chunk_size + self.leftover.len())
    }

    /// Returns the next record-aligned chunk, or `None` once the input is
    /// exhausted.
    ///
    /// A record longer than one window keeps the buffer growing, one window at
    /// a time, until a terminator or the end of the input shows up.
    pub fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.eof && self.leftover.is_empty() {
            return Ok(None);
        }

        let mut buf = self.buffer();
        buf.append(&mut self.leftover);

        loop {
            // everything before this has already been searched for a terminator
            let scanned = buf.len();
            if !self.eof {
                let want = self.chunk_size as u64;
                let read = (&mut self.inner).take(want).read_to_end(&mut buf)?;
                if (read as u64) < want {
                    self.eof = true;
                }
            }

            if self.eof {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.emit(buf)));
            }

            // this is the only place we need to look at the bytes: find how long
            // the incomplete final line is and hold it back for the next chunk.
            if let Some(pos) = buf[scanned..].iter().rposition(|&c| c == TERMINATOR) {
                let last = scanned + pos;
                self.leftover.extend_from_slice(&buf[last + 1..]);
                buf.truncate(last + 1);
                return Ok(Some(self.emit(buf)));
            }
        }
    }

    fn emit(&mut self, bytes: Vec<u8>) -> Chunk {
        let chunk = Chunk {
            index: self.next_index,
            offset: self.offset,
            bytes,
        };
        self.next_index += 1;
        self.offset += chunk.bytes.len() as u64;
        chunk
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
