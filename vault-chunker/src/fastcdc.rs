//! Adapts the `fastcdc` crate's buffer-based gear-hash slicer for
//! callers that can't hand it a whole object at once: [`FastCdcChunker`]
//! owns a `Read` the way the crate expects, while [`FastCdcPusher`]
//! lets a streaming writer push one byte at a time and get sealed
//! chunks back as boundaries are found. Both fill a bounded buffer and
//! hand it to `fastcdc::FastCDC::new` to find the next cut point,
//! rather than re-deriving the rolling hash ourselves.

use std::io::Read;

use crate::ChunkerError;

/// A chunk-size envelope: the slicer reports chunks no smaller than
/// `min_size` (barring a final end-of-stream chunk) and no larger than
/// `max_size`, clustering around `avg_size`.
#[derive(Clone, Copy, Debug)]
pub struct FastCdc {
    min_size: usize,
    avg_size: usize,
    max_size: usize,
}

impl FastCdc {
    /// Panics if `min <= avg <= max` does not hold, since that
    /// describes an envelope the slicer can never settle inside.
    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> FastCdc {
        assert!(
            min_size > 0 && min_size <= avg_size && avg_size <= max_size,
            "chunker bounds must satisfy 0 < min <= avg <= max"
        );
        FastCdc { min_size, avg_size, max_size }
    }

    /// The conventional default envelope: 2 MiB average, 512 KiB
    /// floor, 8 MiB ceiling.
    pub fn default_envelope() -> FastCdc {
        FastCdc::new(512 << 10, 2 << 20, 8 << 20)
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Wraps any owned `Read` in a pull-based iterator of chunks.
    pub fn chunks<R: Read + 'static>(&self, read: R) -> FastCdcChunker {
        FastCdcChunker {
            settings: *self,
            source: Box::new(read),
            buffer: vec![0_u8; self.max_size],
            length: 0,
            eof: false,
        }
    }

    /// A push-based adapter for a caller that already owns its own
    /// write loop (an [`std::io::Write`] impl driven by arbitrarily
    /// sized, arbitrarily timed `write` calls) and just wants to know
    /// when a chunk boundary has been reached.
    pub fn pusher(&self) -> FastCdcPusher {
        FastCdcPusher {
            settings: *self,
            buffer: Vec::with_capacity(self.max_size),
        }
    }
}

/// Fills a `max_size` buffer from the source, asks the underlying
/// gear-hash slicer for the first boundary within it, drains that many
/// bytes, and refills — the same buffer-and-drain shape the slicer's
/// batch-only API forces on any streaming caller.
pub struct FastCdcChunker {
    settings: FastCdc,
    source: Box<dyn Read>,
    buffer: Vec<u8>,
    length: usize,
    eof: bool,
}

impl FastCdcChunker {
    fn fill_buffer(&mut self) -> Result<(), ChunkerError> {
        while !self.eof && self.length < self.buffer.len() {
            let read = self.source.read(&mut self.buffer[self.length..])?;
            if read == 0 {
                self.eof = true;
            } else {
                self.length += read;
            }
        }
        Ok(())
    }

    fn drain(&mut self, amount: usize) -> Vec<u8> {
        let chunk = self.buffer[..amount].to_vec();
        self.buffer.copy_within(amount..self.length, 0);
        self.length -= amount;
        chunk
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChunkerError> {
        self.fill_buffer()?;
        if self.length == 0 {
            return Ok(None);
        }
        let mut slicer = fastcdc::FastCDC::new(
            &self.buffer[..self.length],
            self.settings.min_size,
            self.settings.avg_size,
            self.settings.max_size,
        );
        match slicer.next() {
            Some(chunk) => Ok(Some(self.drain(chunk.length))),
            None => Err(ChunkerError::Empty),
        }
    }
}

impl Iterator for FastCdcChunker {
    type Item = Result<Vec<u8>, ChunkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Push-based equivalent of [`FastCdcChunker`]: a caller feeds bytes
/// one at a time as they arrive, instead of handing over a `Read` up
/// front.
pub struct FastCdcPusher {
    settings: FastCdc,
    buffer: Vec<u8>,
}

impl FastCdcPusher {
    /// Appends one byte. Returns a sealed chunk once the buffer holds
    /// `max_size` bytes and the slicer commits to a boundary within
    /// them.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.buffer.push(byte);
        if self.buffer.len() < self.settings.max_size {
            return None;
        }
        self.slice_one()
    }

    /// Drains one more sealed chunk from whatever is left in the
    /// buffer at end-of-stream. Callers must call this repeatedly
    /// until it returns `None` to flush every remaining chunk,
    /// including the final undersized one.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.slice_one()
    }

    /// Bytes buffered but not yet sealed into a chunk.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the buffered bytes without running them through the
    /// slicer, for a caller that has decided the whole payload is
    /// small enough to skip chunking entirely.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn slice_one(&mut self) -> Option<Vec<u8>> {
        let mut slicer = fastcdc::FastCDC::new(
            &self.buffer,
            self.settings.min_size,
            self.settings.avg_size,
            self.settings.max_size,
        );
        let chunk = slicer.next()?;
        let sealed = self.buffer[..chunk.length].to_vec();
        self.buffer.copy_within(chunk.length.., 0);
        let remaining = self.buffer.len() - chunk.length;
        self.buffer.truncate(remaining);
        Some(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn chunks_reconstruct_original_bytes() {
        let mut data = vec![0_u8; 1 << 20];
        rand::thread_rng().fill_bytes(&mut data);
        let chunker = FastCdc::new(1 << 10, 4 << 10, 16 << 10).chunks(std::io::Cursor::new(data.clone()));
        let mut reconstructed = Vec::new();
        for chunk in chunker {
            reconstructed.extend(chunk.unwrap());
        }
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn chunks_never_exceed_max_size() {
        let mut data = vec![0_u8; 1 << 20];
        rand::thread_rng().fill_bytes(&mut data);
        let chunker = FastCdc::new(1 << 10, 4 << 10, 16 << 10).chunks(std::io::Cursor::new(data));
        for chunk in chunker {
            assert!(chunk.unwrap().len() <= 16 << 10);
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunker = FastCdc::default_envelope().chunks(std::io::Cursor::new(Vec::<u8>::new()));
        let chunks: Vec<_> = chunker.collect();
        assert!(chunks.is_empty());
    }

    #[test]
    fn pusher_reconstructs_original_bytes_via_push_and_finish() {
        let mut data = vec![0_u8; 1 << 20];
        rand::thread_rng().fill_bytes(&mut data);
        let mut pusher = FastCdc::new(1 << 10, 4 << 10, 16 << 10).pusher();
        let mut reconstructed = Vec::new();
        for &byte in &data {
            if let Some(chunk) = pusher.push(byte) {
                reconstructed.extend(chunk);
            }
        }
        while let Some(chunk) = pusher.finish() {
            reconstructed.extend(chunk);
        }
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn identical_input_yields_identical_chunk_boundaries() {
        let mut data = vec![0_u8; 1 << 20];
        rand::thread_rng().fill_bytes(&mut data);
        let run_once = |data: &[u8]| -> Vec<usize> {
            FastCdc::default_envelope()
                .chunks(std::io::Cursor::new(data.to_vec()))
                .map(|c| c.unwrap().len())
                .collect()
        };
        assert_eq!(run_once(&data), run_once(&data));
    }
}
