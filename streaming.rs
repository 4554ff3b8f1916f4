//! Cipher-block pipeline.
//!
//! [`CipherWriter`] and [`CipherReader`] sit directly on top of a channel
//! and turn an arbitrary byte stream into whole cipher blocks and back. The
//! caller may write or read in chunks of any size; block boundaries are an
//! internal detail.
//!
//! ## Padding
//!
//! ```text
//! [block][block]...[residue | random padding]
//! ```
//!
//! The final block is always present. When the data ends exactly on a block
//! boundary a full block of random padding follows. The decoder never needs
//! to know where the padding starts: the SIZE tag or BLOCKED framing tells it
//! how many bytes to consume.

use rand_core::RngCore;
use std::io::{self, Read, Write};
use zeroize::Zeroizing;

use crate::algorithms::BlockTransform;

/// Buffers plaintext into cipher blocks and writes ciphertext to `W`.
pub struct CipherWriter<W: Write> {
    inner: W,
    transform: Box<dyn BlockTransform>,
    block: Zeroizing<Vec<u8>>,
    filled: usize,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, transform: Box<dyn BlockTransform>) -> Self {
        let block = Zeroizing::new(vec![0u8; transform.block_size()]);
        Self {
            inner,
            transform,
            block,
            filled: 0,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        self.transform.apply(&mut self.block);
        self.inner.write_all(&self.block)?;
        self.filled = 0;
        Ok(())
    }

    /// Pads and writes the final block, then hands back the channel.
    pub fn finish(mut self, rng: &mut dyn RngCore) -> io::Result<W> {
        let filled = self.filled;
        rng.fill_bytes(&mut self.block[filled..]);
        self.emit()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let space = self.block.len() - self.filled;
            let take = space.min(rest.len());
            self.block[self.filled..self.filled + take].copy_from_slice(&rest[..take]);
            self.filled += take;
            rest = &rest[take..];

            // Residue stays buffered until the block is full
            if self.filled == self.block.len() {
                self.emit()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reads ciphertext from `R` and serves plaintext from a one-block cache.
pub struct CipherReader<R: Read> {
    inner: R,
    transform: Box<dyn BlockTransform>,
    block: Zeroizing<Vec<u8>>,
    pos: usize,
    len: usize,
    eof: bool,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, transform: Box<dyn BlockTransform>) -> Self {
        let block = Zeroizing::new(vec![0u8; transform.block_size()]);
        Self {
            inner,
            transform,
            block,
            pos: 0,
            len: 0,
            eof: false,
        }
    }

    /// Pulls and decrypts one block. Returns false at a clean end of stream.
    fn refill(&mut self) -> io::Result<bool> {
        let mut got = 0;
        while got < self.block.len() {
            match self.inner.read(&mut self.block[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if got == 0 {
            self.eof = true;
            return Ok(false);
        }
        if got < self.block.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input ends inside a cipher block",
            ));
        }

        self.transform.apply(&mut self.block);
        self.pos = 0;
        self.len = got;
        Ok(true)
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.pos == self.len && (self.eof || !self.refill()?) {
                break;
            }
            let take = (self.len - self.pos).min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
            written += take;
        }
        Ok(written)
    }
}
