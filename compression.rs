//! zlib stage between the payload and the cipher-block pipeline.
//!
//! Compression drives flate2's low-level [`Compress`]/[`Decompress`] with
//! explicit cursors instead of the `write::ZlibEncoder` wrappers: the stage
//! must be switched on mid-stream, after the container header has already
//! gone through the same cipher pipeline uncompressed.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{self, Read, Write};
use std::mem;

/// Transfer buffer between the codec and the cipher stage.
const TRANSFER_SIZE: usize = 4 * 1024;

fn codec_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("zlib: {err}"))
}

pub struct CompressWriter<W: Write> {
    inner: W,
    codec: Compress,
    out: Vec<u8>,
}

impl<W: Write> CompressWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            codec: Compress::new(Compression::default(), true),
            out: vec![0u8; TRANSFER_SIZE],
        }
    }

    /// One codec pass; returns (status, bytes consumed, bytes produced).
    fn run(&mut self, input: &[u8], flush: FlushCompress) -> io::Result<(Status, usize, usize)> {
        let before_in = self.codec.total_in();
        let before_out = self.codec.total_out();
        let status = self
            .codec
            .compress(input, &mut self.out, flush)
            .map_err(codec_error)?;
        let used = (self.codec.total_in() - before_in) as usize;
        let produced = (self.codec.total_out() - before_out) as usize;
        if produced > 0 {
            self.inner.write_all(&self.out[..produced])?;
        }
        Ok((status, used, produced))
    }

    /// Flushes the codec to `StreamEnd` and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        loop {
            let (status, _, produced) = self.run(&[], FlushCompress::Finish)?;
            match status {
                Status::StreamEnd => break,
                Status::BufError if produced == 0 => {
                    return Err(codec_error("compressor stalled while finishing"));
                }
                _ => {}
            }
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while consumed < buf.len() {
            let (_, used, produced) = self.run(&buf[consumed..], FlushCompress::None)?;
            if used == 0 && produced == 0 {
                return Err(codec_error("compressor made no progress"));
            }
            consumed += used;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct DecompressReader<R: Read> {
    inner: R,
    codec: Decompress,
    input: Vec<u8>,
    pos: usize,
    len: usize,
    inner_eof: bool,
    done: bool,
}

impl<R: Read> DecompressReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            codec: Decompress::new(true),
            input: vec![0u8; TRANSFER_SIZE],
            pos: 0,
            len: 0,
            inner_eof: false,
            done: false,
        }
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // End of stream is sticky
        if self.done || buf.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        loop {
            if self.pos == self.len && !self.inner_eof {
                let n = self.inner.read(&mut self.input)?;
                self.inner_eof = n == 0;
                self.pos = 0;
                self.len = n;
            }

            let flush = if self.inner_eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let before_in = self.codec.total_in();
            let before_out = self.codec.total_out();
            let status = self
                .codec
                .decompress(&self.input[self.pos..self.len], &mut buf[written..], flush)
                .map_err(codec_error)?;
            let used = (self.codec.total_in() - before_in) as usize;
            let produced = (self.codec.total_out() - before_out) as usize;
            self.pos += used;
            written += produced;

            if status == Status::StreamEnd {
                self.done = true;
                return Ok(written);
            }
            if written == buf.len() {
                return Ok(written);
            }
            if used == 0 && produced == 0 && self.inner_eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "compressed stream ends early",
                ));
            }
        }
    }
}

/// Payload writer that can turn compression on mid-stream.
pub enum PayloadWriter<W: Write> {
    Plain(W),
    Compressed(CompressWriter<W>),
    Switching,
}

impl<W: Write> PayloadWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::Plain(inner)
    }

    pub fn start_compression(&mut self) {
        *self = match mem::replace(self, Self::Switching) {
            Self::Plain(inner) => Self::Compressed(CompressWriter::new(inner)),
            other => other,
        };
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(inner) => Ok(inner),
            Self::Compressed(writer) => writer.finish(),
            Self::Switching => Err(poisoned()),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "payload stage left mid-switch")
}

impl<W: Write> Write for PayloadWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.write(buf),
            Self::Compressed(writer) => writer.write(buf),
            Self::Switching => Err(poisoned()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(inner) => inner.flush(),
            Self::Compressed(writer) => writer.flush(),
            Self::Switching => Err(poisoned()),
        }
    }
}

/// Payload reader that can turn decompression on mid-stream.
pub enum PayloadReader<R: Read> {
    Plain(R),
    Compressed(DecompressReader<R>),
    Switching,
}

impl<R: Read> PayloadReader<R> {
    pub fn new(inner: R) -> Self {
        Self::Plain(inner)
    }

    pub fn start_decompression(&mut self) {
        *self = match mem::replace(self, Self::Switching) {
            Self::Plain(inner) => Self::Compressed(DecompressReader::new(inner)),
            other => other,
        };
    }
}

impl<R: Read> Read for PayloadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.read(buf),
            Self::Compressed(reader) => reader.read(buf),
            Self::Switching => Err(poisoned()),
        }
    }
}
