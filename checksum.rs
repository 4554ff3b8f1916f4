//! Running checksum and MAC over the plaintext side of the pipeline.
//!
//! [`TapWriter`]/[`TapReader`] sit outermost and feed every byte that passes
//! through them to an [`Accumulator`]. The MAC runs from the first encrypted
//! byte to the end of the trailing checksum; the checksum is switched on just
//! before the payload and taken right after it.

use digest::DynDigest;
use std::io::{self, Read, Write};

use crate::algorithms::{HashAlgorithm, StreamMac};

#[derive(Default)]
pub struct Accumulator {
    checksum: Option<Box<dyn DynDigest + Send>>,
    mac: Option<Box<dyn StreamMac>>,
}

impl Accumulator {
    pub fn new(mac: Option<Box<dyn StreamMac>>) -> Self {
        Self { checksum: None, mac }
    }

    pub fn start_checksum(&mut self, hash: HashAlgorithm) {
        self.checksum = Some(hash.digest());
    }

    /// Ends the checksum and returns its digest; None if it never started.
    pub fn take_checksum(&mut self) -> Option<Vec<u8>> {
        self.checksum.take().map(|digest| digest.finalize().into_vec())
    }

    pub fn take_mac(&mut self) -> Option<Vec<u8>> {
        self.mac.take().map(|mac| mac.finalize())
    }

    fn update(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(checksum) = self.checksum.as_mut() {
            checksum.update(data);
        }
        if let Some(mac) = self.mac.as_mut() {
            mac.update(data);
        }
    }
}

pub struct TapWriter<W: Write> {
    inner: W,
    acc: Accumulator,
}

impl<W: Write> TapWriter<W> {
    pub fn new(inner: W, acc: Accumulator) -> Self {
        Self { inner, acc }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn accumulator(&mut self) -> &mut Accumulator {
        &mut self.acc
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for TapWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.acc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct TapReader<R: Read> {
    inner: R,
    acc: Accumulator,
}

impl<R: Read> TapReader<R> {
    pub fn new(inner: R, acc: Accumulator) -> Self {
        Self { inner, acc }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn accumulator(&mut self) -> &mut Accumulator {
        &mut self.acc
    }
}

impl<R: Read> Read for TapReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.acc.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::MacAlgorithm;
    use std::io::Cursor;

    #[test]
    fn test_checksum_covers_only_the_started_range() {
        let mut tap = TapWriter::new(Vec::new(), Accumulator::default());
        tap.write_all(b"header").expect("write");
        tap.accumulator().start_checksum(HashAlgorithm::Sha256);
        tap.write_all(b"pay").expect("write");
        tap.write_all(b"load").expect("write");
        let sum = tap.accumulator().take_checksum().expect("started");
        tap.write_all(b"trailer").expect("write");

        assert_eq!(sum, HashAlgorithm::Sha256.hash(b"payload"));
        assert_eq!(tap.into_inner(), b"headerpayloadtrailer");
    }

    #[test]
    fn test_reader_and_writer_agree() {
        let mac = MacAlgorithm(HashAlgorithm::Sha512);
        let mut writer = TapWriter::new(Vec::new(), Accumulator::new(Some(mac.keyed(b"k").expect("mac"))));
        writer.write_all(b"some bytes worth authenticating").expect("write");
        let written_mac = writer.accumulator().take_mac().expect("mac");
        let bytes = writer.into_inner();

        let mut reader = TapReader::new(Cursor::new(bytes), Accumulator::new(Some(mac.keyed(b"k").expect("mac"))));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).expect("read");
        assert_eq!(reader.accumulator().take_mac().expect("mac"), written_mac);
        assert!(reader.accumulator().take_mac().is_none());
    }
}
