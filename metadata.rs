//! Stream tags describing the payload.
//!
//! ## Layout
//!
//! ```text
//! [count:u8] then count x [id:u8][len:u16][payload:len]
//! ```
//!
//! The count doubles as the payload marker: the payload starts right after
//! the last counted tag. Versions without tags store a bare `u64` size.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{CryptError, CryptResult};
use crate::version::Capabilities;

/// Record size of BLOCKED framing.
pub const BLOCK_SIZE: u64 = 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagId {
    Size = 0,
    Blocked = 1,
    Compressed = 2,
    Directory = 3,
    Filename = 4,
}

impl TryFrom<u8> for TagId {
    type Error = CryptError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Size),
            1 => Ok(Self::Blocked),
            2 => Ok(Self::Compressed),
            3 => Ok(Self::Directory),
            4 => Ok(Self::Filename),
            other => Err(CryptError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTag {
    /// File length, or entry count in directory mode
    Size(u64),
    /// Record size of BLOCKED framing
    Blocked(u64),
    Compressed(bool),
    Directory(bool),
    /// Original file name, without any directory part
    Filename(String),
}

impl StreamTag {
    pub fn id(&self) -> TagId {
        match self {
            Self::Size(_) => TagId::Size,
            Self::Blocked(_) => TagId::Blocked,
            Self::Compressed(_) => TagId::Compressed,
            Self::Directory(_) => TagId::Directory,
            Self::Filename(_) => TagId::Filename,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let payload = match self {
            Self::Size(n) | Self::Blocked(n) => n.to_be_bytes().to_vec(),
            Self::Compressed(b) | Self::Directory(b) => vec![u8::from(*b)],
            Self::Filename(name) => name.as_bytes().to_vec(),
        };
        let len = u16::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "tag payload too long"))?;
        w.write_u8(self.id() as u8)?;
        w.write_u16::<BigEndian>(len)?;
        w.write_all(&payload)
    }

    pub fn read_from<R: Read>(r: &mut R) -> CryptResult<Self> {
        let cut = |e: io::Error| CryptError::truncated(e, "stream tags");
        let id = TagId::try_from(r.read_u8().map_err(cut)?)?;
        let len = r.read_u16::<BigEndian>().map_err(cut)? as usize;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).map_err(cut)?;

        let fixed = |expected: usize| -> CryptResult<()> {
            if len == expected {
                Ok(())
            } else {
                Err(CryptError::format(format!(
                    "tag {id:?} has length {len}, expected {expected}"
                )))
            }
        };

        let tag = match id {
            TagId::Size | TagId::Blocked => {
                fixed(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&payload);
                let value = u64::from_be_bytes(raw);
                if id == TagId::Size {
                    Self::Size(value)
                } else {
                    Self::Blocked(value)
                }
            }
            TagId::Compressed => {
                fixed(1)?;
                Self::Compressed(payload[0] != 0)
            }
            TagId::Directory => {
                fixed(1)?;
                Self::Directory(payload[0] != 0)
            }
            TagId::Filename => {
                let name = String::from_utf8(payload)
                    .map_err(|_| CryptError::format("filename tag is not valid UTF-8"))?;
                if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                    return Err(CryptError::format(format!("filename tag '{name}' is not a plain file name")));
                }
                Self::Filename(name)
            }
        };
        Ok(tag)
    }
}

/// Everything the tags say about a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub size: u64,
    pub blocked: Option<u64>,
    pub compressed: bool,
    pub directory: bool,
    pub filename: Option<String>,
}

impl StreamMetadata {
    /// Tags this metadata turns into for a version.
    pub fn tags(&self, caps: &Capabilities) -> Vec<StreamTag> {
        let mut tags = vec![StreamTag::Size(self.size)];
        if let Some(block) = self.blocked {
            tags.push(StreamTag::Blocked(block));
        }
        if caps.compression {
            tags.push(StreamTag::Compressed(self.compressed));
        }
        if caps.directories {
            tags.push(StreamTag::Directory(self.directory));
        }
        if caps.filename_tag {
            if let Some(name) = self.filename.as_ref().filter(|n| n.len() <= u16::MAX as usize) {
                tags.push(StreamTag::Filename(name.clone()));
            }
        }
        tags
    }

    pub fn write_to<W: Write>(&self, w: &mut W, caps: &Capabilities) -> io::Result<()> {
        if !caps.tags {
            return w.write_u64::<BigEndian>(self.size);
        }
        let tags = self.tags(caps);
        // At most five tags exist
        w.write_u8(tags.len() as u8)?;
        for tag in &tags {
            tag.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, caps: &Capabilities) -> CryptResult<Self> {
        let mut meta = Self::default();
        if !caps.tags {
            meta.size = r
                .read_u64::<BigEndian>()
                .map_err(|e| CryptError::truncated(e, "payload size"))?;
            return Ok(meta);
        }

        let count = r.read_u8().map_err(|e| CryptError::truncated(e, "stream tags"))?;
        for _ in 0..count {
            match StreamTag::read_from(r)? {
                StreamTag::Size(n) => meta.size = n,
                StreamTag::Blocked(n) => {
                    if n == 0 {
                        return Err(CryptError::format("BLOCKED tag with zero record size"));
                    }
                    meta.blocked = Some(n);
                }
                StreamTag::Compressed(b) => meta.compressed = b,
                StreamTag::Directory(b) => meta.directory = b,
                StreamTag::Filename(name) => meta.filename = Some(name),
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::FormatVersion;
    use std::io::Cursor;

    #[test]
    fn test_tag_wire_layout() {
        let mut bytes = Vec::new();
        StreamTag::Size(0x0102).write_to(&mut bytes).unwrap();
        assert_eq!(bytes, [0, 0, 8, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);

        let mut bytes = Vec::new();
        StreamTag::Compressed(true).write_to(&mut bytes).unwrap();
        assert_eq!(bytes, [2, 0, 1, 1]);
    }

    #[test]
    fn test_metadata_round_trip_per_version() {
        let meta = StreamMetadata {
            size: 4096,
            blocked: None,
            compressed: true,
            directory: false,
            filename: Some("report.pdf".to_string()),
        };
        for version in FormatVersion::ALL {
            let caps = version.caps();
            let mut bytes = Vec::new();
            meta.write_to(&mut bytes, caps).unwrap();
            let back = StreamMetadata::read_from(&mut Cursor::new(bytes), caps).unwrap();

            assert_eq!(back.size, 4096);
            assert_eq!(back.compressed, caps.compression);
            assert_eq!(back.filename.is_some(), caps.filename_tag, "{version}");
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let bytes = vec![1u8, 9, 0, 0];
        let err = StreamMetadata::read_from(&mut Cursor::new(bytes), FormatVersion::CURRENT.caps()).unwrap_err();
        assert!(matches!(err, CryptError::UnknownTag(9)));
    }

    #[test]
    fn test_truncated_tags_are_format_errors() {
        let meta = StreamMetadata {
            size: 10,
            filename: Some("a.txt".to_string()),
            ..Default::default()
        };
        let caps = FormatVersion::CURRENT.caps();
        let mut bytes = Vec::new();
        meta.write_to(&mut bytes, caps).unwrap();
        for cut in [0, 1, 2, 6, bytes.len() - 1] {
            let err = StreamMetadata::read_from(&mut Cursor::new(&bytes[..cut]), caps).unwrap_err();
            assert!(matches!(err, CryptError::Format(_)), "cut at {cut}: {err:?}");
        }
    }

    #[test]
    fn test_bad_lengths_and_names_are_format_errors() {
        let short_size = vec![0u8, 0, 4, 0, 0, 0, 1];
        assert!(matches!(
            StreamTag::read_from(&mut Cursor::new(short_size)),
            Err(CryptError::Format(_))
        ));

        let mut sneaky = vec![4u8, 0, 8];
        sneaky.extend_from_slice(b"../x.txt");
        assert!(matches!(
            StreamTag::read_from(&mut Cursor::new(sneaky)),
            Err(CryptError::Format(_))
        ));
    }
}
