//! Byte channels: a file, standard input or standard output.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum Channel {
    File { file: File, path: PathBuf },
    Stdin(io::Stdin),
    Stdout(io::Stdout),
}

impl Channel {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        Ok(Self::File {
            file: File::open(path)?,
            path: path.to_path_buf(),
        })
    }

    /// Creates or truncates `path` for writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::File {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn stdin() -> Self {
        Self::Stdin(io::stdin())
    }

    pub fn stdout() -> Self {
        Self::Stdout(io::stdout())
    }

    /// Size in bytes, when the channel is a regular file.
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::File { file, .. } => file.metadata().ok().map(|m| m.len()),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::File { file, .. } => file.seek(pos),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "standard streams are not seekable",
            )),
        }
    }

    /// Flushes buffered data and, for files, forces it to disk.
    pub fn sync(&mut self) -> io::Result<()> {
        match self {
            Self::File { file, .. } => {
                file.flush()?;
                file.sync_all()
            }
            Self::Stdout(out) => out.flush(),
            Self::Stdin(_) => Ok(()),
        }
    }

    pub fn close(mut self) -> io::Result<()> {
        self.sync()
    }

    pub fn describe(&self) -> String {
        match self {
            Self::File { path, .. } => path.display().to_string(),
            Self::Stdin(_) => "<stdin>".to_string(),
            Self::Stdout(_) => "<stdout>".to_string(),
        }
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File { file, .. } => file.read(buf),
            Self::Stdin(input) => input.read(buf),
            Self::Stdout(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot read from stdout",
            )),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File { file, .. } => file.write(buf),
            Self::Stdout(out) => out.write(buf),
            Self::Stdin(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot write to stdin",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File { file, .. } => file.flush(),
            Self::Stdout(out) => out.flush(),
            Self::Stdin(_) => Ok(()),
        }
    }
}

/// Removes a partially written output file; errors are ignored.
pub(crate) fn discard(path: &Path) {
    let _ = fs::remove_file(path);
}
