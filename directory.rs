//! Directory hierarchies as a sequence of entry records.
//!
//! ## Entry layout
//!
//! ```text
//! [kind:u8][path len:u64][path]
//!   REGULAR : [size:u64][content]
//!   SYMLINK : [len:u64][link target]
//!   HARDLINK: [len:u64][path of the earlier REGULAR entry]
//! ```
//!
//! Paths are UTF-8, `/`-separated and start with the name of the encoded
//! root. Entries come in depth-first pre-order with siblings sorted by name,
//! so a directory always precedes its children and a hardlink always follows
//! the file it points at.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CryptError, CryptResult, Warning};

/// Longest path or link target accepted when decoding.
const MAX_PATH_LEN: u64 = 64 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory = 0,
    Regular = 1,
    Symlink = 2,
    Hardlink = 3,
}

impl TryFrom<u8> for EntryKind {
    type Error = CryptError;

    fn try_from(kind: u8) -> Result<Self, Self::Error> {
        match kind {
            0 => Ok(Self::Directory),
            1 => Ok(Self::Regular),
            2 => Ok(Self::Symlink),
            3 => Ok(Self::Hardlink),
            other => Err(CryptError::format(format!("unknown directory entry type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPayload {
    Directory,
    Regular { size: u64 },
    Symlink { target: String },
    Hardlink { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub path: String,
    pub payload: EntryPayload,
}

impl DirectoryEntry {
    pub fn kind(&self) -> EntryKind {
        match self.payload {
            EntryPayload::Directory => EntryKind::Directory,
            EntryPayload::Regular { .. } => EntryKind::Regular,
            EntryPayload::Symlink { .. } => EntryKind::Symlink,
            EntryPayload::Hardlink { .. } => EntryKind::Hardlink,
        }
    }

    /// Writes the record up to (not including) REGULAR content bytes.
    pub fn write_header<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.kind() as u8)?;
        write_text(w, &self.path)?;
        match &self.payload {
            EntryPayload::Directory => Ok(()),
            EntryPayload::Regular { size } => w.write_u64::<BigEndian>(*size),
            EntryPayload::Symlink { target } | EntryPayload::Hardlink { target } => write_text(w, target),
        }
    }

    /// Reads a record header; REGULAR content is left in the stream.
    pub fn read_header<R: Read>(r: &mut R) -> CryptResult<Self> {
        let kind = EntryKind::try_from(r.read_u8().map_err(|e| CryptError::truncated(e, "directory entry"))?)?;
        let path = read_text(r)?;
        validate_relative(&path)?;
        let payload = match kind {
            EntryKind::Directory => EntryPayload::Directory,
            EntryKind::Regular => EntryPayload::Regular {
                size: r
                    .read_u64::<BigEndian>()
                    .map_err(|e| CryptError::truncated(e, "directory entry"))?,
            },
            EntryKind::Symlink => EntryPayload::Symlink { target: read_text(r)? },
            EntryKind::Hardlink => {
                let target = read_text(r)?;
                validate_relative(&target)?;
                EntryPayload::Hardlink { target }
            }
        };
        Ok(Self { path, payload })
    }
}

fn write_text<W: Write>(w: &mut W, text: &str) -> io::Result<()> {
    w.write_u64::<BigEndian>(text.len() as u64)?;
    w.write_all(text.as_bytes())
}

fn read_text<R: Read>(r: &mut R) -> CryptResult<String> {
    let len = r
        .read_u64::<BigEndian>()
        .map_err(|e| CryptError::truncated(e, "directory entry"))?;
    if len > MAX_PATH_LEN {
        return Err(CryptError::format(format!("entry path of {len} bytes is too long")));
    }
    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw)
        .map_err(|e| CryptError::truncated(e, "directory entry"))?;
    String::from_utf8(raw).map_err(|_| CryptError::format("entry path is not valid UTF-8"))
}

/// Rejects paths that could escape the target directory.
pub fn validate_relative(path: &str) -> CryptResult<()> {
    if path.is_empty() {
        return Err(CryptError::format("empty entry path"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(CryptError::format(format!("entry path '{path}' is not relative")));
    }
    if path.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(CryptError::format(format!("entry path '{path}' has an invalid component")));
    }
    Ok(())
}

/// One scanned entry together with where its content comes from.
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub entry: DirectoryEntry,
    pub source: PathBuf,
}

/// Result of the pre-scan: every entry to encode and the bytes they hold.
#[derive(Debug, Default)]
pub struct TreePlan {
    pub entries: Vec<PlannedEntry>,
    pub total_bytes: u64,
    pub warnings: Vec<Warning>,
}

#[cfg(unix)]
fn file_identity(metadata: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

fn root_name(root: &Path) -> CryptResult<String> {
    let name = match root.file_name() {
        Some(name) => name.to_os_string(),
        None => fs::canonicalize(root)?
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "root".into()),
    };
    name.into_string()
        .map_err(|_| CryptError::format(format!("{} is not a UTF-8 name", root.display())))
}

fn entry_path(root_name: &str, relative: &Path) -> Option<String> {
    let mut path = root_name.to_string();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                path.push('/');
                path.push_str(part.to_str()?);
            }
            _ => return None,
        }
    }
    Some(path)
}

/// Walks `root` and plans every entry before any payload byte is written.
///
/// With `store_links` false, hardlinks are stored as independent files and
/// symlinks are always dereferenced.
pub fn scan(
    root: &Path,
    follow_links: bool,
    store_links: bool,
    cancel: &CancellationToken,
) -> CryptResult<TreePlan> {
    let follow = follow_links || !store_links;
    let root_name = root_name(root)?;
    let mut plan = TreePlan::default();
    let mut seen: HashMap<(u64, u64), String> = HashMap::new();

    let mut walker = WalkDir::new(root)
        .follow_links(follow)
        .sort_by_file_name()
        .into_iter();

    while let Some(item) = walker.next() {
        if cancel.is_cancelled() {
            return Err(CryptError::Cancelled);
        }

        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                let shown = err.path().map(|p| p.display().to_string()).unwrap_or_default();
                let dangling = err
                    .io_error()
                    .map(|e| e.kind() == io::ErrorKind::NotFound)
                    .unwrap_or(false);
                if err.loop_ancestor().is_some() || dangling {
                    warn!(path = %shown, error = %err, "skipping unresolvable link");
                    plan.warnings.push(Warning::Link(shown));
                    continue;
                }
                return Err(CryptError::Io(err.into()));
            }
        };

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(path) = entry_path(&root_name, relative) else {
            warn!(path = %entry.path().display(), "skipping entry with a non UTF-8 name");
            plan.warnings.push(Warning::Link(entry.path().display().to_string()));
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        };

        let file_type = entry.file_type();
        let payload = if file_type.is_dir() {
            EntryPayload::Directory
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(io::Error::from)?;
            let identity = if store_links { file_identity(&metadata) } else { None };
            match identity.and_then(|id| seen.get(&id).map(|first| (id, first.clone()))) {
                Some((_, first)) => EntryPayload::Hardlink { target: first },
                None => {
                    if let Some(id) = identity {
                        seen.insert(id, path.clone());
                    }
                    plan.total_bytes += metadata.len();
                    EntryPayload::Regular { size: metadata.len() }
                }
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            match target.to_str() {
                Some(text) => EntryPayload::Symlink {
                    target: text.to_string(),
                },
                None => {
                    warn!(path = %path, "skipping symlink with a non UTF-8 target");
                    plan.warnings.push(Warning::Link(path));
                    continue;
                }
            }
        } else {
            warn!(path = %path, "skipping unsupported file type");
            plan.warnings.push(Warning::Link(path));
            continue;
        };

        plan.entries.push(PlannedEntry {
            entry: DirectoryEntry { path, payload },
            source: entry.path().to_path_buf(),
        });
    }

    debug!(
        root = %root.display(),
        entries = plan.entries.len(),
        bytes = plan.total_bytes,
        "Scanned directory tree"
    );
    Ok(plan)
}

/// Materializes decoded entries below a target directory.
pub struct TreeBuilder {
    root: PathBuf,
    materialized: HashSet<String>,
}

impl TreeBuilder {
    /// Uses `root` as the target, creating it when missing.
    pub fn new(root: impl Into<PathBuf>) -> CryptResult<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(CryptError::output_mismatch(format!(
                "{} is a file but the container holds a directory",
                root.display()
            )));
        }
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            materialized: HashSet::new(),
        })
    }

    /// Maps an entry path below the root. Every ancestor already on disk
    /// must be a real directory, so restored symlinks are never followed.
    fn resolve(&self, path: &str) -> CryptResult<PathBuf> {
        let mut target = self.root.clone();
        let mut parts = path.split('/').peekable();
        while let Some(part) = parts.next() {
            target.push(part);
            if parts.peek().is_none() {
                break;
            }
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(CryptError::format(format!("entry '{path}' passes through a symlink")));
                }
                Ok(meta) if !meta.is_dir() => {
                    return Err(CryptError::format(format!("entry '{path}' is nested below a file")));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(target)
    }

    fn clear(target: &Path) -> io::Result<()> {
        match fs::symlink_metadata(target) {
            Ok(meta) if !meta.is_dir() => fs::remove_file(target),
            _ => Ok(()),
        }
    }

    pub fn directory(&mut self, path: &str) -> CryptResult<()> {
        let target = self.resolve(path)?;
        if fs::symlink_metadata(&target).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return Err(CryptError::format(format!("directory '{path}' would replace a symlink")));
        }
        fs::create_dir_all(target)?;
        Ok(())
    }

    /// Creates (or truncates) a regular file and records it as a link target.
    pub fn create_file(&mut self, path: &str) -> CryptResult<File> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::clear(&target)?;
        let file = File::create(&target)?;
        self.materialized.insert(path.to_string());
        Ok(file)
    }

    /// Returns a warning instead of failing where symlinks are unavailable.
    pub fn symlink(&mut self, path: &str, link_target: &str) -> CryptResult<Option<Warning>> {
        let target = self.resolve(path)?;
        #[cfg(unix)]
        {
            Self::clear(&target)?;
            std::os::unix::fs::symlink(link_target, &target)?;
            Ok(None)
        }
        #[cfg(not(unix))]
        {
            warn!(path = %target.display(), link = link_target, "symlinks unsupported here, skipping");
            Ok(Some(Warning::Link(path.to_string())))
        }
    }

    pub fn hardlink(&mut self, path: &str, original: &str) -> CryptResult<()> {
        if !self.materialized.contains(original) {
            return Err(CryptError::format(format!(
                "hardlink '{path}' refers to '{original}' which was not restored earlier"
            )));
        }
        let target = self.resolve(path)?;
        let source = self.resolve(original)?;
        Self::clear(&target)?;
        fs::hard_link(source, &target)?;
        self.materialized.insert(path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_entry_header_layout() {
        let entry = DirectoryEntry {
            path: "top/a.txt".to_string(),
            payload: EntryPayload::Regular { size: 5 },
        };
        let mut bytes = Vec::new();
        entry.write_header(&mut bytes).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..9], &9u64.to_be_bytes());
        assert_eq!(&bytes[9..18], b"top/a.txt");
        assert_eq!(&bytes[18..], &5u64.to_be_bytes());

        let back = DirectoryEntry::read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_escaping_paths_are_rejected() {
        for bad in ["", "/etc/passwd", "top/../../x", "top/./x", "top//x", "a\\b"] {
            assert!(validate_relative(bad).is_err(), "{bad:?} accepted");
        }
        validate_relative("top/sub/file.txt").unwrap();

        let entry = DirectoryEntry {
            path: "../outside".to_string(),
            payload: EntryPayload::Directory,
        };
        let mut bytes = Vec::new();
        entry.write_header(&mut bytes).unwrap();
        assert!(matches!(
            DirectoryEntry::read_header(&mut Cursor::new(bytes)),
            Err(CryptError::Format(_))
        ));
    }

    #[test]
    fn test_scan_is_sorted_preorder() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("b/inner")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("b/inner/z.txt"), b"zz").unwrap();
        fs::write(root.join("a/y.txt"), b"yyy").unwrap();
        fs::write(root.join("c.txt"), b"c").unwrap();

        let plan = scan(&root, false, true, &CancellationToken::new()).unwrap();
        let paths: Vec<&str> = plan.entries.iter().map(|p| p.entry.path.as_str()).collect();
        assert_eq!(
            paths,
            ["tree", "tree/a", "tree/a/y.txt", "tree/b", "tree/b/inner", "tree/b/inner/z.txt", "tree/c.txt"]
        );
        assert_eq!(plan.total_bytes, 6);
        assert!(plan.warnings.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_detects_links() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("one"), b"shared").unwrap();
        fs::hard_link(root.join("one"), root.join("two")).unwrap();
        std::os::unix::fs::symlink("one", root.join("three")).unwrap();

        let plan = scan(&root, false, true, &CancellationToken::new()).unwrap();
        let payloads: Vec<&EntryPayload> = plan.entries.iter().map(|p| &p.entry.payload).collect();
        assert_eq!(payloads[1], &EntryPayload::Regular { size: 6 });
        assert_eq!(payloads[2], &EntryPayload::Symlink { target: "one".to_string() });
        assert_eq!(payloads[3], &EntryPayload::Hardlink { target: "tree/one".to_string() });
        assert_eq!(plan.total_bytes, 6);

        // Without link support everything becomes plain content
        let plan = scan(&root, false, false, &CancellationToken::new()).unwrap();
        assert!(plan
            .entries
            .iter()
            .skip(1)
            .all(|p| p.entry.payload == EntryPayload::Regular { size: 6 }));
        assert_eq!(plan.total_bytes, 18);
    }

    #[test]
    fn test_scan_honours_cancellation() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(scan(dir.path(), false, true, &cancel), Err(CryptError::Cancelled)));
    }

    #[test]
    fn test_builder_requires_materialized_hardlink_target() {
        let dir = TempDir::new().unwrap();
        let mut builder = TreeBuilder::new(dir.path().join("out")).unwrap();
        builder.directory("top").unwrap();
        assert!(matches!(builder.hardlink("top/b", "top/a"), Err(CryptError::Format(_))));

        let mut file = builder.create_file("top/a").unwrap();
        file.write_all(b"data").unwrap();
        drop(file);
        builder.hardlink("top/b", "top/a").unwrap();
        assert_eq!(fs::read(dir.path().join("out/top/b")).unwrap(), b"data");
    }

    #[cfg(unix)]
    #[test]
    fn test_builder_never_writes_through_restored_symlink() {
        let dir = TempDir::new().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let mut builder = TreeBuilder::new(dir.path().join("out")).unwrap();
        builder.directory("top").unwrap();
        builder.symlink("top/link", outside.to_str().unwrap()).unwrap();

        assert!(matches!(builder.create_file("top/link/pwned"), Err(CryptError::Format(_))));
        assert!(matches!(builder.directory("top/link/sub"), Err(CryptError::Format(_))));
        assert!(matches!(builder.symlink("top/link/s", "x"), Err(CryptError::Format(_))));
        assert!(matches!(builder.directory("top/link"), Err(CryptError::Format(_))));
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);

        // Replacing the link itself with a file is fine
        builder.create_file("top/link").unwrap();
        assert!(fs::symlink_metadata(dir.path().join("out/top/link")).unwrap().is_file());
    }

    #[test]
    fn test_truncated_entry_is_a_format_error() {
        let entry = DirectoryEntry {
            path: "top/a.txt".to_string(),
            payload: EntryPayload::Regular { size: 5 },
        };
        let mut bytes = Vec::new();
        entry.write_header(&mut bytes).unwrap();
        for cut in [0, 1, 5, 12, bytes.len() - 1] {
            let result = DirectoryEntry::read_header(&mut Cursor::new(&bytes[..cut]));
            assert!(matches!(result, Err(CryptError::Format(_))), "cut at {cut}");
        }
    }

    #[test]
    fn test_builder_refuses_file_target() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(TreeBuilder::new(&file), Err(CryptError::OutputMismatch(_))));
    }
}
