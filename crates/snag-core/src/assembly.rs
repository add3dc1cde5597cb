//! On-disk assembly: the `.partial` file receiving positioned writes and
//! the `.partial.meta` sidecar that authorizes resume. The target path
//! appears only through the atomic rename at finalize.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::probe::Validators;

/// Suffix for the assembly file.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Suffix for the resume-metadata sidecar.
pub const META_SUFFIX: &str = ".partial.meta";

pub fn partial_path(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(PARTIAL_SUFFIX);
    PathBuf::from(s)
}

pub fn meta_path(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(META_SUFFIX);
    PathBuf::from(s)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// The `.partial` file. Pre-sized to the total once known so out-of-order
/// positioned writes never extend the file; sparse where the filesystem
/// supports it.
#[derive(Debug)]
pub struct Assembly {
    file: File,
    partial: PathBuf,
    target: PathBuf,
}

impl Assembly {
    /// Create or truncate the assembly file for a fresh fetch.
    pub fn create(target: &Path, total_size: Option<u64>) -> io::Result<Self> {
        let partial = partial_path(target);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)?;
        if let Some(total) = total_size {
            file.set_len(total)?;
        }
        Ok(Self {
            file,
            partial,
            target: target.to_path_buf(),
        })
    }

    /// Reopen an existing assembly file for resume. Returns the byte
    /// count already on disk.
    pub fn open_resume(target: &Path, total_size: Option<u64>) -> io::Result<(Self, u64)> {
        let partial = partial_path(target);
        let file = OpenOptions::new().read(true).write(true).open(&partial)?;
        let existing = file.metadata()?.len();
        if let Some(total) = total_size {
            if existing < total {
                file.set_len(total)?;
            }
        }
        Ok((
            Self {
                file,
                partial,
                target: target.to_path_buf(),
            },
            existing,
        ))
    }

    /// Positioned write; safe to call from any thread, in any order.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        write_all_at(&self.file, buf, offset)
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    /// Cut the file back to `len`. Used before finalize when the total
    /// was unknown and a retried stream landed fewer bytes than the
    /// first attempt wrote.
    pub fn truncate_to(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// fsync, atomically rename onto the target, drop the sidecar.
    pub fn finalize(&self) -> io::Result<()> {
        self.file.sync_all()?;
        std::fs::rename(&self.partial, &self.target)?;
        let _ = std::fs::remove_file(meta_path(&self.target));
        Ok(())
    }

    /// Remove the partial and its sidecar (integrity failure path).
    pub fn discard(&self) -> io::Result<()> {
        std::fs::remove_file(&self.partial)?;
        let _ = std::fs::remove_file(meta_path(&self.target));
        Ok(())
    }
}

/// Sidecar witness for resume decisions. File mtime is never consulted;
/// `committed` records the verified contiguous prefix, since the partial
/// itself is pre-sized to the total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialMeta {
    pub url: String,
    pub total_size: u64,
    /// Bytes of verified contiguous prefix landed so far.
    #[serde(default)]
    pub committed: u64,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl PartialMeta {
    pub fn new(url: &str, total_size: u64, committed: u64, validators: &Validators) -> Self {
        Self {
            url: url.to_string(),
            total_size,
            committed,
            etag: validators.etag.clone(),
            last_modified: validators.last_modified.clone(),
        }
    }

    /// Load the sidecar for `target`. Missing or unparsable file is None.
    pub fn load(target: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(meta_path(target)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn store(&self, target: &Path) -> io::Result<()> {
        let body = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(meta_path(target), body)
    }

    /// A recorded transfer may continue only when the server still
    /// reports the same validators and the same size.
    pub fn matches(&self, url: &str, total_size: u64, validators: &Validators) -> bool {
        if self.url != url || self.total_size != total_size {
            return false;
        }
        if !validators.usable() {
            return false;
        }
        self.etag == validators.etag && self.last_modified == validators.last_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn validators() -> Validators {
        Validators {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        }
    }

    #[test]
    fn test_out_of_order_writes_then_finalize() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let asm = Assembly::create(&target, Some(8)).unwrap();
        asm.write_at(4, b"5678").unwrap();
        asm.write_at(0, b"1234").unwrap();
        asm.finalize().unwrap();
        assert!(!partial_path(&target).exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"12345678");
    }

    #[test]
    fn test_presized_to_total() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let asm = Assembly::create(&target, Some(1 << 20)).unwrap();
        assert_eq!(
            std::fs::metadata(asm.partial_path()).unwrap().len(),
            1 << 20
        );
    }

    #[test]
    fn test_discard_removes_partial_and_meta() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let meta = PartialMeta::new("https://h/x", 8, 0, &validators());
        meta.store(&target).unwrap();
        let asm = Assembly::create(&target, Some(8)).unwrap();
        asm.discard().unwrap();
        assert!(!partial_path(&target).exists());
        assert!(!meta_path(&target).exists());
    }

    #[test]
    fn test_meta_round_trip_and_match() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let meta = PartialMeta::new("https://h/x", 100, 40, &validators());
        meta.store(&target).unwrap();
        let loaded = PartialMeta::load(&target).unwrap();
        assert_eq!(loaded, meta);
        assert!(loaded.matches("https://h/x", 100, &validators()));
        assert!(!loaded.matches("https://h/y", 100, &validators()));
        assert!(!loaded.matches("https://h/x", 99, &validators()));
        // Changed validator refuses resume.
        let changed = Validators {
            etag: Some("\"v2\"".into()),
            last_modified: None,
        };
        assert!(!loaded.matches("https://h/x", 100, &changed));
        // Absent validators refuse resume.
        assert!(!loaded.matches("https://h/x", 100, &Validators::default()));
    }

    #[test]
    fn test_resume_reports_existing_bytes() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let asm = Assembly::create(&target, Some(16)).unwrap();
        asm.write_at(0, b"0123456789abcdef").unwrap();
        drop(asm);
        let (_asm, existing) = Assembly::open_resume(&target, Some(16)).unwrap();
        assert_eq!(existing, 16);
    }
}
