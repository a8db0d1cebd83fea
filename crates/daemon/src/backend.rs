// Storage backend seam consumed by the accounting crawler.
//
// The crawler only needs to enumerate what exists, measure it, and delete
// it; actual share I/O lives behind the storage protocol and is out of
// scope here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Enumeration and deletion interface over the share tree.
///
/// Errors are plain `io::Error`; the crawler treats any failure as
/// "skip this bucket for the slice and retry next cycle".
pub trait Backend: Send + Sync {
    /// Storage-index directory names under a two-character prefix.
    fn list_prefix(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Share numbers present in one storage-index bucket.
    fn list_bucket(&self, prefix: &str, si_s: &str) -> io::Result<Vec<u32>>;

    /// Bytes used by one share file.
    fn used_space(&self, prefix: &str, si_s: &str, shnum: u32) -> io::Result<u64>;

    /// Unlink one share file.
    fn delete_share(&self, prefix: &str, si_s: &str, shnum: u32) -> io::Result<()>;
}

/// Default on-disk layout: `<root>/<prefix>/<storage_index>/<shnum>`.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, prefix: &str, si_s: &str) -> PathBuf {
        self.root.join(prefix).join(si_s)
    }

    fn share_path(&self, prefix: &str, si_s: &str, shnum: u32) -> PathBuf {
        self.bucket_dir(prefix, si_s).join(shnum.to_string())
    }
}

impl Backend for DiskBackend {
    fn list_prefix(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = self.root.join(prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // A prefix directory that was never created holds no shares.
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut buckets = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    buckets.push(name);
                }
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    fn list_bucket(&self, prefix: &str, si_s: &str) -> io::Result<Vec<u32>> {
        let dir = self.bucket_dir(prefix, si_s);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Bucket deleted out from under us between listing and visiting.
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut shnums = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            // Non-numeric names are not share files.
            if let Some(shnum) = name.to_str().and_then(|s| s.parse::<u32>().ok()) {
                shnums.push(shnum);
            }
        }
        shnums.sort_unstable();
        Ok(shnums)
    }

    fn used_space(&self, prefix: &str, si_s: &str, shnum: u32) -> io::Result<u64> {
        Ok(fs::metadata(self.share_path(prefix, si_s, shnum))?.len())
    }

    fn delete_share(&self, prefix: &str, si_s: &str, shnum: u32) -> io::Result<()> {
        fs::remove_file(self.share_path(prefix, si_s, shnum))?;
        // Drop the bucket directory once its last share is gone; a non-empty
        // directory makes remove_dir fail, which is fine.
        let _ = fs::remove_dir(self.bucket_dir(prefix, si_s));
        Ok(())
    }
}
