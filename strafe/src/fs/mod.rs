//! Filesystems a script can see.
//!
//! Every path is virtual: `/`-rooted, normalized, and never able to climb above
//! the root. A job hands one [`Filesystem`] to its VMs, optionally wrapping it
//! per VM in an [`OverlayFs`] so scripts cannot clobber each other's writes.

mod memory;
mod os;
mod overlay;

use std::{
    io::{self, Read, Seek, Write},
    sync::Arc,
    time::SystemTime,
};

pub use memory::MemoryFs;
pub use os::OsFs;
pub use overlay::OverlayFs;

/// An open file.
pub trait File: Read + Write + Seek + Send {
    /// Normalized virtual path the file was opened with.
    fn name(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Base name, `/` for the root.
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: SystemTime,
}

/// How a file is opened. Defaults to read-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::read_only()
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            truncate: false,
            create: false,
        }
    }

    /// Read-write, created if missing, existing contents kept.
    pub fn read_write() -> Self {
        Self {
            write: true,
            create: true,
            ..Self::read_only()
        }
    }

    /// Read-write, created if missing, truncated if present.
    pub fn create() -> Self {
        Self {
            truncate: true,
            ..Self::read_write()
        }
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn writes(&self) -> bool {
        self.write || self.append
    }
}

pub trait Filesystem: Send + Sync {
    fn open(&self, path: &str, options: OpenOptions) -> io::Result<Box<dyn File>>;

    fn stat(&self, path: &str) -> io::Result<FileInfo>;

    /// Entries of a directory, sorted by name.
    fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>>;

    fn mkdir_all(&self, path: &str) -> io::Result<()>;

    /// Removes a file or an empty directory.
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Removes a path and everything below it. Missing paths are not an error.
    fn remove_all(&self, path: &str) -> io::Result<()>;

    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut file = self.open(path, OpenOptions::read_only())?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        let mut file = self.open(path, OpenOptions::create())?;
        file.write_all(contents)?;
        file.flush()
    }
}

impl<T: Filesystem + ?Sized> Filesystem for Arc<T> {
    fn open(&self, path: &str, options: OpenOptions) -> io::Result<Box<dyn File>> {
        (**self).open(path, options)
    }

    fn stat(&self, path: &str) -> io::Result<FileInfo> {
        (**self).stat(path)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>> {
        (**self).read_dir(path)
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        (**self).mkdir_all(path)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        (**self).remove(path)
    }

    fn remove_all(&self, path: &str) -> io::Result<()> {
        (**self).remove_all(path)
    }
}

/// Resolves `.` and `..` and collapses slashes. The result always starts with
/// `/` and never ends with one, except for the root itself.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Parent of a normalized path; `None` for the root.
pub(crate) fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        _ if path == "/" => None,
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

pub(crate) fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        _ if path == "/" => "/",
        Some(i) => &path[i + 1..],
        None => path,
    }
}

pub(crate) fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path}: no such file or directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("//a/./b/"), "/a/b");
        assert_eq!(normalize("/a/../b"), "/b");
        assert_eq!(normalize("/../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn parents_and_names() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(base_name("/a/b"), "b");
        assert_eq!(base_name("/"), "/");
    }

    #[test]
    fn create_truncates_read_write_keeps() {
        assert!(OpenOptions::create().truncate);
        assert!(!OpenOptions::read_write().truncate);
        assert!(OpenOptions::read_write().writes());
        assert!(!OpenOptions::default().writes());
        assert!(OpenOptions::read_only().append(true).writes());
    }
}
