use std::{
    collections::BTreeMap,
    io,
    sync::Arc,
};

use super::{normalize, parent, File, FileInfo, Filesystem, OpenOptions};

/// Copy-on-write view over a read-only base.
///
/// Reads fall through to `base` for anything the layer does not hold. The
/// first write to a base file copies it into the layer. Base entries can never
/// be removed through the overlay.
#[derive(Clone)]
pub struct OverlayFs {
    base: Arc<dyn Filesystem>,
    layer: Arc<dyn Filesystem>,
}

impl OverlayFs {
    pub fn new(base: Arc<dyn Filesystem>, layer: Arc<dyn Filesystem>) -> Self {
        Self { base, layer }
    }

    pub fn base(&self) -> &Arc<dyn Filesystem> {
        &self.base
    }

    pub fn layer(&self) -> &Arc<dyn Filesystem> {
        &self.layer
    }

    fn copy_up(&self, path: &str) -> io::Result<()> {
        if self.layer.exists(path) {
            return Ok(());
        }
        match self.base.stat(path) {
            Ok(info) if info.is_dir => self.layer.mkdir_all(path),
            Ok(_) => {
                if let Some(dir) = parent(path) {
                    self.layer.mkdir_all(dir)?;
                }
                self.layer.write(path, &self.base.read(path)?)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match parent(path) {
                    Some(dir) if self.base.exists(dir) => self.layer.mkdir_all(dir),
                    _ => Ok(()),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn base_only(&self, path: &str) -> bool {
        !self.layer.exists(path) && self.base.exists(path)
    }
}

fn read_only(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{path}: read-only base entry"),
    )
}

impl Filesystem for OverlayFs {
    fn open(&self, path: &str, options: OpenOptions) -> io::Result<Box<dyn File>> {
        let path = normalize(path);
        if options.writes() {
            self.copy_up(&path)?;
            return self.layer.open(&path, options);
        }
        match self.layer.open(&path, options) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.base.open(&path, options),
            other => other,
        }
    }

    fn stat(&self, path: &str) -> io::Result<FileInfo> {
        match self.layer.stat(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.base.stat(path),
            other => other,
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>> {
        let mut merged = BTreeMap::new();
        let mut found = false;
        for fs in [&self.base, &self.layer] {
            match fs.read_dir(path) {
                Ok(entries) => {
                    found = true;
                    merged.extend(entries.into_iter().map(|e| (e.name.clone(), e)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if !found {
            return Err(super::not_found(&normalize(path)));
        }
        Ok(merged.into_values().collect())
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        self.layer.mkdir_all(path)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        if self.base_only(&path) {
            return Err(read_only(&path));
        }
        self.layer.remove(&path)
    }

    fn remove_all(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        if self.base_only(&path) {
            return Err(read_only(&path));
        }
        self.layer.remove_all(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use std::io::{Read, Write};

    fn overlay() -> (OverlayFs, MemoryFs, MemoryFs) {
        let base = MemoryFs::with_files([
            ("/script.lua", b"function run() end".as_slice()),
            ("/data/a", b"aaa".as_slice()),
        ])
        .unwrap();
        let layer = MemoryFs::new();
        (
            OverlayFs::new(Arc::new(base.clone()), Arc::new(layer.clone())),
            base,
            layer,
        )
    }

    #[test]
    fn reads_fall_through() {
        let (fs, _, _) = overlay();
        let mut file = fs.open("/script.lua", OpenOptions::read_only()).unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        assert_eq!(text, "function run() end");
    }

    #[test]
    fn writes_copy_up() {
        let (fs, base, layer) = overlay();
        let mut file = fs.open("/data/a", OpenOptions::read_write()).unwrap();
        file.write_all(b"b").unwrap();
        drop(file);

        assert_eq!(fs.read("/data/a").unwrap(), b"baa");
        assert_eq!(base.read("/data/a").unwrap(), b"aaa");
        assert_eq!(layer.read("/data/a").unwrap(), b"baa");
    }

    #[test]
    fn new_files_land_in_layer() {
        let (fs, base, layer) = overlay();
        fs.write("/data/new", b"1").unwrap();
        assert!(layer.exists("/data/new"));
        assert!(!base.exists("/data/new"));

        let names: Vec<_> = fs
            .read_dir("/data")
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["a", "new"]);
    }

    #[test]
    fn base_entries_cannot_be_removed() {
        let (fs, _, _) = overlay();
        let err = fs.remove("/script.lua").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        fs.write("/tmp", b"x").unwrap();
        fs.remove("/tmp").unwrap();
        assert!(!fs.exists("/tmp"));
    }
}
