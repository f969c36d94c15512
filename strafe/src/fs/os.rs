use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    time::SystemTime,
};

use super::{base_name, normalize, File, FileInfo, Filesystem, OpenOptions};

/// Host directory exposed as the virtual root.
#[derive(Clone, Debug)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> (String, PathBuf) {
        let path = normalize(path);
        let host = self.root.join(path.trim_start_matches('/'));
        (path, host)
    }
}

fn info(path: &str, meta: &fs::Metadata) -> FileInfo {
    FileInfo {
        name: base_name(path).to_string(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        is_dir: meta.is_dir(),
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

impl Filesystem for OsFs {
    fn open(&self, path: &str, options: OpenOptions) -> io::Result<Box<dyn File>> {
        let (name, host) = self.resolve(path);
        let file = fs::OpenOptions::new()
            .read(options.read)
            .write(options.write)
            .append(options.append)
            .truncate(options.truncate && options.writes())
            .create(options.create && options.writes())
            .open(host)?;
        Ok(Box::new(OsFile { name, file }))
    }

    fn stat(&self, path: &str) -> io::Result<FileInfo> {
        let (name, host) = self.resolve(path);
        Ok(info(&name, &fs::metadata(host)?))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>> {
        let (name, host) = self.resolve(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(host)? {
            let entry = entry?;
            let child = format!(
                "{}/{}",
                name.trim_end_matches('/'),
                entry.file_name().to_string_lossy()
            );
            entries.push(info(&child, &entry.metadata()?));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path).1)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let host = self.resolve(path).1;
        if fs::metadata(&host)?.is_dir() {
            fs::remove_dir(host)
        } else {
            fs::remove_file(host)
        }
    }

    fn remove_all(&self, path: &str) -> io::Result<()> {
        let host = self.resolve(path).1;
        let result = match fs::symlink_metadata(&host) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&host),
            Ok(_) => fs::remove_file(&host),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

struct OsFile {
    name: String,
    file: fs::File,
}

impl File for OsFile {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());
        fs.write("/../../escape.txt", b"x").unwrap();
        assert!(dir.path().join("escape.txt").exists());
    }

    #[test]
    fn round_trip_through_host() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());
        fs.mkdir_all("/data/sub").unwrap();
        fs.write("/data/b.txt", b"bb").unwrap();
        fs.write("/data/a.txt", b"a").unwrap();

        let list = fs.read_dir("/data").unwrap();
        let names: Vec<_> = list.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "sub"]);
        assert_eq!(fs.stat("/data/b.txt").unwrap().size, 2);

        let mut file = fs.open("/data/b.txt", OpenOptions::read_write()).unwrap();
        file.write_all(b"c").unwrap();
        drop(file);
        assert_eq!(fs.read("/data/b.txt").unwrap(), b"cb");

        fs.remove_all("/data").unwrap();
        assert!(!fs.exists("/data"));
        fs.remove_all("/data").unwrap();
    }
}
