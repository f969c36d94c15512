use std::{
    collections::BTreeMap,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Arc,
    time::SystemTime,
};

use parking_lot::{Mutex, RwLock};

use super::{base_name, normalize, not_found, parent, File, FileInfo, Filesystem, OpenOptions};

#[derive(Debug)]
struct Data {
    bytes: Vec<u8>,
    modified: SystemTime,
}

#[derive(Clone, Debug)]
enum Node {
    Dir { modified: SystemTime },
    File(Arc<Mutex<Data>>),
}

impl Node {
    fn info(&self, path: &str) -> FileInfo {
        let (size, is_dir, modified) = match self {
            Node::Dir { modified } => (0, true, *modified),
            Node::File(data) => {
                let data = data.lock();
                (data.bytes.len() as u64, false, data.modified)
            }
        };
        FileInfo {
            name: base_name(path).to_string(),
            size,
            is_dir,
            modified,
        }
    }
}

/// In-memory filesystem. Clones share the same tree.
#[derive(Clone)]
pub struct MemoryFs {
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                modified: SystemTime::now(),
            },
        );
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Builds a filesystem holding the given files.
    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> io::Result<Self> {
        let fs = Self::new();
        for (path, contents) in files {
            fs.write(path, contents)?;
        }
        Ok(fs)
    }

    fn mkdir_all_locked(nodes: &mut BTreeMap<String, Node>, path: &str) -> io::Result<()> {
        let mut ancestors = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            ancestors.push(p);
            current = parent(p);
        }
        for dir in ancestors.into_iter().rev() {
            match nodes.get(dir) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{dir}: not a directory"),
                    ))
                }
                None => {
                    nodes.insert(
                        dir.to_string(),
                        Node::Dir {
                            modified: SystemTime::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn children<'a>(
        nodes: &'a BTreeMap<String, Node>,
        path: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| k.as_str() != "/" && parent(k) == Some(path))
    }
}

impl Filesystem for MemoryFs {
    fn open(&self, path: &str, options: OpenOptions) -> io::Result<Box<dyn File>> {
        let path = normalize(path);
        let mut nodes = self.nodes.write();
        let data = match nodes.get(&path) {
            Some(Node::File(data)) => data.clone(),
            Some(Node::Dir { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{path}: is a directory"),
                ))
            }
            None if options.create => {
                if let Some(dir) = parent(&path) {
                    Self::mkdir_all_locked(&mut nodes, dir)?;
                }
                let data = Arc::new(Mutex::new(Data {
                    bytes: Vec::new(),
                    modified: SystemTime::now(),
                }));
                nodes.insert(path.clone(), Node::File(data.clone()));
                data
            }
            None => return Err(not_found(&path)),
        };
        drop(nodes);

        if options.truncate && options.writes() {
            let mut data = data.lock();
            data.bytes.clear();
            data.modified = SystemTime::now();
        }

        Ok(Box::new(MemoryFile {
            name: path,
            data,
            pos: 0,
            options,
        }))
    }

    fn stat(&self, path: &str) -> io::Result<FileInfo> {
        let path = normalize(path);
        self.nodes
            .read()
            .get(&path)
            .map(|node| node.info(&path))
            .ok_or_else(|| not_found(&path))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>> {
        let path = normalize(path);
        let nodes = self.nodes.read();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{path}: not a directory"),
                ))
            }
            None => return Err(not_found(&path)),
        }
        Ok(Self::children(&nodes, &path)
            .map(|(k, node)| node.info(k))
            .collect())
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        Self::mkdir_all_locked(&mut self.nodes.write(), &normalize(path))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes.write();
        match nodes.get(&path) {
            None => return Err(not_found(&path)),
            Some(Node::Dir { .. }) if path == "/" || Self::children(&nodes, &path).next().is_some() => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{path}: directory not empty"),
                ))
            }
            Some(_) => {}
        }
        nodes.remove(&path);
        Ok(())
    }

    fn remove_all(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut nodes = self.nodes.write();
        nodes.retain(|k, _| k == "/" || (*k != path && !k.starts_with(&prefix)));
        Ok(())
    }
}

struct MemoryFile {
    name: String,
    data: Arc<Mutex<Data>>,
    pos: u64,
    options: OpenOptions,
}

impl File for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.options.read {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{}: not opened for reading", self.name),
            ));
        }
        let data = self.data.lock();
        let start = (self.pos as usize).min(data.bytes.len());
        let n = buf.len().min(data.bytes.len() - start);
        buf[..n].copy_from_slice(&data.bytes[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.options.writes() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{}: not opened for writing", self.name),
            ));
        }
        let mut data = self.data.lock();
        if self.options.append {
            self.pos = data.bytes.len() as u64;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.bytes.len() < end {
            data.bytes.resize(end, 0);
        }
        data.bytes[start..end].copy_from_slice(buf);
        data.modified = SystemTime::now();
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().bytes.len() as i64;
        let next = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}
