//! Shared shape of every handle a script can open: files, sockets, channels.
//!
//! A handle type implements the capabilities it has and registers the matching
//! Lua methods with [`add_reader`], [`add_writer`] and [`add_closer`]. Each of
//! those methods queues its work and returns a continuation.

use std::{io, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use mlua::{MetaMethod, UserDataMethods};
use tokio::sync::{watch, Mutex};

use super::{
    bytes::{Bytes, BytesArg},
    deferred::{deferred, deferred_result, produce},
};
use crate::{
    context::Context,
    error::{Error, Result},
    pool::{Guard, Resource},
};

/// Bytes a `read()` without a size asks for.
pub const DEFAULT_READ_SIZE: usize = 4096;

#[async_trait]
pub trait Readable {
    /// Reads at most `n` bytes. An empty result means end of stream.
    async fn read(&self, n: usize) -> Result<Vec<u8>>;

    /// Reads until end of stream.
    async fn read_all(&self) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait Writable {
    async fn write(&self, data: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait Closeable {
    async fn close(&self) -> Result<()>;
}

/// A script-visible handle registered with the VM's release pool.
pub trait Handle: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn context(&self) -> &Arc<Context>;
    fn guard(&self) -> &Guard;
}

pub(crate) fn eof() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"))
}

/// `name()` and `__tostring`.
pub fn add_handle<T, M>(methods: &mut M)
where
    T: Handle,
    M: UserDataMethods<T>,
{
    methods.add_method("name", |_, this, ()| Ok(this.name().to_string()));
    methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
        Ok(this.name().to_string())
    });
}

/// `read([n])` and `read_all()`, both yielding `err, bytes`.
pub fn add_reader<T, M>(methods: &mut M)
where
    T: Handle + Readable,
    M: UserDataMethods<T>,
{
    methods.add_method("read", |lua, this, n: Option<usize>| {
        let n = n.unwrap_or(DEFAULT_READ_SIZE);
        let handle = this.clone();
        deferred_result(lua, this.context(), async move {
            let data = handle.read(n).await?;
            if data.is_empty() && n > 0 {
                return Err(eof());
            }
            Ok(produce(Bytes::from(data)))
        })
    });
    methods.add_method("read_all", |lua, this, ()| {
        let handle = this.clone();
        deferred_result(lua, this.context(), async move {
            Ok(produce(Bytes::from(handle.read_all().await?)))
        })
    });
}

/// `write(data)` yielding `err`. Accepts strings and bytes.
pub fn add_writer<T, M>(methods: &mut M)
where
    T: Handle + Writable,
    M: UserDataMethods<T>,
{
    methods.add_method("write", |lua, this, data: BytesArg| {
        let handle = this.clone();
        deferred(lua, this.context(), async move { handle.write(data.0).await })
    });
}

/// `close()` yielding `err`. The handle leaves the release pool right away.
pub fn add_closer<T, M>(methods: &mut M)
where
    T: Handle + Closeable,
    M: UserDataMethods<T>,
{
    methods.add_method("close", |lua, this, ()| {
        this.guard().done();
        let handle = this.clone();
        deferred(lua, this.context(), async move { handle.close().await })
    });
}

/// An async stream shared between a handle and the release pool.
///
/// Releasing the slot flips its closed flag, which cancels whatever operation
/// is in flight, and drops the stream.
pub struct Slot<S> {
    name: String,
    stream: Mutex<Option<S>>,
    closed: watch::Sender<bool>,
}

impl<S: Send + 'static> Slot<S> {
    pub fn new(name: impl Into<String>, stream: S) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            stream: Mutex::new(Some(stream)),
            closed: watch::Sender::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_error(&self) -> Error {
        Error::Closed(self.name.clone())
    }

    /// Runs `op` against the stream unless the slot is or becomes closed.
    pub async fn with<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<T>>,
    {
        let mut closed = self.closed.subscribe();
        let mut guard = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Err(self.closed_error()),
            guard = self.stream.lock() => guard,
        };
        let outcome = match guard.as_mut() {
            None => return Err(self.closed_error()),
            Some(stream) => tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => None,
                result = op(stream) => Some(result),
            },
        };
        match outcome {
            Some(result) => result,
            None => {
                guard.take();
                Err(self.closed_error())
            }
        }
    }

    /// Marks the slot closed and hands out the stream for a graceful shutdown.
    pub async fn take(&self) -> Option<S> {
        self.closed.send_replace(true);
        self.stream.lock().await.take()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

impl<S: Send + 'static> Resource for Arc<Slot<S>> {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        self.closed.send_replace(true);
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
        Ok(())
    }
}
