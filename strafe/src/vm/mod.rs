use std::{collections::BTreeMap, sync::Arc, time::Duration};

use mlua::{Function, Lua, Value};
use tokio::runtime::Handle;
use typed_builder::TypedBuilder;

use crate::{
    bindings::{self, Env},
    context::{Context, Global},
    error::{Error, Result},
    fs::{Filesystem, MemoryFs},
    pool::{AsyncPool, CleanReport, ReleasePool},
};

/// A script whose syntax has been checked.
///
/// Only the source text is shared. Every VM parses it again into its own
/// interpreter when it [loads](Vm::load) the prototype.
#[derive(Clone, Debug)]
pub struct Prototype {
    name: Arc<str>,
    source: Arc<str>,
}

impl Prototype {
    /// Parses `source` in a scratch interpreter so syntax errors surface before
    /// any VM exists. The parsed function is discarded.
    pub fn compile(name: &str, source: &str) -> Result<Self> {
        Lua::new().load(source).set_name(name).into_function()?;
        Ok(Self {
            name: name.into(),
            source: source.into(),
        })
    }

    /// Reads and compiles a script from a filesystem.
    pub fn read(fs: &dyn Filesystem, path: &str) -> Result<Self> {
        let source = fs.read(path)?;
        Self::compile(path, &String::from_utf8_lossy(&source))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Per-VM settings.
#[derive(TypedBuilder, Clone)]
pub struct VmParams {
    /// Async workers per VM
    #[builder(default = 4)]
    pub async_concurrency: usize,
    /// Deadline applied to every async task; none by default
    #[builder(default, setter(strip_option))]
    pub async_timeout: Option<Duration>,
    /// Async queue capacity; `async_concurrency * 16` when unset or smaller
    /// than the worker count
    #[builder(default, setter(strip_option))]
    pub async_buffer_size: Option<usize>,
    /// Exposed to the script as string globals
    #[builder(default)]
    pub envs: BTreeMap<String, String>,
    #[builder(default = Arc::new(MemoryFs::new()) as Arc<dyn Filesystem>)]
    pub filesystem: Arc<dyn Filesystem>,
    #[builder(default)]
    pub http: reqwest::Client,
}

impl VmParams {
    fn buffer_size(&self) -> usize {
        let concurrency = self.async_concurrency.max(1);
        match self.async_buffer_size {
            Some(size) if size >= concurrency => size,
            _ => concurrency * 16,
        }
    }
}

/// One interpreter with its private pools.
///
/// A VM is driven by exactly one thread at a time. Between iterations
/// [`reset`](Vm::reset) sweeps leaked handles and restarts the async pool.
pub struct Vm {
    id: usize,
    entry: Option<Function>,
    lua: Lua,
    ctx: Arc<Context>,
}

impl Vm {
    pub fn new(id: usize, global: Arc<Global>, params: VmParams, handle: Handle) -> Result<Self> {
        let async_pool = Arc::new(AsyncPool::new(
            handle,
            params.async_concurrency,
            params.buffer_size(),
            params.async_timeout,
        ));
        async_pool.start();
        let ctx = Arc::new(Context::new(id, global, async_pool, ReleasePool::new()));

        let lua = Lua::new();
        bindings::open(
            &lua,
            Arc::new(Env {
                ctx: ctx.clone(),
                fs: params.filesystem,
                http: params.http,
            }),
        )?;
        let globals = lua.globals();
        for (k, v) in params.envs {
            globals.set(k, v)?;
        }

        Ok(Self {
            id,
            entry: None,
            lua,
            ctx,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Runs the script's top level and picks up its `run` function.
    pub fn load(&mut self, prototype: &Prototype) -> Result<()> {
        self.lua
            .load(prototype.source())
            .set_name(prototype.name())
            .exec()?;
        match self.lua.globals().get::<Value>("run")? {
            Value::Function(run) => {
                self.entry = Some(run);
                Ok(())
            }
            _ => Err(Error::MissingEntry),
        }
    }

    /// Calls `run(iteration)`. Script errors come back as [`Error::Script`].
    pub fn run(&self, iteration: u64) -> Result<()> {
        let entry = self.entry.as_ref().ok_or(Error::MissingEntry)?;
        entry.call::<()>(iteration)?;
        Ok(())
    }

    /// Executes a chunk in this VM.
    pub fn exec(&self, source: &str) -> Result<()> {
        self.lua.load(source).set_name("exec").exec()?;
        Ok(())
    }

    /// Releases whatever the last iteration leaked, then restarts the async
    /// pool so no task from it can run later.
    pub fn reset(&self) -> CleanReport {
        let report = self.ctx.release_pool().clean();
        let pool = self.ctx.async_pool();
        pool.stop();
        pool.start();
        report
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.ctx.release_pool().clean();
    }
}
