//! A VM over in-memory storage for binding tests.

use std::{sync::Arc, time::Duration};

use mlua::{FromLuaMulti, Lua};
use tokio::runtime::Runtime;

use crate::{
    context::{Context, Global},
    error::Result,
    fs::{Filesystem, MemoryFs},
    report::MemoryReporter,
    vm::{Vm, VmParams},
};

pub(crate) struct Harness {
    vm: Vm,
    fs: MemoryFs,
    reporter: Arc<MemoryReporter>,
    rt: Runtime,
}

#[derive(Default)]
pub(crate) struct HarnessBuilder {
    timeout: Option<Duration>,
    async_concurrency: Option<usize>,
    files: Vec<(String, Vec<u8>)>,
}

impl HarnessBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn async_concurrency(mut self, n: usize) -> Self {
        self.async_concurrency = Some(n);
        self
    }

    pub fn file(mut self, path: &str, contents: impl AsRef<[u8]>) -> Self {
        self.files.push((path.to_string(), contents.as_ref().to_vec()));
        self
    }

    pub fn build(self) -> Harness {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let fs = MemoryFs::new();
        for (path, contents) in &self.files {
            fs.write(path, contents).unwrap();
        }
        let reporter = Arc::new(MemoryReporter::new());
        let global = Arc::new(Global::new(reporter.clone()));

        let mut params = VmParams::builder()
            .async_concurrency(self.async_concurrency.unwrap_or(4))
            .filesystem(Arc::new(fs.clone()) as Arc<dyn Filesystem>)
            .build();
        params.async_timeout = self.timeout;

        let vm = Vm::new(1, global, params, rt.handle().clone()).unwrap();
        Harness {
            vm,
            fs,
            reporter,
            rt,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn lua(&self) -> &Lua {
        self.vm.lua()
    }

    pub fn ctx(&self) -> &Arc<Context> {
        self.vm.context()
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn fs(&self) -> &MemoryFs {
        &self.fs
    }

    pub fn reporter(&self) -> &MemoryReporter {
        &self.reporter
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Runs a chunk, panicking with the script error on failure.
    pub fn exec(&self, source: &str) {
        if let Err(e) = self.vm.exec(source) {
            panic!("script failed: {e}");
        }
    }

    pub fn try_exec(&self, source: &str) -> Result<()> {
        self.vm.exec(source)
    }

    /// Evaluates an expression chunk.
    pub fn eval<T: FromLuaMulti>(&self, source: &str) -> T {
        match self.lua().load(source).eval::<T>() {
            Ok(v) => v,
            Err(e) => panic!("script failed: {e}"),
        }
    }
}
