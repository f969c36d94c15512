//! Job — drives a compiled script across a set of VMs until a stop condition
//! holds.
//!
//! A [`Job`] owns everything a load test needs: a tokio runtime for the VMs'
//! async workers, one [`Vm`] per concurrency slot and the [`Global`] state they
//! share.
//!
//! # Flow
//! 1. [`Job::new`] reads and compiles the entry script. A syntax error, or a
//!    script without a global `run`, fails here before any iteration runs.
//! 2. [`Job::run`] spawns one OS thread per VM. Every thread loops: draw an
//!    iteration number from the shared counter (or stop), call `run(i)`, record
//!    the outcome, then reset the VM.
//! 3. [`Job::finish`] flushes the reporter and hands back its error, if any.
//!
//! A failing iteration is logged with its scope and counted; it never stops the
//! job or touches sibling VMs.
//!
//! # Metrics
//! Every iteration feeds two metrics that exist for the whole job:
//! - `run_us`: gauge of iteration durations in microseconds.
//! - `run_success`: rate of iterations that returned without error.

mod stop;
pub use stop::{Signal, StopCondition};

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use typed_builder::TypedBuilder;

use crate::{
    context::Global,
    error::{Error, Result},
    fs::Filesystem,
    macros::summary,
    metric::{Metric, Tags},
    report::{Reporter, Summary},
    vm::{Prototype, Vm, VmParams},
};

/// Builds the filesystem VM `id` sees from the job's filesystem.
pub type FsFactory = Arc<dyn Fn(usize, Arc<dyn Filesystem>) -> Arc<dyn Filesystem> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Stopped,
}

#[derive(TypedBuilder, Clone)]
pub struct JobConfig {
    /// Number of VMs, each driven by its own thread
    #[builder(default = 1)]
    pub concurrency: usize,
    #[builder(default = 4)]
    pub async_concurrency: usize,
    #[builder(default = Some(Duration::from_secs(30)))]
    pub async_timeout: Option<Duration>,
    #[builder(default = 64)]
    pub async_buffer_size: usize,
    /// Exposed to every VM as string globals
    #[builder(default)]
    pub envs: BTreeMap<String, String>,
    /// Gives each VM its own view of the filesystem; all VMs share it when unset
    #[builder(default, setter(strip_option))]
    pub filesystem: Option<FsFactory>,
    /// Threads of the runtime serving every VM's async workers
    #[builder(default = num_cpus::get())]
    pub worker_threads: usize,
}

#[summary]
pub struct JobStats {
    pub started_at: Option<DateTime<Utc>>,
    pub concurrency: usize,
    pub finished: u64,
    pub failed: u64,
    /// Wall-clock time of the last `run`
    pub duration: Duration,
    /// Sum of iteration durations over all VMs
    pub busy_us: u64,
    /// Mean iteration duration
    pub avg_cost_us: f64,
}

/// Counters the VM threads update.
struct Tally {
    finished: AtomicU64,
    failed: AtomicU64,
    busy_us: AtomicU64,
    run_us: Arc<Metric>,
    run_success: Arc<Metric>,
}

impl Tally {
    fn record(&self, elapsed: Duration, ok: bool) {
        let us = elapsed.as_micros() as u64;
        self.run_us.add(us as f64);
        self.run_success.add(if ok { 1.0 } else { 0.0 });
        self.busy_us.fetch_add(us, Ordering::Relaxed);
        self.finished.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct Job {
    state: JobState,
    global: Arc<Global>,
    vms: Vec<Vm>,
    counter: Arc<AtomicU64>,
    tally: Tally,
    started_at: Option<DateTime<Utc>>,
    duration: Duration,
    // Dropped after the VMs, whose async pools run on it.
    runtime: Runtime,
}

impl Job {
    /// Compiles `entry` from `fs` and prepares `config.concurrency` VMs.
    pub fn new(
        config: JobConfig,
        fs: Arc<dyn Filesystem>,
        entry: &str,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        let prototype = Prototype::read(fs.as_ref(), entry)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("strafe-async")
            .enable_all()
            .build()?;
        let global = Arc::new(Global::new(reporter));
        let http = reqwest::Client::builder().build()?;

        let tally = Tally {
            finished: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            busy_us: AtomicU64::new(0),
            run_us: global.metric("job:run_us", || Metric::gauge("run_us", Tags::new()))?,
            run_success: global
                .metric("job:run_success", || Metric::rate("run_success", Tags::new()))?,
        };

        tracing::info!("Preparing {} VMs for {entry}...", config.concurrency);
        let mut vms = Vec::with_capacity(config.concurrency);
        for id in 0..config.concurrency {
            let filesystem = match &config.filesystem {
                Some(factory) => factory(id, fs.clone()),
                None => fs.clone(),
            };
            let mut params = VmParams::builder()
                .async_concurrency(config.async_concurrency)
                .async_buffer_size(config.async_buffer_size)
                .envs(config.envs.clone())
                .filesystem(filesystem)
                .http(http.clone())
                .build();
            params.async_timeout = config.async_timeout;

            let mut vm = Vm::new(id, global.clone(), params, runtime.handle().clone())?;
            vm.load(&prototype)?;
            vms.push(vm);
        }

        Ok(Self {
            state: JobState::Created,
            global,
            vms,
            counter: Arc::new(AtomicU64::new(0)),
            tally,
            started_at: None,
            duration: Duration::ZERO,
            runtime,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn global(&self) -> &Arc<Global> {
        &self.global
    }

    /// Runs iterations on every VM until `stop` holds, then waits for all of
    /// them. A job runs once.
    pub fn run(&mut self, stop: StopCondition) -> Result<()> {
        if self.state != JobState::Created {
            return Err(Error::State {
                expected: JobState::Created,
                actual: self.state,
            });
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        let start = Instant::now();
        let armed = stop.arm(self.runtime.handle(), self.counter.clone());

        tracing::info!("Spawning {} VM threads...", self.vms.len());
        let tally = &self.tally;
        let stopper = &armed.stopper;
        let spawned = thread::scope(|s| -> Result<()> {
            for vm in self.vms.iter_mut() {
                let stopper = stopper.clone();
                thread::Builder::new()
                    .name(format!("strafe-vm-{}", vm.id()))
                    .spawn_scoped(s, move || drive(vm, &stopper, tally))?;
            }
            Ok(())
        });
        drop(armed);

        self.duration = start.elapsed();
        self.state = JobState::Stopped;
        let stats = self.stats();
        tracing::info!(
            "Done running: {} iterations, {} failed, in {:?}",
            stats.finished,
            stats.failed,
            stats.duration
        );
        spawned
    }

    pub fn stats(&self) -> JobStats {
        let finished = self.tally.finished.load(Ordering::Relaxed);
        let busy_us = self.tally.busy_us.load(Ordering::Relaxed);
        JobStats {
            started_at: self.started_at,
            concurrency: self.vms.len(),
            finished,
            failed: self.tally.failed.load(Ordering::Relaxed),
            duration: self.duration,
            busy_us,
            avg_cost_us: if finished == 0 {
                0.0
            } else {
                busy_us as f64 / finished as f64
            },
        }
    }

    /// Flushes the reporter.
    pub fn finish(&mut self) -> Result<()> {
        self.global.finish()
    }
}

fn drive(vm: &mut Vm, stopper: &stop::Stopper, tally: &Tally) {
    while let Some(iteration) = stopper.next() {
        let start = Instant::now();
        let result = vm.run(iteration);
        tally.record(start.elapsed(), result.is_ok());
        if let Err(e) = result {
            vm.context().error(&format!("Iteration {iteration} failed: {e}"));
        }
        vm.reset();
    }
}
