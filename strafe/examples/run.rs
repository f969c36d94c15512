//! Runs a script from a host directory.
//!
//! ```text
//! cargo run --example run -- <dir> <script> [seconds] [concurrency]
//! ```
//!
//! Without `seconds` the job runs until Ctrl-C.

use std::{env, sync::Arc, time::Duration};

use strafe::{fs::OsFs, report::ConsoleReporter, Job, JobConfig, StopCondition};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [dir, script, rest @ ..] = args.as_slice() else {
        return Err("usage: run <dir> <script> [seconds] [concurrency]".into());
    };
    let stop = match rest.first() {
        Some(secs) => StopCondition::duration(Duration::from_secs(secs.parse()?)),
        None => StopCondition::ctrl_c(),
    };
    let concurrency = match rest.get(1) {
        Some(n) => n.parse()?,
        None => num_cpus::get(),
    };

    let mut job = Job::new(
        JobConfig::builder().concurrency(concurrency).build(),
        Arc::new(OsFs::new(dir)),
        script,
        Arc::new(ConsoleReporter::default().quiet()),
    )?;
    job.run(stop)?;
    job.finish()?;
    println!("{}", serde_json::to_string_pretty(&job.stats())?);
    Ok(())
}
