use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    metric::Metric,
    report::Reporter,
    stat::Stat,
};

type Shared = Arc<dyn Any + Send + Sync>;

/// State shared by every VM of one job.
pub struct Global {
    unique: Mutex<HashMap<String, Shared>>,
    metrics: Mutex<Vec<Arc<Metric>>>,
    reporter: Arc<dyn Reporter>,
}

impl Global {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            unique: Mutex::new(HashMap::new()),
            metrics: Mutex::new(Vec::new()),
            reporter,
        }
    }

    /// Returns the value stored under `name`, creating it with `factory` on
    /// first use.
    ///
    /// The lock is held while `factory` runs, so a factory executes at most once
    /// per name no matter how many VMs race for it. Every caller gets the same
    /// `Arc`.
    pub fn unique<T, F>(&self, name: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut unique = self.unique.lock();
        let value = match unique.get(name) {
            Some(value) => value.clone(),
            None => {
                let value: Shared = Arc::new(factory());
                unique.insert(name.to_string(), value.clone());
                value
            }
        };
        value
            .downcast::<T>()
            .map_err(|_| Error::UniqueType(name.to_string()))
    }

    /// Returns the metric registered under `key`, creating and registering it
    /// with the reporter on first use.
    pub fn metric<F>(&self, key: &str, factory: F) -> Result<Arc<Metric>>
    where
        F: FnOnce() -> Metric,
    {
        let mut created = false;
        let metric = self.unique(key, || {
            created = true;
            factory()
        })?;
        if created {
            self.register_metric(metric.clone());
        }
        Ok(metric)
    }

    pub fn register_metric(&self, metric: Arc<Metric>) {
        self.metrics.lock().push(metric.clone());
        self.reporter.collect(&[metric]);
    }

    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        self.metrics.lock().clone()
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    pub fn report(&self, stats: Vec<Stat>) {
        if !stats.is_empty() {
            self.reporter.report(stats);
        }
    }

    /// Flushes the reporter.
    pub fn finish(&self) -> Result<()> {
        self.reporter.finish().inspect_err(|e| {
            tracing::error!("Reporter failed to finish: {e}");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metric::Tags, report::MemoryReporter};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
    };

    fn global() -> (Arc<Global>, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        (Arc::new(Global::new(reporter.clone())), reporter)
    }

    #[test]
    fn unique_runs_factory_once_under_race() {
        let (global, _) = global();
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let global = global.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    global
                        .unique("shared", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            format!("made by {i}")
                        })
                        .unwrap()
                })
            })
            .collect();
        let values: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn unique_rejects_other_types() {
        let (global, _) = global();
        global.unique("n", || 1u32).unwrap();
        assert!(matches!(
            global.unique("n", || "x".to_string()),
            Err(Error::UniqueType(name)) if name == "n"
        ));
        assert_eq!(*global.unique("n", || 2u32).unwrap(), 1);
    }

    #[test]
    fn metric_is_registered_once() {
        let (global, reporter) = global();
        let a = global.metric("hits", || Metric::counter("hits", Tags::new())).unwrap();
        let b = global.metric("hits", || Metric::counter("other", Tags::new())).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(global.metrics().len(), 1);
        assert_eq!(reporter.summaries().len(), 1);
    }

    #[test]
    fn finish_reaches_reporter() {
        let (global, reporter) = global();
        global.report(vec![Stat::new("x")]);
        global.finish().unwrap();
        assert!(reporter.is_finished());
        assert_eq!(reporter.stats().len(), 1);
    }
}
