use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::error::Result;

/// Something opened on behalf of a script that must be closed eventually.
pub trait Resource: Send {
    fn name(&self) -> &str;
    fn release(&mut self) -> Result<()>;
}

struct Entry {
    resource: Box<dyn Resource>,
    suppress_warning: bool,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    watched: AtomicU64,
}

/// Registry of every handle a VM opened during the current iteration.
///
/// Handles closed by the script mark their [`Guard`] done. Whatever is still
/// registered when [`clean`](ReleasePool::clean) runs has leaked: it is released
/// by force and reported.
#[derive(Clone, Default)]
pub struct ReleasePool {
    inner: Arc<Inner>,
}

/// Outcome of a [`ReleasePool::clean`] sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Resources released by the sweep.
    pub released: usize,
    /// Leaks that were reported as warnings.
    pub warned: usize,
    /// Releases that failed.
    pub failed: usize,
}

impl ReleasePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self, resource: impl Resource + 'static) -> Guard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().insert(
            id,
            Entry {
                resource: Box::new(resource),
                suppress_warning: false,
            },
        );
        self.inner.watched.fetch_add(1, Ordering::Relaxed);
        Guard {
            id,
            pool: self.inner.clone(),
        }
    }

    /// Resources currently registered.
    pub fn live(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Resources registered since the pool was created.
    pub fn watched(&self) -> u64 {
        self.inner.watched.load(Ordering::Relaxed)
    }

    /// Releases every resource still registered, oldest first.
    pub fn clean(&self) -> CleanReport {
        let mut leaked: Vec<(u64, Entry)> = self.inner.entries.lock().drain().collect();
        leaked.sort_by_key(|(id, _)| *id);

        let mut report = CleanReport::default();
        for (id, mut entry) in leaked {
            let name = entry.resource.name().to_string();
            if !entry.suppress_warning {
                tracing::warn!("resource#{id} \"{name}\" leaked, now releasing");
                report.warned += 1;
            }
            match entry.resource.release() {
                Ok(()) => report.released += 1,
                Err(e) => {
                    tracing::error!("Failed to release resource#{id} \"{name}\": {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Token for one watched resource.
///
/// Clones refer to the same registration, so any copy of a handle may mark it
/// done.
#[derive(Clone)]
pub struct Guard {
    id: u64,
    pool: Arc<Inner>,
}

impl Guard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unregisters the resource without releasing it.
    ///
    /// Returns `false` when it was already done or swept.
    pub fn done(&self) -> bool {
        self.pool.entries.lock().remove(&self.id).is_some()
    }

    /// Keeps a later sweep from logging this resource as a leak.
    pub fn suppress_warning(&self, suppress: bool) {
        if let Some(entry) = self.pool.entries.lock().get_mut(&self.id) {
            entry.suppress_warning = suppress;
        }
    }
}
