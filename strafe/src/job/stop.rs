use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::watch,
    task::JoinHandle,
    time::Instant,
};

/// A switch that stops a job once fired. Clones share the switch.
#[derive(Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// When a job stops issuing iterations.
///
/// The condition is checked before every iteration and never interrupts one
/// that already started.
#[derive(Clone)]
pub enum StopCondition {
    /// Stop after this many iterations across all VMs.
    Amount(u64),
    /// Stop once this much wall-clock time has passed since `run`.
    Duration(Duration),
    /// Stop once the signal fires.
    Signal(Signal),
    /// Stop on the first Ctrl-C.
    CtrlC,
}

impl StopCondition {
    pub fn amount(n: u64) -> Self {
        Self::Amount(n)
    }

    pub fn duration(d: Duration) -> Self {
        Self::Duration(d)
    }

    pub fn signal(signal: Signal) -> Self {
        Self::Signal(signal)
    }

    pub fn ctrl_c() -> Self {
        Self::CtrlC
    }

    /// Starts the clock or the interrupt listener. Iteration numbers are drawn
    /// from `counter`.
    pub(crate) fn arm(self, handle: &Handle, counter: Arc<AtomicU64>) -> Armed {
        let (check, listener) = match self {
            StopCondition::Amount(n) => (Check::Amount(n), None),
            StopCondition::Duration(d) => (Check::Deadline(Instant::now() + d), None),
            StopCondition::Signal(signal) => (Check::Signal(signal.subscribe()), None),
            StopCondition::CtrlC => {
                let signal = Signal::new();
                let rx = signal.subscribe();
                let listener = handle.spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            tracing::info!("Interrupted, finishing current iterations...");
                            signal.fire();
                        }
                        Err(e) => tracing::error!("Unable to listen for Ctrl-C: {e}"),
                    }
                });
                (Check::Signal(rx), Some(listener))
            }
        };
        Armed {
            stopper: Stopper { check, counter },
            listener,
        }
    }
}

pub(crate) struct Armed {
    pub stopper: Stopper,
    listener: Option<JoinHandle<()>>,
}

impl Drop for Armed {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[derive(Clone)]
enum Check {
    Amount(u64),
    Deadline(Instant),
    Signal(watch::Receiver<bool>),
}

/// Hands out iteration numbers until the stop condition holds.
#[derive(Clone)]
pub(crate) struct Stopper {
    check: Check,
    counter: Arc<AtomicU64>,
}

impl Stopper {
    /// Claims the next iteration number, or `None` once the job should stop.
    pub fn next(&self) -> Option<u64> {
        match &self.check {
            // The first VM to draw past the amount stops every VM.
            Check::Amount(n) => {
                let i = self.counter.fetch_add(1, Ordering::SeqCst);
                (i < *n).then_some(i)
            }
            Check::Deadline(deadline) => {
                (Instant::now() < *deadline).then(|| self.counter.fetch_add(1, Ordering::SeqCst))
            }
            Check::Signal(rx) => {
                (!*rx.borrow()).then(|| self.counter.fetch_add(1, Ordering::SeqCst))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, thread};

    fn armed(condition: StopCondition) -> (Armed, tokio::runtime::Runtime) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let armed = condition.arm(rt.handle(), Arc::new(AtomicU64::new(0)));
        (armed, rt)
    }

    #[test]
    fn amount_is_shared_across_threads() {
        let (armed, _rt) = armed(StopCondition::amount(100));
        let drawn: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let stopper = armed.stopper.clone();
                    s.spawn(move || {
                        let mut mine = Vec::new();
                        while let Some(i) = stopper.next() {
                            mine.push(i);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(drawn.len(), 100);
        let unique: HashSet<_> = drawn.iter().copied().collect();
        assert_eq!(unique, (0..100).collect());
    }

    #[test]
    fn zero_amount_runs_nothing() {
        let (armed, _rt) = armed(StopCondition::amount(0));
        assert_eq!(armed.stopper.next(), None);
    }

    #[test]
    fn deadline_expires() {
        let (armed, _rt) = armed(StopCondition::duration(Duration::from_millis(30)));
        assert_eq!(armed.stopper.next(), Some(0));
        assert_eq!(armed.stopper.next(), Some(1));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(armed.stopper.next(), None);
    }

    #[test]
    fn signal_stops_every_clone() {
        let signal = Signal::new();
        let (armed, _rt) = armed(StopCondition::signal(signal.clone()));
        let other = armed.stopper.clone();
        assert!(armed.stopper.next().is_some());
        signal.fire();
        assert!(signal.is_fired());
        assert_eq!(armed.stopper.next(), None);
        assert_eq!(other.next(), None);
    }
}
