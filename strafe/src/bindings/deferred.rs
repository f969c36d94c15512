//! Continuations over async pool tasks.
//!
//! The interpreter is only ever touched on the VM thread. A task therefore
//! does its I/O on a worker and sends back a [`Produce`] step; the
//! continuation runs that step on the VM thread to turn the outcome into Lua
//! values.

use std::future::Future;

use mlua::{Function, IntoLua, Lua, MultiValue, Value};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    context::Context,
    error::{Error, Result},
    pool::task,
};

/// Builds the values a continuation returns after its leading `nil`.
pub type Produce = Box<dyn FnOnce(&Lua) -> mlua::Result<MultiValue> + Send>;

type Outcome = std::result::Result<Produce, String>;

/// Step producing a single value.
pub fn produce<T>(value: T) -> Produce
where
    T: IntoLua + Send + 'static,
{
    Box::new(move |lua| Ok(MultiValue::from_vec(vec![value.into_lua(lua)?])))
}

/// Step producing a single value built on the VM thread.
pub fn produce_with<F, T>(f: F) -> Produce
where
    F: FnOnce(&Lua) -> mlua::Result<T> + Send + 'static,
    T: IntoLua,
{
    Box::new(move |lua| Ok(MultiValue::from_vec(vec![f(lua)?.into_lua(lua)?])))
}

/// Step producing nothing beyond the error slot.
pub fn nothing() -> Produce {
    Box::new(|_| Ok(MultiValue::new()))
}

/// Runs a blocking call on tokio's blocking threads so async workers stay free.
pub async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

/// Queues `fut` and returns a continuation yielding `err`.
pub fn deferred<F>(lua: &Lua, ctx: &Context, fut: F) -> mlua::Result<Function>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    deferred_result(lua, ctx, async move {
        fut.await?;
        Ok(nothing())
    })
}

/// Queues `fut` and returns a continuation yielding `err, ...values`.
pub fn deferred_result<F>(lua: &Lua, ctx: &Context, fut: F) -> mlua::Result<Function>
where
    F: Future<Output = Result<Produce>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<Outcome>();
    let queued = ctx.async_pool().add(task(move |tctx| async move {
        match tctx.run(fut).await {
            Ok(produce) => {
                let _ = tx.send(Ok(produce));
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                let _ = tx.send(Err(msg.clone()));
                Err(Error::Task(msg))
            }
        }
    }));

    let pending: Mutex<Option<std::result::Result<oneshot::Receiver<Outcome>, String>>> =
        Mutex::new(Some(queued.map(|()| rx).map_err(|e| e.to_string())));

    lua.create_function(move |lua, ()| {
        let pending = pending
            .lock()
            .take()
            .ok_or_else(|| mlua::Error::runtime("async result was already awaited"))?;
        let outcome = pending.and_then(|rx| {
            rx.blocking_recv()
                .unwrap_or_else(|_| Err(Error::TaskDropped.to_string()))
        });
        match outcome {
            Ok(produce) => {
                let mut values = produce(lua)?;
                values.push_front(Value::Nil);
                Ok(values)
            }
            Err(msg) => Ok(MultiValue::from_vec(vec![Value::String(
                lua.create_string(&msg)?,
            )])),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::Harness;
    use std::time::Duration;

    #[test]
    fn continuation_yields_values() {
        let h = Harness::new();
        let f = deferred_result(h.lua(), h.ctx(), async { Ok(produce(42)) }).unwrap();
        let (err, value): (Value, i64) = f.call(()).unwrap();
        assert!(err.is_nil());
        assert_eq!(value, 42);
    }

    #[test]
    fn continuation_yields_error_string() {
        let h = Harness::new();
        let f = deferred(h.lua(), h.ctx(), async {
            Err(Error::Closed("socket".into()))
        })
        .unwrap();
        let err: String = f.call(()).unwrap();
        assert_eq!(err, "resource \"socket\" is closed");
    }

    #[test]
    fn second_await_is_an_error() {
        let h = Harness::new();
        let f = deferred(h.lua(), h.ctx(), async { Ok(()) }).unwrap();
        let err: Value = f.call(()).unwrap();
        assert!(err.is_nil());
        assert!(f.call::<Value>(()).is_err());
    }

    #[test]
    fn timeout_surfaces_as_error() {
        let h = Harness::builder().timeout(Duration::from_millis(20)).build();
        let f = deferred(h.lua(), h.ctx(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .unwrap();
        let err: String = f.call(()).unwrap();
        assert!(err.contains("timed out"), "{err}");
    }

    #[test]
    fn stopped_pool_reports_error() {
        let h = Harness::new();
        h.ctx().async_pool().stop();
        let f = deferred(h.lua(), h.ctx(), async { Ok(()) }).unwrap();
        let err: String = f.call(()).unwrap();
        assert_eq!(err, Error::PoolStopped.to_string());
    }

    #[test]
    fn reset_drops_queued_work() {
        let h = Harness::builder().async_concurrency(1).build();
        let (release, wait) = oneshot::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let first = deferred(h.lua(), h.ctx(), async move {
            let _ = started_tx.send(());
            let _ = wait.await;
            Ok(())
        })
        .unwrap();
        started_rx.recv().unwrap();
        let second = deferred(h.lua(), h.ctx(), async { Ok(()) }).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = release.send(());
        });
        h.ctx().async_pool().stop();
        releaser.join().unwrap();

        assert!(first.call::<Value>(()).unwrap().is_nil());
        let err: String = second.call(()).unwrap();
        assert_eq!(err, Error::TaskDropped.to_string());
    }
}
