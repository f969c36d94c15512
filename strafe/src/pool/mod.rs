//! Per-VM pools.
//!
//! Both pools are owned by a single [`Vm`](crate::Vm) and reset between
//! iterations: the [`AsyncPool`] is stopped and restarted so no task crosses an
//! iteration boundary, and the [`ReleasePool`] is swept so no handle does.

mod async_pool;
mod release;

pub use async_pool::{task, AsyncPool, AsyncTask, TaskContext};
pub use release::{CleanReport, Guard, ReleasePool, Resource};
