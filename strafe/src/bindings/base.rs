//! Globals every script sees: `print`, `group`, `sleep` and `fail`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use mlua::{Function, Lua, MultiValue, Table, Value};

use super::{deferred::deferred, tag_pairs, to_string, Env};
use crate::{context::Context, metric::Metric};

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let globals = lua.globals();

    let ctx = env.ctx.clone();
    globals.set(
        "print",
        lua.create_function(move |lua, args: MultiValue| {
            let parts = args
                .into_iter()
                .map(|v| to_string(lua, v))
                .collect::<mlua::Result<Vec<_>>>()?;
            ctx.info(&parts.join("\t"));
            Ok(())
        })?,
    )?;

    let ctx = env.ctx.clone();
    globals.set(
        "group",
        lua.create_function(move |lua, args: MultiValue| group(lua, &ctx, args))?,
    )?;

    let ctx = env.ctx.clone();
    globals.set(
        "sleep",
        lua.create_function(move |lua, ms: u64| {
            deferred(lua, &ctx, async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            })
        })?,
    )?;

    globals.set(
        "fail",
        lua.create_function(|lua, msg: Value| -> mlua::Result<()> {
            Err(mlua::Error::runtime(to_string(lua, msg)?))
        })?,
    )?;
    Ok(())
}

/// `group([name], [tags], fn)`
fn group(lua: &Lua, ctx: &Context, args: MultiValue) -> mlua::Result<MultiValue> {
    let mut name = String::new();
    let mut tags: Option<Table> = None;
    let mut body: Option<Function> = None;
    for arg in args {
        match arg {
            Value::String(s) if tags.is_none() && body.is_none() => {
                name = s.to_string_lossy().to_string();
            }
            Value::Table(t) if body.is_none() => tags = Some(t),
            Value::Function(f) => body = Some(f),
            other => {
                return Err(mlua::Error::runtime(format!(
                    "group: unexpected {} argument",
                    other.type_name()
                )))
            }
        }
    }
    let body = body.ok_or_else(|| mlua::Error::runtime("group: missing function"))?;
    let pairs = tag_pairs(lua, tags)?;

    let _scope = ctx.scoped(&name, &pairs);
    let start = Instant::now();
    let result = body.call::<MultiValue>(());
    let elapsed = start.elapsed();

    let scope_name = ctx.scope_name();
    let metric_name = if scope_name.is_empty() {
        "group_us".to_string()
    } else {
        format!("{scope_name}_us")
    };
    let tags = ctx.tags();
    let gauge = ctx
        .global()
        .metric(&format!("group:{}", ctx.scope()), || Metric::gauge(metric_name, tags))?;
    gauge.add(elapsed.as_micros() as f64);

    result
}
