//! Modules exposed to scripts.
//!
//! Every module is installed both as a global and in `package.loaded`, so
//! `local fs = require "fs"` and plain `fs` refer to the same table. Module
//! functions accept dot and colon calls alike.
//!
//! Functions that touch the outside world never block the interpreter
//! directly. They queue the work on the VM's [`AsyncPool`](crate::AsyncPool)
//! and hand back a continuation; calling it blocks until the work is done and
//! returns `err, ...values` where `err` is `nil` on success:
//!
//! ```lua
//! local err, file = fs.open("/data.txt")()
//! assert(err == nil, err)
//! ```

pub mod base;
pub mod buffer;
pub mod bytes;
pub mod crypto;
pub mod deferred;
pub mod fs;
pub mod http;
pub mod io;
pub mod json;
pub mod metrics;
pub mod net;
pub mod proto;
pub mod stats;
pub mod time;
pub mod uuid;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, MultiValue, Table, Value};

use crate::{context::Context, fs::Filesystem};

/// What binding modules close over.
pub struct Env {
    pub ctx: Arc<Context>,
    pub fs: Arc<dyn Filesystem>,
    pub http: reqwest::Client,
}

/// Installs every module into `lua`.
pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    json::open(lua)?;
    bytes::open(lua)?;
    time::open(lua)?;
    base::open(lua, env.clone())?;
    fs::open(lua, env.clone())?;
    http::open(lua, env.clone())?;
    proto::open(lua, env.clone())?;
    websocket::open(lua, env.clone())?;
    net::open(lua, env.clone())?;
    uuid::open(lua)?;
    crypto::open(lua)?;
    stats::open(lua, env.clone())?;
    metrics::open(lua, env)?;
    buffer::open(lua)?;
    Ok(())
}

/// Makes `module` reachable as a global and through `require`.
pub(crate) fn register(lua: &Lua, name: &str, module: Table) -> mlua::Result<()> {
    let loaded: Table = lua.globals().get::<Table>("package")?.get("loaded")?;
    loaded.set(name, module.clone())?;
    lua.globals().set(name, module)
}

/// Wraps a module function so `module.f(x)` and `module:f(x)` behave the same.
///
/// No module function takes a table as its first argument, so a leading table
/// is always the module itself.
pub(crate) fn function<A, R, F>(lua: &Lua, f: F) -> mlua::Result<Function>
where
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, A) -> mlua::Result<R> + Send + 'static,
{
    lua.create_function(move |lua, mut args: MultiValue| {
        if matches!(args.front(), Some(Value::Table(_))) {
            args.pop_front();
        }
        f(lua, A::from_lua_multi(args, lua)?)
    })
}

/// Renders a value the way Lua's `tostring` does, honouring `__tostring`.
pub(crate) fn to_string(lua: &Lua, value: Value) -> mlua::Result<String> {
    let tostring: Function = lua.globals().get("tostring")?;
    let s: mlua::String = tostring.call(value)?;
    Ok(s.to_string_lossy().to_string())
}

/// Flattens a `{k = v}` table into `k, v, k, v...`.
pub(crate) fn tag_pairs(lua: &Lua, tags: Option<Table>) -> mlua::Result<Vec<String>> {
    let mut pairs = Vec::new();
    if let Some(tags) = tags {
        for entry in tags.pairs::<Value, Value>() {
            let (k, v) = entry?;
            pairs.push(to_string(lua, k)?);
            pairs.push(to_string(lua, v)?);
        }
    }
    Ok(pairs)
}
