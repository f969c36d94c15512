//! The `stats` module: ad-hoc tagged measurements.

use std::sync::Arc;

use mlua::{Lua, UserData, UserDataMethods, Value};

use super::{function, register, time::Time, to_string, Env};
use crate::{context::Context, stat::Stat};

/// A stat being assembled by a script. Each `submit` reports a copy, so one
/// handle can be filled and submitted repeatedly.
pub struct StatBuilder {
    stat: Stat,
    ctx: Arc<Context>,
}

impl UserData for StatBuilder {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("tag", |lua, this, (key, value): (String, Value)| {
            this.stat.tags.insert(key, to_string(lua, value)?);
            Ok(())
        });
        methods.add_method_mut("field", |_, this, (key, value): (String, f64)| {
            this.stat.fields.insert(key, value);
            Ok(())
        });
        methods.add_method_mut("set_time", |_, this, time: Time| {
            this.stat.timestamp = time.to_utc();
            Ok(())
        });
        methods.add_method("submit", |_, this, ()| {
            this.ctx.report(vec![this.stat.clone()]);
            Ok(())
        });
    }
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.set(
        "new",
        function(lua, move |_, name: String| {
            Ok(StatBuilder {
                stat: Stat::new(name),
                ctx: env.ctx.clone(),
            })
        })?,
    )?;
    register(lua, "stats", module)
}
