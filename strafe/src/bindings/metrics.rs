//! The `metrics` module: counters, gauges and rates shared by every VM.

use std::sync::Arc;

use mlua::{Lua, Table, UserData, UserDataMethods, Value};

use super::{function, register, tag_pairs, Env};
use crate::metric::{Metric, MetricKind};

pub struct LuaMetric(pub Arc<Metric>);

impl UserData for LuaMetric {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("name", |_, this, ()| Ok(this.0.name().to_string()));
        methods.add_method("add", |_, this, value: Value| {
            let v = match value {
                Value::Boolean(b) => f64::from(u8::from(b)),
                Value::Integer(i) => i as f64,
                Value::Number(n) => n,
                other => {
                    return Err(mlua::Error::runtime(format!(
                        "cannot add {} to metric {}",
                        other.type_name(),
                        this.0.name()
                    )))
                }
            };
            this.0.add(v);
            Ok(())
        });
    }
}

fn constructor(lua: &Lua, env: &Arc<Env>, kind: MetricKind) -> mlua::Result<mlua::Function> {
    let env = env.clone();
    function(lua, move |lua, (name, tags): (String, Option<Table>)| {
        let ctx = &env.ctx;
        let pairs = tag_pairs(lua, tags)?;
        let metric = ctx.global().metric(&format!("metric:{name}"), || {
            let mut tags: crate::metric::Tags = pairs
                .chunks_exact(2)
                .map(|kv| (kv[0].clone(), kv[1].clone()))
                .collect();
            tags.extend(ctx.tags());
            Metric::of_kind(kind, name.as_str(), tags)
        })?;
        if metric.kind() != kind {
            return Err(mlua::Error::runtime(format!(
                "metric {name} already exists as a {}",
                metric.kind()
            )));
        }
        Ok(LuaMetric(metric))
    })
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.set("counter", constructor(lua, &env, MetricKind::Counter)?)?;
    module.set("gauge", constructor(lua, &env, MetricKind::Gauge)?)?;
    module.set("rate", constructor(lua, &env, MetricKind::Rate)?)?;
    register(lua, "metrics", module)
}
