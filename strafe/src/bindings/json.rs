//! `json_marshal` and `json_unmarshal`.

use std::{collections::HashSet, ffi::c_void};

use mlua::{Lua, Table, Value};
use serde_json::{Map, Number, Value as Json};

use super::{bytes::Bytes, time::Time};

fn unsupported(value: &Value) -> mlua::Error {
    mlua::Error::runtime(format!("cannot encode {} to JSON", value.type_name()))
}

/// Converts a Lua value into JSON.
///
/// Empty tables become arrays. A table with integer keys must be a proper
/// sequence starting at 1. Tables may not contain themselves.
pub fn to_json(value: &Value) -> mlua::Result<Json> {
    encode(value, &mut HashSet::new())
}

fn encode(value: &Value, seen: &mut HashSet<*const c_void>) -> mlua::Result<Json> {
    match value {
        Value::Nil => Ok(Json::Null),
        Value::Boolean(b) => Ok(Json::Bool(*b)),
        Value::Integer(i) => Ok(Json::from(*i)),
        Value::Number(n) => Number::from_f64(*n)
            .map(Json::Number)
            .ok_or_else(|| mlua::Error::runtime(format!("cannot encode number {n} to JSON"))),
        Value::String(s) => Ok(Json::String(s.to_string_lossy().to_string())),
        Value::Table(t) => {
            let ptr = t.to_pointer();
            if !seen.insert(ptr) {
                return Err(mlua::Error::runtime(
                    "cannot encode recursively nested tables to JSON",
                ));
            }
            let encoded = encode_table(t, seen);
            seen.remove(&ptr);
            encoded
        }
        Value::UserData(ud) => {
            if let Ok(bytes) = ud.borrow::<Bytes>() {
                return Ok(Json::String(String::from_utf8_lossy(&bytes.0).into_owned()));
            }
            if let Ok(time) = ud.borrow::<Time>() {
                return Ok(Json::String(time.string()));
            }
            Ok(Json::String("*USERDATA*".to_string()))
        }
        other => Err(unsupported(other)),
    }
}

fn encode_table(table: &Table, seen: &mut HashSet<*const c_void>) -> mlua::Result<Json> {
    let mut indexed = Vec::new();
    let mut named = Map::new();
    for entry in table.clone().pairs::<Value, Value>() {
        let (k, v) = entry?;
        match k {
            Value::Integer(i) => indexed.push((i, v)),
            Value::String(s) => {
                named.insert(s.to_string_lossy().to_string(), encode(&v, seen)?);
            }
            _ => {
                return Err(mlua::Error::runtime(
                    "cannot encode mixed or invalid key types",
                ))
            }
        }
    }

    match (indexed.is_empty(), named.is_empty()) {
        (true, true) => Ok(Json::Array(Vec::new())),
        (true, false) => Ok(Json::Object(named)),
        (false, false) => Err(mlua::Error::runtime(
            "cannot encode mixed or invalid key types",
        )),
        (false, true) => {
            indexed.sort_by_key(|(i, _)| *i);
            let mut items = Vec::with_capacity(indexed.len());
            for (expected, (i, v)) in (1..).zip(indexed) {
                if i != expected {
                    return Err(mlua::Error::runtime("cannot encode sparse array"));
                }
                items.push(encode(&v, seen)?);
            }
            Ok(Json::Array(items))
        }
    }
}

/// Converts JSON into a Lua value. Integral numbers stay integers.
pub fn from_json(lua: &Lua, value: &Json) -> mlua::Result<Value> {
    Ok(match value {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(lua.create_string(s)?),
        Json::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, from_json(lua, item)?)?;
            }
            Value::Table(table)
        }
        Json::Object(fields) => {
            let table = lua.create_table_with_capacity(0, fields.len())?;
            for (k, v) in fields {
                table.raw_set(k.as_str(), from_json(lua, v)?)?;
            }
            Value::Table(table)
        }
    })
}

pub fn open(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set(
        "json_marshal",
        lua.create_function(|_, value: Value| {
            serde_json::to_string(&to_json(&value)?).map_err(mlua::Error::external)
        })?,
    )?;
    globals.set(
        "json_unmarshal",
        lua.create_function(|lua, text: mlua::String| {
            let value: Json =
                serde_json::from_slice(&text.as_bytes()).map_err(mlua::Error::external)?;
            from_json(lua, &value)
        })?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::Harness;

    fn marshal(h: &Harness, expr: &str) -> String {
        h.eval(&format!("return json_marshal({expr})"))
    }

    fn marshal_err(h: &Harness, expr: &str) -> String {
        h.try_exec(&format!("json_marshal({expr})"))
            .unwrap_err()
            .to_string()
    }

    mod encoding {
        use super::*;

        #[test]
        fn scalars_and_tables() {
            let h = Harness::new();
            assert_eq!(marshal(&h, "{}"), "[]");
            assert_eq!(marshal(&h, "{1, 2.5, 'x', true}"), r#"[1,2.5,"x",true]"#);
            assert_eq!(marshal(&h, "{b = 1, a = {c = 'd'}}"), r#"{"a":{"c":"d"},"b":1}"#);
            assert_eq!(marshal(&h, "nil"), "null");
            assert_eq!(marshal(&h, "bytes.new('raw')"), r#""raw""#);
        }

        #[test]
        fn rejects_bad_shapes() {
            let h = Harness::new();
            assert!(marshal_err(&h, "{[1] = 1, [3] = 3}").contains("sparse array"));
            assert!(marshal_err(&h, "{1, a = 2}").contains("mixed or invalid key types"));
            assert!(marshal_err(&h, "{[true] = 1}").contains("mixed or invalid key types"));
            assert!(marshal_err(&h, "{f = print}").contains("cannot encode function"));
        }

        #[test]
        fn cycles_are_rejected_but_sharing_is_not() {
            let h = Harness::new();
            let err = h
                .try_exec("local t = {} t.self = t json_marshal(t)")
                .unwrap_err();
            assert!(err.to_string().contains("recursively nested"), "{err}");

            let s: String = h.eval("local shared = {1} return json_marshal({a = shared, b = shared})");
            assert_eq!(s, r#"{"a":[1],"b":[1]}"#);
        }
    }

    mod decoding {
        use super::*;

        #[test]
        fn integers_stay_integers() {
            let h = Harness::new();
            h.exec(
                r#"
                local v = json_unmarshal('{"n": 3, "f": 1.5, "list": [1, "two", null, false]}')
                assert(math.type(v.n) == "integer")
                assert(v.f == 1.5)
                assert(v.list[2] == "two")
                assert(v.list[3] == nil)
                assert(v.list[4] == false)
                "#,
            );
        }

        #[test]
        fn round_trip_through_script() {
            let h = Harness::new();
            let s: String = h.eval(
                r#"return json_marshal(json_unmarshal('{"a":[1,2,{"b":"c"}]}'))"#,
            );
            assert_eq!(s, r#"{"a":[1,2,{"b":"c"}]}"#);
        }

        #[test]
        fn malformed_input_raises() {
            let h = Harness::new();
            assert!(h.try_exec("json_unmarshal('{')").is_err());
        }
    }
}
