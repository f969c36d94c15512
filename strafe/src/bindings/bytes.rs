//! Binary-safe byte strings.

use base64::Engine;
use mlua::{FromLua, Lua, MetaMethod, Table, UserData, UserDataMethods, Value};

use super::{function, register};

/// Largest size `set` may grow a byte string to.
const MAX_LEN: usize = 1 << 30;

/// A mutable byte string. Indexing from Lua is 1-based.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl From<Vec<u8>> for Bytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Argument accepting a Lua string or a [`Bytes`].
#[derive(Clone, Debug)]
pub struct BytesArg(pub Vec<u8>);

impl FromLua for BytesArg {
    fn from_lua(value: Value, _: &Lua) -> mlua::Result<Self> {
        match value {
            Value::String(s) => Ok(Self(s.as_bytes().to_vec())),
            Value::UserData(ud) => Ok(Self(ud.borrow::<Bytes>()?.0.clone())),
            other => Err(mlua::Error::runtime(format!(
                "expected string or bytes, got {}",
                other.type_name()
            ))),
        }
    }
}

fn decode(data: &[u8], encoding: Option<&str>) -> mlua::Result<Vec<u8>> {
    let decoded = match encoding {
        None | Some("") => return Ok(data.to_vec()),
        Some("base64") => base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(mlua::Error::external)?,
        Some("base32") => data_encoding::BASE32
            .decode(data)
            .map_err(mlua::Error::external)?,
        Some("hex") => hex::decode(data).map_err(mlua::Error::external)?,
        Some(other) => {
            return Err(mlua::Error::runtime(format!("unknown encoding {other}")))
        }
    };
    Ok(decoded)
}

fn encode(data: &[u8], encoding: Option<&str>) -> mlua::Result<Vec<u8>> {
    let encoded = match encoding {
        None | Some("") => return Ok(data.to_vec()),
        Some("base64") => base64::engine::general_purpose::STANDARD.encode(data),
        Some("base32") => data_encoding::BASE32.encode(data),
        Some("hex") => hex::encode(data),
        Some(other) => {
            return Err(mlua::Error::runtime(format!("unknown encoding {other}")))
        }
    };
    Ok(encoded.into_bytes())
}

fn index(i: i64, len: usize) -> mlua::Result<usize> {
    if i < 1 {
        return Err(mlua::Error::runtime(format!("index {i} out of range")));
    }
    let i = (i - 1) as usize;
    if i >= len {
        return Err(mlua::Error::runtime(format!(
            "index {} out of range [1, {len}]",
            i + 1
        )));
    }
    Ok(i)
}

impl UserData for Bytes {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("size", |_, this, ()| Ok(this.0.len()));
        methods.add_method("string", |lua, this, encoding: Option<String>| {
            lua.create_string(encode(&this.0, encoding.as_deref())?)
        });
        methods.add_method("get", |_, this, i: i64| Ok(this.0[index(i, this.0.len())?]));
        methods.add_method_mut("set", |_, this, (i, b): (i64, u8)| {
            if i < 1 {
                return Err(mlua::Error::runtime(format!("index {i} out of range")));
            }
            let i = (i - 1) as usize;
            if i >= this.0.len() {
                if i >= MAX_LEN {
                    return Err(mlua::Error::runtime(format!(
                        "index {} exceeds the {MAX_LEN} byte limit",
                        i + 1
                    )));
                }
                this.0
                    .try_reserve(i + 1 - this.0.len())
                    .map_err(mlua::Error::external)?;
                this.0.resize(i + 1, 0);
            }
            this.0[i] = b;
            Ok(())
        });
        methods.add_method_mut("replace", |_, this, data: BytesArg| {
            this.0 = data.0;
            Ok(())
        });

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            lua.create_string(&this.0)
        });
        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (BytesArg, BytesArg)| {
            Ok(a.0 == b.0)
        });
        for meta in [MetaMethod::Concat, MetaMethod::Add] {
            methods.add_meta_function(meta, |_, (a, b): (BytesArg, BytesArg)| {
                let mut joined = a.0;
                joined.extend_from_slice(&b.0);
                Ok(Bytes(joined))
            });
        }
    }
}

pub fn open(lua: &Lua) -> mlua::Result<()> {
    let module: Table = lua.create_table()?;
    module.set(
        "new",
        function(lua, |_, (data, encoding): (Option<BytesArg>, Option<String>)| {
            let data = data.map(|d| d.0).unwrap_or_default();
            Ok(Bytes(decode(&data, encoding.as_deref())?))
        })?,
    )?;
    register(lua, "bytes", module)
}
