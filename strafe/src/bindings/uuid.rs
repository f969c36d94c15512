use mlua::{Lua, Table};
use uuid::Uuid;

use super::{function, register};

/// Resolves a namespace given as a UUID string or one of the well-known names.
/// Anything else is the nil UUID.
fn namespace(ns: &str) -> Uuid {
    match ns {
        "dns" => Uuid::NAMESPACE_DNS,
        "url" => Uuid::NAMESPACE_URL,
        "oid" => Uuid::NAMESPACE_OID,
        "x500" => Uuid::NAMESPACE_X500,
        other => Uuid::parse_str(other).unwrap_or(Uuid::nil()),
    }
}

fn v1() -> Uuid {
    let random = Uuid::new_v4();
    let mut node = [0u8; 6];
    node.copy_from_slice(&random.as_bytes()[..6]);
    Uuid::now_v1(&node)
}

pub fn open(lua: &Lua) -> mlua::Result<()> {
    let module: Table = lua.create_table()?;
    module.set("v1", function(lua, |_, ()| Ok(v1().to_string()))?)?;
    module.set("v4", function(lua, |_, ()| Ok(Uuid::new_v4().to_string()))?)?;
    module.set(
        "v3",
        function(lua, |_, (ns, name): (String, String)| {
            Ok(Uuid::new_v3(&namespace(&ns), name.as_bytes()).to_string())
        })?,
    )?;
    module.set(
        "v5",
        function(lua, |_, (ns, name): (String, String)| {
            Ok(Uuid::new_v5(&namespace(&ns), name.as_bytes()).to_string())
        })?,
    )?;
    register(lua, "uuid", module)
}
