use md5::Md5;
use mlua::{Lua, Table};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_224, Sha3_256, Sha3_384, Sha3_512};

use super::{
    bytes::{Bytes, BytesArg},
    function, register,
};

fn digest<D: Digest>(data: &[u8]) -> Bytes {
    Bytes(D::digest(data).to_vec())
}

fn hasher(lua: &Lua, hash: fn(&[u8]) -> Bytes) -> mlua::Result<mlua::Function> {
    function(lua, move |_, data: BytesArg| Ok(hash(&data.0)))
}

pub fn open(lua: &Lua) -> mlua::Result<()> {
    let module: Table = lua.create_table()?;
    module.set("md5", hasher(lua, digest::<Md5>)?)?;
    module.set("sha1", hasher(lua, digest::<Sha1>)?)?;
    module.set("sha256", hasher(lua, digest::<Sha256>)?)?;
    module.set("sha512", hasher(lua, digest::<Sha512>)?)?;
    module.set("sha3_224", hasher(lua, digest::<Sha3_224>)?)?;
    module.set("sha3_256", hasher(lua, digest::<Sha3_256>)?)?;
    module.set("sha3_384", hasher(lua, digest::<Sha3_384>)?)?;
    module.set("sha3_512", hasher(lua, digest::<Sha3_512>)?)?;
    register(lua, "crypto", module)
}
