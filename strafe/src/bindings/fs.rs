//! The `fs` module: the job's virtual filesystem, seen from a script.

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mlua::{Lua, Table, UserData, UserDataMethods};
use parking_lot::Mutex;

use super::{
    bytes::{Bytes, BytesArg},
    deferred::{blocking, deferred_result, nothing, produce, produce_with, Produce},
    function,
    io::{add_closer, add_handle, add_reader, add_writer, Closeable, Handle, Readable, Writable},
    register,
    time::Time,
    Env,
};
use crate::{
    context::Context,
    error::{Error, Result},
    fs::{File, FileInfo, Filesystem, OpenOptions},
    pool::{Guard, Resource},
};

/// An open file shared by its script handle and the release pool.
struct FileSlot {
    name: String,
    file: Mutex<Option<Box<dyn File>>>,
}

impl FileSlot {
    fn with<T>(&self, op: impl FnOnce(&mut dyn File) -> io::Result<T>) -> Result<T> {
        let mut file = self.file.lock();
        let file = file
            .as_mut()
            .ok_or_else(|| Error::Closed(self.name.clone()))?;
        Ok(op(file.as_mut())?)
    }
}

impl Resource for Arc<FileSlot> {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.lock().take() {
            file.flush()?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LuaFile {
    slot: Arc<FileSlot>,
    guard: Guard,
    ctx: Arc<Context>,
}

impl Handle for LuaFile {
    fn name(&self) -> &str {
        &self.slot.name
    }

    fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn guard(&self) -> &Guard {
        &self.guard
    }
}

#[async_trait]
impl Readable for LuaFile {
    async fn read(&self, n: usize) -> Result<Vec<u8>> {
        let slot = self.slot.clone();
        blocking(move || {
            slot.with(|f| {
                let mut buf = vec![0; n];
                let got = f.read(&mut buf)?;
                buf.truncate(got);
                Ok(buf)
            })
        })
        .await
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        let slot = self.slot.clone();
        blocking(move || {
            slot.with(|f| {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Ok(buf)
            })
        })
        .await
    }
}

#[async_trait]
impl Writable for LuaFile {
    async fn write(&self, data: Vec<u8>) -> Result<()> {
        let slot = self.slot.clone();
        blocking(move || slot.with(|f| f.write_all(&data))).await
    }
}

#[async_trait]
impl Closeable for LuaFile {
    async fn close(&self) -> Result<()> {
        let slot = self.slot.clone();
        blocking(move || match slot.file.lock().take() {
            Some(mut file) => Ok(file.flush()?),
            None => Ok(()),
        })
        .await
    }
}

impl UserData for LuaFile {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        add_handle::<Self, M>(methods);
        add_reader::<Self, M>(methods);
        add_writer::<Self, M>(methods);
        add_closer::<Self, M>(methods);
    }
}

fn info_table(lua: &Lua, info: &FileInfo) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("name", info.name.as_str())?;
    table.set("size", info.size)?;
    table.set("dir", info.is_dir)?;
    table.set(
        "modtime",
        Time(DateTime::<Utc>::from(info.modified).fixed_offset()),
    )?;
    Ok(table)
}

fn opener(lua: &Lua, env: &Arc<Env>, options: OpenOptions) -> mlua::Result<mlua::Function> {
    let env = env.clone();
    function(lua, move |lua, path: String| {
        let fs = env.fs.clone();
        let ctx = env.ctx.clone();
        deferred_result(lua, &env.ctx, async move {
            let file = blocking(move || Ok(fs.open(&path, options)?)).await?;
            let slot = Arc::new(FileSlot {
                name: file.name().to_string(),
                file: Mutex::new(Some(file)),
            });
            let guard = ctx.release_pool().watch(slot.clone());
            Ok(produce(LuaFile { slot, guard, ctx }))
        })
    })
}

/// Registers a module function running `op` on the filesystem.
fn fs_call<A, F>(lua: &Lua, env: &Arc<Env>, op: F) -> mlua::Result<mlua::Function>
where
    A: mlua::FromLuaMulti + Send + 'static,
    F: Fn(&dyn Filesystem, A) -> Result<Produce> + Send + Sync + Copy + 'static,
{
    let env = env.clone();
    function(lua, move |lua, args: A| {
        let fs = env.fs.clone();
        deferred_result(lua, &env.ctx, async move {
            blocking(move || op(fs.as_ref(), args)).await
        })
    })
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.set("open", opener(lua, &env, OpenOptions::read_write())?)?;
    module.set("create", opener(lua, &env, OpenOptions::create())?)?;
    module.set(
        "remove",
        fs_call(lua, &env, |fs, path: String| {
            fs.remove(&path)?;
            Ok(nothing())
        })?,
    )?;
    module.set(
        "remove_all",
        fs_call(lua, &env, |fs, path: String| {
            fs.remove_all(&path)?;
            Ok(nothing())
        })?,
    )?;
    module.set(
        "mkdir_all",
        fs_call(lua, &env, |fs, path: String| {
            fs.mkdir_all(&path)?;
            Ok(nothing())
        })?,
    )?;
    module.set(
        "exist",
        fs_call(lua, &env, |fs, path: String| Ok(produce(fs.exists(&path))))?,
    )?;
    module.set(
        "read_all",
        fs_call(lua, &env, |fs, path: String| {
            Ok(produce(Bytes(fs.read(&path)?)))
        })?,
    )?;
    module.set(
        "write",
        fs_call(lua, &env, |fs, (path, data): (String, BytesArg)| {
            fs.write(&path, &data.0)?;
            Ok(nothing())
        })?,
    )?;
    module.set(
        "stat",
        fs_call(lua, &env, |fs, path: String| {
            let info = fs.stat(&path)?;
            Ok(produce_with(move |lua| info_table(lua, &info)))
        })?,
    )?;
    module.set(
        "list",
        fs_call(lua, &env, |fs, path: String| {
            let entries = fs.read_dir(&path)?;
            Ok(produce_with(move |lua| {
                let list = lua.create_table()?;
                for (i, info) in entries.iter().enumerate() {
                    list.raw_set(i + 1, info_table(lua, info)?)?;
                }
                Ok(list)
            }))
        })?,
    )?;
    register(lua, "fs", module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::Harness;

    mod files {
        use super::*;

        #[test]
        fn open_keeps_existing_contents() {
            let h = Harness::builder().file("/greeting", "hello world").build();
            h.exec(
                r#"
                local err, f = fs.open("/greeting")()
                assert(err == nil, err)
                assert(f:name() == "/greeting")
                assert(f:write("nihao")() == nil)
                assert(f:close()() == nil)
                "#,
            );
            assert_eq!(h.fs().read("/greeting").unwrap(), b"nihao world");
            assert_eq!(h.ctx().release_pool().live(), 0);
        }

        #[test]
        fn create_truncates_and_reads_back() {
            let h = Harness::builder().file("/data", "old contents").build();
            h.exec(
                r#"
                local err, f = fs:create("/data")()
                assert(err == nil, err)
                f:write(bytes.new("abcdef"))()
                f:close()()

                local err, f = fs.open("/data")()
                local err, chunk = f:read(4)()
                assert(err == nil, err)
                assert(chunk:string() == "abcd")
                local err, rest = f:read_all()()
                assert(rest:string() == "ef")
                local err = f:read(1)()
                assert(err == "EOF", err)
                f:close()()
                "#,
            );
        }

        #[test]
        fn closed_file_rejects_io() {
            let h = Harness::new();
            h.exec(
                r#"
                local _, f = fs.create("/x")()
                assert(f:close()() == nil)
                local err = f:write("late")()
                assert(err == 'resource "/x" is closed', err)
                "#,
            );
        }

        #[test]
        fn leaked_file_is_swept() {
            let h = Harness::new();
            h.exec(r#"local _, f = fs.create("/leak")() f:write("x")()"#);
            assert_eq!(h.ctx().release_pool().live(), 1);
            let report = h.vm().reset();
            assert_eq!(report.warned, 1);
            assert_eq!(report.released, 1);
            assert_eq!(h.fs().read("/leak").unwrap(), b"x");
        }

        #[test]
        fn missing_file_is_an_error_value() {
            let h = Harness::new();
            h.exec(
                r#"
                local err, data = fs.read_all("/nope")()
                assert(err ~= nil and data == nil)
                "#,
            );
        }
    }

    mod module {
        use super::*;

        #[test]
        fn listing_and_stat() {
            let h = Harness::builder()
                .file("/dir/b.txt", "bb")
                .file("/dir/a.txt", "a")
                .build();
            h.exec(
                r#"
                assert(fs.mkdir_all("/dir/sub")() == nil)
                local err, list = fs.list("/dir")()
                assert(err == nil, err)
                assert(#list == 3)
                assert(list[1].name == "a.txt" and list[1].size == 1 and not list[1].dir)
                assert(list[3].name == "sub" and list[3].dir)

                local err, info = fs.stat("/dir/b.txt")()
                assert(info.size == 2)
                assert(info.modtime:year() >= 2024)
                "#,
            );
        }

        #[test]
        fn write_read_remove() {
            let h = Harness::new();
            h.exec(
                r#"
                assert(fs.write("/w", "first")() == nil)
                assert(fs.write("/w", "2nd")() == nil)
                local err, data = fs.read_all("/w")()
                assert(data:string() == "2nd")
                local _, exists = fs.exist("/w")()
                assert(exists == true)
                assert(fs.remove("/w")() == nil)
                local _, exists = fs.exist("/w")()
                assert(exists == false)

                fs.write("/tree/a/b", "x")()
                assert(fs.remove_all("/tree")() == nil)
                assert(select(2, fs.exist("/tree/a")()) == false)
                "#,
            );
        }

        #[test]
        fn require_returns_the_global() {
            let h = Harness::new();
            h.exec(r#"assert(require("fs") == fs)"#);
        }
    }
}
