//! Growable read/write buffer with fixed-width integer codecs.

use mlua::{Lua, Table, UserData, UserDataMethods};

use super::{
    bytes::{Bytes, BytesArg},
    function, register,
};

/// Bytes are appended at the end and consumed from the front.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Unread bytes.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn write(&mut self, data: &[u8]) {
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
        self.data.extend_from_slice(data);
    }

    /// Consumes exactly `n` bytes.
    fn take(&mut self, n: usize) -> mlua::Result<&[u8]> {
        let available = self.data.len() - self.pos;
        if available < n {
            return Err(mlua::Error::runtime(format!(
                "buffer underflow: need {n} bytes, have {available}"
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    /// Consumes up to `n` bytes.
    fn take_up_to(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.data.len() - self.pos);
        let start = self.pos;
        self.pos += n;
        &self.data[start..self.pos]
    }
}

macro_rules! int_codec {
    ($methods:ident, $ty:ty, $write:literal, $read:literal, $to:ident, $from:ident) => {
        $methods.add_method_mut($write, |_, this, v: i64| {
            this.write(&(v as $ty).$to());
            Ok(())
        });
        $methods.add_method_mut($read, |_, this, ()| {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(this.take(std::mem::size_of::<$ty>())?);
            Ok(<$ty>::$from(raw) as i64)
        });
    };
}

impl UserData for Buffer {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("bytes", |_, this, ()| Ok(Bytes(this.unread().to_vec())));
        methods.add_method("size", |_, this, ()| Ok(this.unread().len()));
        methods.add_method_mut("write", |_, this, data: BytesArg| {
            this.write(&data.0);
            Ok(())
        });
        methods.add_method_mut("read", |_, this, n: usize| {
            if n > 0 && this.unread().is_empty() {
                return Err(mlua::Error::runtime("EOF"));
            }
            Ok(Bytes(this.take_up_to(n).to_vec()))
        });
        methods.add_method_mut("write_byte", |_, this, b: u8| {
            this.write(&[b]);
            Ok(())
        });
        methods.add_method_mut("read_byte", |_, this, ()| Ok(this.take(1)?[0]));

        int_codec!(methods, u16, "write_uint16_be", "read_uint16_be", to_be_bytes, from_be_bytes);
        int_codec!(methods, u16, "write_uint16_le", "read_uint16_le", to_le_bytes, from_le_bytes);
        int_codec!(methods, u32, "write_uint32_be", "read_uint32_be", to_be_bytes, from_be_bytes);
        int_codec!(methods, u32, "write_uint32_le", "read_uint32_le", to_le_bytes, from_le_bytes);
        int_codec!(methods, u64, "write_uint64_be", "read_uint64_be", to_be_bytes, from_be_bytes);
        int_codec!(methods, u64, "write_uint64_le", "read_uint64_le", to_le_bytes, from_le_bytes);
        int_codec!(methods, i16, "write_int16_be", "read_int16_be", to_be_bytes, from_be_bytes);
        int_codec!(methods, i16, "write_int16_le", "read_int16_le", to_le_bytes, from_le_bytes);
        int_codec!(methods, i32, "write_int32_be", "read_int32_be", to_be_bytes, from_be_bytes);
        int_codec!(methods, i32, "write_int32_le", "read_int32_le", to_le_bytes, from_le_bytes);
        int_codec!(methods, i64, "write_int64_be", "read_int64_be", to_be_bytes, from_be_bytes);
        int_codec!(methods, i64, "write_int64_le", "read_int64_le", to_le_bytes, from_le_bytes);
    }
}

pub fn open(lua: &Lua) -> mlua::Result<()> {
    let module: Table = lua.create_table()?;
    module.set(
        "new",
        function(lua, |_, data: Option<BytesArg>| {
            Ok(Buffer::new(data.map(|d| d.0).unwrap_or_default()))
        })?,
    )?;
    register(lua, "buffer", module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::Harness;

    #[test]
    fn integers_have_the_right_layout() {
        let h = Harness::new();
        let b: mlua::AnyUserData = h.eval(
            r#"
            local b = buffer.new()
            b:write_uint16_be(0x0102)
            b:write_uint16_le(0x0102)
            b:write_int32_be(-2)
            return b:bytes()
            "#,
        );
        assert_eq!(
            b.borrow::<Bytes>().unwrap().0,
            vec![0x01, 0x02, 0x02, 0x01, 0xff, 0xff, 0xff, 0xfe]
        );
    }

    #[test]
    fn reads_consume_from_the_front() {
        let h = Harness::new();
        h.exec(
            r#"
            local b = buffer.new(bytes.new("0001000000000000002aff", "hex"))
            assert(b:size() == 11)
            assert(b:read_uint16_be() == 1)
            assert(b:read_int64_be() == 42)
            assert(b:read_byte() == 255)
            assert(b:size() == 0)
            assert(not pcall(b.read_byte, b))

            b:write("abc")
            assert(b:read(2):string() == "ab")
            assert(b:read(10):string() == "c")
            assert(not pcall(b.read, b, 1))
            "#,
        );
    }

    #[test]
    fn signed_and_little_endian_values() {
        let h = Harness::new();
        h.exec(
            r#"
            local b = buffer.new()
            b:write_int16_le(-300)
            b:write_uint32_le(4000000000)
            b:write_int64_le(-1)
            b:write_uint64_be(7)
            assert(b:read_int16_le() == -300)
            assert(b:read_uint32_le() == 4000000000)
            assert(b:read_int64_le() == -1)
            assert(b:read_uint64_be() == 7)
            "#,
        );
    }

    #[test]
    fn underflow_is_an_error() {
        let h = Harness::new();
        let err = h
            .try_exec("local b = buffer.new('a') b:read_uint32_be()")
            .unwrap_err();
        assert!(err.to_string().contains("buffer underflow"), "{err}");
    }
}
