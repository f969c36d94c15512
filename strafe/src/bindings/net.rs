//! The `net` module: raw TCP and UDP connections.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use mlua::{Lua, UserData, UserDataMethods};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};

use super::{
    deferred::{deferred_result, produce},
    function,
    io::{add_closer, add_handle, add_reader, add_writer, Closeable, Handle, Readable, Slot, Writable},
    register, Env,
};
use crate::{context::Context, error::Result, pool::Guard};

/// Largest datagram `read_all` accepts.
const MAX_DATAGRAM: usize = 65_507;

enum Stream {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Clone, Copy)]
enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    async fn dial(self, addr: &str) -> Result<Stream> {
        Ok(match self {
            Protocol::Tcp => Stream::Tcp(TcpStream::connect(addr).await?),
            Protocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(addr).await?;
                Stream::Udp(socket)
            }
        })
    }
}

#[derive(Clone)]
pub struct Conn {
    slot: Arc<Slot<Stream>>,
    guard: Guard,
    ctx: Arc<Context>,
}

impl Handle for Conn {
    fn name(&self) -> &str {
        self.slot.name()
    }

    fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn guard(&self) -> &Guard {
        &self.guard
    }
}

#[async_trait]
impl Readable for Conn {
    async fn read(&self, n: usize) -> Result<Vec<u8>> {
        self.slot
            .with(move |stream| {
                async move {
                    let mut buf = vec![0; n];
                    let got = match stream {
                        Stream::Tcp(s) => s.read(&mut buf).await?,
                        Stream::Udp(s) => s.recv(&mut buf).await?,
                    };
                    buf.truncate(got);
                    Ok(buf)
                }
                .boxed()
            })
            .await
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        self.slot
            .with(|stream| {
                async move {
                    let mut buf = Vec::new();
                    match stream {
                        Stream::Tcp(s) => {
                            s.read_to_end(&mut buf).await?;
                        }
                        Stream::Udp(s) => {
                            buf.resize(MAX_DATAGRAM, 0);
                            let got = s.recv(&mut buf).await?;
                            buf.truncate(got);
                        }
                    }
                    Ok(buf)
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl Writable for Conn {
    async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.slot
            .with(move |stream| {
                async move {
                    match stream {
                        Stream::Tcp(s) => s.write_all(&data).await?,
                        Stream::Udp(s) => {
                            s.send(&data).await?;
                        }
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl Closeable for Conn {
    async fn close(&self) -> Result<()> {
        if let Some(Stream::Tcp(mut s)) = self.slot.take().await {
            s.shutdown().await?;
        }
        Ok(())
    }
}

impl UserData for Conn {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        add_handle::<Self, M>(methods);
        add_reader::<Self, M>(methods);
        add_writer::<Self, M>(methods);
        add_closer::<Self, M>(methods);
    }
}

fn dialer(lua: &Lua, env: &Arc<Env>, protocol: Protocol) -> mlua::Result<mlua::Function> {
    let env = env.clone();
    function(lua, move |lua, addr: String| {
        let ctx = env.ctx.clone();
        deferred_result(lua, &env.ctx, async move {
            let stream = protocol.dial(&addr).await?;
            let slot = Slot::new(format!("{}({addr})", protocol.as_str()), stream);
            let guard = ctx.release_pool().watch(slot.clone());
            Ok(produce(Conn { slot, guard, ctx }))
        })
    })
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.set("tcp", dialer(lua, &env, Protocol::Tcp)?)?;
    module.set("udp", dialer(lua, &env, Protocol::Udp)?)?;
    register(lua, "net", module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::Harness;
    use tokio::net::TcpListener;

    async fn tcp_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr.to_string()
    }

    async fn udp_echo() -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr.to_string()
    }

    #[test]
    fn tcp_round_trip() {
        let h = Harness::new();
        let addr = h.runtime().block_on(tcp_echo());
        h.lua().globals().set("ADDR", addr.clone()).unwrap();
        h.exec(
            r#"
            local err, conn = net.tcp(ADDR)()
            assert(err == nil, err)
            assert(conn:name() == "tcp(" .. ADDR .. ")")
            assert(conn:write("ping")() == nil)
            local err, data = conn:read(4)()
            assert(err == nil, err)
            assert(data:string() == "ping")
            assert(conn:close()() == nil)
            local err = conn:read()()
            assert(err ~= nil)
            "#,
        );
        assert_eq!(h.ctx().release_pool().live(), 0);
    }

    #[test]
    fn udp_round_trip() {
        let h = Harness::new();
        let addr = h.runtime().block_on(udp_echo());
        h.lua().globals().set("ADDR", addr).unwrap();
        h.exec(
            r#"
            local err, conn = net:udp(ADDR)()
            assert(err == nil, err)
            conn:write(bytes.new("dgram"))()
            local err, data = conn:read_all()()
            assert(err == nil, err)
            assert(data:string() == "dgram")
            conn:close()()
            "#,
        );
    }

    #[test]
    fn leaked_connection_is_released() {
        let h = Harness::new();
        let addr = h.runtime().block_on(tcp_echo());
        h.lua().globals().set("ADDR", addr).unwrap();
        h.exec(r#"conn = select(2, net.tcp(ADDR)())"#);
        let report = h.vm().reset();
        assert_eq!(report.warned, 1);
        h.exec(
            r#"
            local err = conn:write("late")()
            assert(err and err:find("is closed"), err)
            "#,
        );
    }

    #[test]
    fn refused_dial_is_an_error_value() {
        let h = Harness::new();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        h.lua().globals().set("PORT", port).unwrap();
        h.exec(
            r#"
            local err, conn = net.tcp("127.0.0.1:" .. PORT)()
            assert(err ~= nil and conn == nil)
            "#,
        );
    }
}
