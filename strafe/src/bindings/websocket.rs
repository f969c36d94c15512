//! The `websocket` module.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use mlua::{Lua, UserData, UserDataMethods};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::{
    bytes::Bytes,
    deferred::{deferred_result, produce},
    function,
    io::{add_closer, add_handle, add_writer, eof, Closeable, Handle, Slot, Writable},
    register, Env,
};
use crate::{context::Context, error::Result, pool::Guard};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct WebSocket {
    slot: Arc<Slot<Socket>>,
    guard: Guard,
    ctx: Arc<Context>,
}

impl WebSocket {
    /// Next data message. Control frames are skipped.
    async fn next_message(&self) -> Result<Vec<u8>> {
        self.slot
            .with(|ws| {
                async move {
                    while let Some(message) = ws.next().await {
                        match message? {
                            Message::Text(text) => return Ok(text.into_bytes()),
                            Message::Binary(data) => return Ok(data),
                            Message::Close(_) => break,
                            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                        }
                    }
                    Err(eof())
                }
                .boxed()
            })
            .await
    }
}

impl Handle for WebSocket {
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
impl Writable for WebSocket {
    /// Sends a text frame when `data` is valid UTF-8 and a binary frame otherwise.
    async fn write(&self, data: Vec<u8>) -> Result<()> {
        let message = match String::from_utf8(data) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.slot
            .with(move |ws| async move { Ok(ws.send(message).await?) }.boxed())
            .await
    }
}

#[async_trait]
impl Closeable for WebSocket {
    async fn close(&self) -> Result<()> {
        let Some(mut ws) = self.slot.take().await else {
            return Ok(());
        };
        match ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl UserData for WebSocket {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        add_handle::<Self, M>(methods);
        add_writer::<Self, M>(methods);
        add_closer::<Self, M>(methods);
        methods.add_method("read", |lua, this, ()| {
            let ws = this.clone();
            deferred_result(lua, this.context(), async move {
                Ok(produce(Bytes(ws.next_message().await?)))
            })
        });
    }
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.set(
        "open",
        function(lua, move |lua, url: String| {
            let ctx = env.ctx.clone();
            deferred_result(lua, &env.ctx, async move {
                let (ws, _) = connect_async(url.as_str()).await?;
                let slot = Slot::new(format!("websocket({url})"), ws);
                let guard = ctx.release_pool().watch(slot.clone());
                Ok(produce(WebSocket { slot, guard, ctx }))
            })
        })?,
    )?;
    register(lua, "websocket", module)
}
