//! The `proto` module: protobuf codecs and unary gRPC calls driven by
//! `.proto` files compiled at run time.
//!
//! ```lua
//! local messages, services = proto.load("api.proto")
//! local err, conn = proto.dial("localhost:50051")()
//! local client = services["demo.Greeter"]:new(conn)
//! local err, reply = client:SayHello({name = "strafe"})()
//! ```
//!
//! Messages cross the boundary as JSON-shaped tables keyed by the field names
//! written in the `.proto` file.

use std::{
    collections::HashSet,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::FutureExt;
use mlua::{
    Function, Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods, UserDataRef, Value,
    Variadic,
};
use prost::Message as _;
use prost_reflect::{
    DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor, SerializeOptions,
    ServiceDescriptor,
};
use protox::{
    file::{ChainFileResolver, File, FileResolver, GoogleFileResolver},
    Compiler,
};
use serde_json::Value as Json;
use tonic::{
    client::Grpc,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
    Status,
};

use super::{
    bytes::{Bytes, BytesArg},
    deferred::{blocking, deferred_result, produce, produce_with, Produce},
    function,
    io::{add_closer, add_handle, Closeable, Handle, Slot},
    json::{from_json, to_json},
    register, to_string, Env,
};
use crate::{
    context::Context,
    error::{Error, Result},
    fs::{normalize, Filesystem},
    pool::Guard,
    stat::Stat,
};

fn from_table(desc: &MessageDescriptor, value: &Value) -> mlua::Result<DynamicMessage> {
    let json = match to_json(value)? {
        Json::Array(items) if items.is_empty() => Json::Object(Default::default()),
        json => json,
    };
    DynamicMessage::deserialize(desc.clone(), json).map_err(mlua::Error::external)
}

fn to_json_value(message: &DynamicMessage) -> Result<Json> {
    let options = SerializeOptions::new().use_proto_field_name(true);
    Ok(message.serialize_with_options(serde_json::value::Serializer, &options)?)
}

/// A message type from a loaded descriptor set.
#[derive(Clone)]
pub struct ProtoMessage(MessageDescriptor);

impl UserData for ProtoMessage {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("name", |_, this, ()| Ok(this.0.full_name().to_string()));
        methods.add_method("encode", |_, this, value: Value| {
            Ok(Bytes(from_table(&this.0, &value)?.encode_to_vec()))
        });
        methods.add_method("decode", |lua, this, data: BytesArg| {
            let message = DynamicMessage::decode(this.0.clone(), data.0.as_slice())
                .map_err(Error::from)?;
            from_json(lua, &to_json_value(&message)?)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("message({})", this.0.full_name()))
        });
    }
}

/// A service from a loaded descriptor set. `service:new(conn)` makes a client.
#[derive(Clone)]
pub struct ProtoService(ServiceDescriptor);

impl UserData for ProtoService {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("name", |_, this, ()| Ok(this.0.full_name().to_string()));
        methods.add_method("new", |_, this, conn: UserDataRef<GrpcConn>| {
            Ok(ServiceClient {
                service: this.0.clone(),
                conn: (*conn).clone(),
            })
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("service({})", this.0.full_name()))
        });
    }
}

#[derive(Clone)]
pub struct GrpcConn {
    slot: Arc<Slot<Channel>>,
    guard: Guard,
    ctx: Arc<Context>,
}

impl Handle for GrpcConn {
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
impl Closeable for GrpcConn {
    async fn close(&self) -> Result<()> {
        self.slot.take().await;
        Ok(())
    }
}

impl UserData for GrpcConn {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        add_handle::<Self, M>(methods);
        add_closer::<Self, M>(methods);
    }
}

/// Resolves `client:Method` to a function performing the unary call.
pub struct ServiceClient {
    service: ServiceDescriptor,
    conn: GrpcConn,
}

impl UserData for ServiceClient {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, name: String| {
            let method = this
                .service
                .methods()
                .find(|m| m.name() == name)
                .ok_or_else(|| {
                    mlua::Error::runtime(format!(
                        "service {} has no method {name}",
                        this.service.full_name()
                    ))
                })?;
            let conn = this.conn.clone();
            lua.create_function(move |lua, (_, request): (Value, Value)| {
                invoke(lua, &conn, &method, request)
            })
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("client({})", this.service.full_name()))
        });
    }
}

fn invoke(lua: &Lua, conn: &GrpcConn, method: &MethodDescriptor, request: Value) -> mlua::Result<Function> {
    let request = from_table(&method.input(), &request)?;
    let slot = conn.slot.clone();
    let ctx = conn.ctx.clone();
    let method = method.clone();
    deferred_result(lua, &conn.ctx, async move {
        let mut stat = Stat::new("grpc")
            .tag("service", method.parent_service().full_name())
            .tag("method", method.full_name());
        let start = Instant::now();
        let result = unary(&slot, &method, request).await;
        stat = stat.field("duration_ns", start.elapsed().as_nanos() as f64);
        stat = match &result {
            Ok(reply) => stat
                .tag("code", "Ok")
                .field("success", 1.0)
                .field("response_size", reply.encoded_len() as f64),
            Err(e) => stat.tag("code", code(e)).field("success", 0.0),
        };
        ctx.report(vec![stat]);

        let json = to_json_value(&result?)?;
        Ok(produce_with(move |lua| from_json(lua, &json)))
    })
}

fn code(err: &Error) -> String {
    match err {
        Error::Grpc(status) => format!("{:?}", status.code()),
        Error::Transport(_) | Error::Closed(_) => "Unavailable".to_string(),
        _ => "Unknown".to_string(),
    }
}

async fn unary(slot: &Slot<Channel>, method: &MethodDescriptor, request: DynamicMessage) -> Result<DynamicMessage> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    let path = PathAndQuery::try_from(path).map_err(|e| Error::Proto(e.to_string()))?;
    let codec = DynamicCodec(method.output());

    // The call runs inside the slot so closing the connection cancels it.
    slot.with(move |channel| {
        async move {
            let mut grpc = Grpc::new(channel.clone());
            grpc.ready().await?;
            let reply = grpc
                .unary(tonic::Request::new(request), path, codec)
                .await?;
            Ok::<_, Error>(reply.into_inner())
        }
        .boxed()
    })
    .await
}

/// Encodes requests as-is and decodes replies against a runtime descriptor.
struct DynamicCodec(MessageDescriptor);

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.0.clone())
    }
}

struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Self::Error> {
        item.encode(dst).map_err(|e| Status::internal(e.to_string()))
    }
}

struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.0.clone(), src)
            .map(Some)
            .map_err(|e| Status::internal(e.to_string()))
    }
}

/// Serves `.proto` imports from the VM's filesystem. File names are
/// normalized paths without the leading `/`.
struct FsResolver(Arc<dyn Filesystem>);

impl FsResolver {
    fn file_name(path: &str) -> String {
        normalize(path).trim_start_matches('/').to_string()
    }
}

impl FileResolver for FsResolver {
    fn open_file(&self, name: &str) -> std::result::Result<File, protox::Error> {
        match self.0.read(name) {
            Ok(data) => {
                let source = String::from_utf8(data).map_err(protox::Error::new)?;
                File::from_source(name, &source)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(protox::Error::file_not_found(name)),
            Err(e) => Err(protox::Error::new(e)),
        }
    }
}

/// Compiles the `.proto` sources among `paths` and decodes the rest as
/// serialized `FileDescriptorSet`s. Returns the pool with the names of the
/// files `paths` asked for; imports are in the pool but not in the list.
fn compile(fs: Arc<dyn Filesystem>, paths: &[String]) -> Result<(DescriptorPool, Vec<String>)> {
    let (sources, sets): (Vec<&String>, Vec<&String>) =
        paths.iter().partition(|path| path.ends_with(".proto"));
    let mut pool = DescriptorPool::new();
    let mut targets = Vec::new();

    if !sources.is_empty() {
        let mut resolver = ChainFileResolver::new();
        resolver.add(FsResolver(fs.clone()));
        resolver.add(GoogleFileResolver::new());
        let mut compiler = Compiler::with_file_resolver(resolver);
        compiler.include_imports(true);
        for path in sources {
            let name = FsResolver::file_name(path);
            compiler.open_file(&name)?;
            targets.push(name);
        }
        pool.add_file_descriptor_set(compiler.file_descriptor_set())?;
    }

    for path in sets {
        let known: HashSet<String> = pool.files().map(|f| f.name().to_string()).collect();
        pool.decode_file_descriptor_set(fs.read(path)?.as_slice())?;
        targets.extend(
            pool.files()
                .map(|f| f.name().to_string())
                .filter(|name| !known.contains(name)),
        );
    }
    Ok((pool, targets))
}

/// `load(path...)`: compiles `.proto` files (imports resolve against the
/// filesystem root) or reads serialized `FileDescriptorSet`s, and returns
/// `messages, services` declared at the top level of those files, keyed by
/// fully qualified name.
///
/// Loading happens during setup, so failures raise instead of coming back
/// as an error value.
fn load(lua: &Lua, env: &Env, paths: Vec<String>) -> mlua::Result<MultiValue> {
    let fs = env.fs.clone();
    let wait = deferred_result(lua, &env.ctx, async move {
        let (pool, targets) = blocking(move || compile(fs, &paths)).await?;
        Ok(Box::new(move |lua: &Lua| {
            let messages = lua.create_table()?;
            let services = lua.create_table()?;
            for file in targets.iter().filter_map(|name| pool.get_file_by_name(name)) {
                for message in file.messages() {
                    messages.set(message.full_name(), ProtoMessage(message.clone()))?;
                }
                for service in file.services() {
                    services.set(service.full_name(), ProtoService(service.clone()))?;
                }
            }
            Ok(MultiValue::from_vec(vec![
                Value::Table(messages),
                Value::Table(services),
            ]))
        }) as Produce)
    })?;

    let mut values: MultiValue = wait.call(())?;
    match values.pop_front() {
        None | Some(Value::Nil) => Ok(values),
        Some(err) => Err(mlua::Error::runtime(format!(
            "proto.load: {}",
            to_string(lua, err)?
        ))),
    }
}

/// `dial(addr, [{timeout = ms}])`. The channel connects lazily on first use.
fn dial(lua: &Lua, env: &Env, addr: String, options: Option<Table>) -> mlua::Result<Function> {
    let timeout = match options {
        Some(options) => options.get::<Option<u64>>("timeout")?,
        None => None,
    };
    let ctx = env.ctx.clone();
    deferred_result(lua, &env.ctx, async move {
        let uri = if addr.contains("://") {
            addr.clone()
        } else {
            format!("http://{addr}")
        };
        let mut endpoint = Endpoint::from_shared(uri)?;
        if let Some(ms) = timeout {
            endpoint = endpoint
                .timeout(Duration::from_millis(ms))
                .connect_timeout(Duration::from_millis(ms));
        }
        let slot = Slot::new(format!("grpc({addr})"), endpoint.connect_lazy());
        let guard = ctx.release_pool().watch(slot.clone());
        Ok(produce(GrpcConn { slot, guard, ctx }))
    })
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    let loader = env.clone();
    module.set(
        "load",
        function(lua, move |lua, paths: Variadic<String>| {
            load(lua, &loader, paths.into_iter().collect())
        })?,
    )?;
    module.set(
        "dial",
        function(lua, move |lua, (addr, options): (String, Option<Table>)| {
            dial(lua, &env, addr, options)
        })?,
    )?;
    register(lua, "proto", module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::Harness;
    use prost::Message;
    use prost_types::{
        field_descriptor_proto::{Label, Type},
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        MethodDescriptorProto, ServiceDescriptorProto,
    };

    fn field(name: &str, number: i32, ty: Type, type_name: Option<&str>) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            label: Some(Label::Optional as i32),
            r#type: Some(ty as i32),
            type_name: type_name.map(str::to_string),
            ..Default::default()
        }
    }

    /// `demo.Greeter/SayHello(HelloRequest) -> HelloReply`
    fn greeter_set() -> Vec<u8> {
        let file = FileDescriptorProto {
            name: Some("greeter.proto".to_string()),
            package: Some("demo".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("HelloRequest".to_string()),
                    field: vec![
                        field("user_name", 1, Type::String, None),
                        field("count", 2, Type::Int32, None),
                    ],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("HelloReply".to_string()),
                    field: vec![
                        field("message", 1, Type::String, None),
                        field("echo", 2, Type::Message, Some(".demo.HelloRequest")),
                    ],
                    ..Default::default()
                },
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("Greeter".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("SayHello".to_string()),
                    input_type: Some(".demo.HelloRequest".to_string()),
                    output_type: Some(".demo.HelloReply".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        FileDescriptorSet { file: vec![file] }.encode_to_vec()
    }

    const COMMON: &str = r#"
        syntax = "proto3";
        package common;

        message Meta {
            string trace_id = 1;
        }
    "#;

    const ORDERS: &str = r#"
        syntax = "proto3";
        package shop;

        import "protos/common.proto";
        import "google/protobuf/timestamp.proto";

        message Order {
            message Line {
                string sku = 1;
                int32 qty = 2;
            }
            string id = 1;
            repeated Line lines = 2;
            common.Meta meta = 3;
            google.protobuf.Timestamp placed_at = 4;
        }

        service Orders {
            rpc Place(Order) returns (Order);
        }
    "#;

    fn harness() -> Harness {
        let h = Harness::new();
        h.fs().write("/greeter.pb", &greeter_set()).unwrap();
        h.fs().write("/protos/common.proto", COMMON.as_bytes()).unwrap();
        h.fs().write("/protos/orders.proto", ORDERS.as_bytes()).unwrap();
        h
    }

    #[test]
    fn load_compiles_proto_sources() {
        let h = harness();
        h.exec(
            r#"
            local messages, services = proto.load("protos/orders.proto")
            local order = messages["shop.Order"]
            assert(order:name() == "shop.Order")
            assert(services["shop.Orders"]:name() == "shop.Orders")

            -- only top-level declarations of the requested files
            assert(messages["common.Meta"] == nil)
            assert(messages["shop.Order.Line"] == nil)

            local data = order:encode({
                id = "o-1",
                lines = {{sku = "a", qty = 2}, {sku = "b", qty = 1}},
                meta = {trace_id = "t1"},
            })
            local back = order:decode(data)
            assert(back.id == "o-1")
            assert(#back.lines == 2)
            assert(back.lines[1].sku == "a" and back.lines[1].qty == 2)
            assert(back.meta.trace_id == "t1")
            "#,
        );
    }

    #[test]
    fn load_mixes_sources_and_descriptor_sets() {
        let h = harness();
        h.exec(
            r#"
            local messages, services = proto.load("/protos/common.proto", "/greeter.pb")
            assert(messages["common.Meta"] ~= nil)
            assert(messages["demo.HelloRequest"] ~= nil)
            assert(services["demo.Greeter"] ~= nil)
            "#,
        );
    }

    #[test]
    fn broken_source_raises() {
        let h = harness();
        h.fs()
            .write("/bad.proto", b"syntax = \"proto3\"; message {")
            .unwrap();
        let err = h.try_exec(r#"proto.load("bad.proto")"#).unwrap_err();
        assert!(err.to_string().contains("proto.load"), "{err}");
        let err = h.try_exec(r#"proto.load("missing.proto")"#).unwrap_err();
        assert!(err.to_string().contains("proto.load"), "{err}");
    }

    #[test]
    fn load_lists_messages_and_services() {
        let h = harness();
        h.exec(
            r#"
            local messages, services = proto.load("/greeter.pb")
            assert(messages["demo.HelloRequest"]:name() == "demo.HelloRequest")
            assert(messages["demo.HelloReply"] ~= nil)
            assert(services["demo.Greeter"]:name() == "demo.Greeter")
            assert(tostring(services["demo.Greeter"]) == "service(demo.Greeter)")
            "#,
        );
    }

    #[test]
    fn missing_descriptor_raises() {
        let h = harness();
        let err = h.try_exec(r#"proto.load("/nope.pb")"#).unwrap_err();
        assert!(err.to_string().contains("proto.load"), "{err}");
    }

    #[test]
    fn message_encode_decode() {
        let h = harness();
        h.exec(
            r#"
            local messages = proto:load("/greeter.pb")
            local reply = messages["demo.HelloReply"]
            local data = reply:encode({message = "hi", echo = {user_name = "bob", count = 3}})
            assert(data:size() > 0)
            local back = reply:decode(data)
            assert(back.message == "hi")
            assert(back.echo.user_name == "bob")
            assert(back.echo.count == 3)

            local empty = messages["demo.HelloRequest"]:encode({})
            assert(empty:size() == 0)
            "#,
        );
    }

    #[test]
    fn bytes_match_prost_encoding() {
        let h = harness();
        let hex: String = h.eval(
            r#"
            local messages = proto.load("/greeter.pb")
            return messages["demo.HelloRequest"]:encode({user_name = "a", count = 1}):string("hex")
            "#,
        );
        assert_eq!(hex, "0a01611001");
    }

    #[test]
    fn unknown_field_raises() {
        let h = harness();
        assert!(h
            .try_exec(
                r#"
                local messages = proto.load("/greeter.pb")
                messages["demo.HelloRequest"]:encode({nope = 1})
                "#,
            )
            .is_err());
    }

    #[test]
    fn failed_call_reports_stat() {
        let h = harness();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        h.lua().globals().set("PORT", port).unwrap();
        h.exec(
            r#"
            local _, services = proto.load("/greeter.pb")
            local err, conn = proto.dial("127.0.0.1:" .. PORT, {timeout = 500})()
            assert(err == nil, err)
            assert(conn:name() == "grpc(127.0.0.1:" .. PORT .. ")")

            local client = services["demo.Greeter"]:new(conn)
            local err, reply = client:SayHello({user_name = "x"})()
            assert(err ~= nil and reply == nil)
            assert(not pcall(function() return client.Missing end))
            assert(conn:close()() == nil)
            "#,
        );
        let stats = h.reporter().stats_named("grpc");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].tags["service"], "demo.Greeter");
        assert_eq!(stats[0].tags["method"], "demo.Greeter.SayHello");
        assert_ne!(stats[0].tags["code"], "Ok");
        assert_eq!(stats[0].fields["success"], 0.0);
        assert_eq!(h.ctx().release_pool().live(), 0);
    }

    #[test]
    fn close_cancels_call_in_flight() {
        let h = harness();
        // Accepts connections through the backlog but never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        h.lua().globals().set("PORT", port).unwrap();
        h.exec(
            r#"
            local _, services = proto.load("/greeter.pb")
            local _, conn = proto.dial("127.0.0.1:" .. PORT)()
            local client = services["demo.Greeter"]:new(conn)
            local call = client:SayHello({user_name = "x"})
            sleep(50)()
            assert(conn:close()() == nil)
            local err, reply = call()
            assert(reply == nil)
            assert(tostring(err):find("is closed"), tostring(err))
            "#,
        );
        let stats = h.reporter().stats_named("grpc");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].tags["code"], "Unavailable");
        drop(silent);
    }
}
