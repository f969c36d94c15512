//! The `http` module: one function per request method.

use std::{sync::Arc, time::Instant};

use mlua::{IntoLua, Lua, MultiValue, Table, Value};
use reqwest::Method;

use super::{
    bytes::{Bytes, BytesArg},
    deferred::{deferred_result, Produce},
    function, register, to_string, Env,
};
use crate::stat::Stat;

const METHODS: [Method; 8] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
];

struct Request {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl Request {
    fn parse(lua: &Lua, method: Method, url: String, options: Option<Table>) -> mlua::Result<Self> {
        let mut request = Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        };
        let Some(options) = options else {
            return Ok(request);
        };
        if let Some(headers) = options.get::<Option<Table>>("headers")? {
            for entry in headers.pairs::<Value, Value>() {
                let (k, v) = entry?;
                request.headers.push((to_string(lua, k)?, to_string(lua, v)?));
            }
        }
        request.body = options.get::<Option<BytesArg>>("body")?.map(|b| b.0);
        Ok(request)
    }
}

struct Response {
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    status: u16,
}

async fn send(client: &reqwest::Client, request: Request, stat: &mut Stat) -> crate::Result<Response> {
    let mut builder = client.request(request.method, &request.url);
    for (k, v) in request.headers {
        builder = builder.header(k, v);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    let response = builder.send().await?;
    let status = response.status().as_u16();
    stat.tags.insert("status".to_string(), status.to_string());
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response.bytes().await?.to_vec();
    Ok(Response {
        body,
        headers,
        status,
    })
}

pub fn open(lua: &Lua, env: Arc<Env>) -> mlua::Result<()> {
    let module = lua.create_table()?;
    for method in METHODS {
        let env = env.clone();
        let name = method.as_str().to_lowercase();
        let call = function(lua, move |lua, (url, options): (String, Option<Table>)| {
            let request = Request::parse(lua, method.clone(), url, options)?;
            let client = env.http.clone();
            let ctx = env.ctx.clone();
            deferred_result(lua, &env.ctx, async move {
                let mut stat = Stat::new("http")
                    .tag("url", request.url.as_str())
                    .tag("method", request.method.as_str());
                let start = Instant::now();
                let result = send(&client, request, &mut stat).await;
                stat = stat.field("duration_ns", start.elapsed().as_nanos() as f64);
                stat = match &result {
                    Ok(response) => stat
                        .field("success", 1.0)
                        .field("response_size", response.body.len() as f64),
                    Err(_) => stat.field("success", 0.0),
                };
                ctx.report(vec![stat]);

                let response = result?;
                Ok(Box::new(move |lua: &Lua| {
                    let headers = lua.create_table()?;
                    for (k, v) in response.headers {
                        headers.set(k, v)?;
                    }
                    Ok(MultiValue::from_vec(vec![
                        Bytes(response.body).into_lua(lua)?,
                        Value::Table(headers),
                        Value::Integer(response.status.into()),
                    ]))
                }) as Produce)
            })
        })?;
        module.set(name, call)?;
    }
    register(lua, "http", module)
}
