//! 晚绑定转发：把主进程收到的 HTTP 请求经 `getContent` 交给 Worker。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use http::{HeaderName, header::CONTENT_TYPE};
use parking_lot::RwLock;
use serde_json::Value;
use spark_router::{
    CallbackResponse, Flow, Handler, HandlerError, HttpRequest, HttpResponse, HttpRouter, RoutedRequest,
    WorkerRequest, path,
};
use spark_rpc::RpcError;
use tracing::debug;

use crate::protocol::ContentProxy;

/// 挂在 `late_bound` 路由器上的转发层。
///
/// 请求路径为挂载点之后的剩余部分，转发前拼接到 `remap` 之下；Worker 无人处理时
/// 返回 [`Flow::Next`]，链路继续向后推进。
pub struct ForwardToWorker {
    proxy: ContentProxy,
    remap: String,
}

impl ForwardToWorker {
    pub fn new(proxy: ContentProxy, remap: impl Into<String>) -> Self {
        Self {
            proxy,
            remap: remap.into(),
        }
    }
}

#[async_trait]
impl Handler<HttpRequest, HttpResponse> for ForwardToWorker {
    async fn handle(&self, req: &mut HttpRequest, res: &mut HttpResponse) -> Flow {
        let request = to_worker_request(req, &self.remap);
        debug!(target: "spark_hosting::coordinator", method = %request.method, path = %request.path, "forwarding to worker");
        match self.proxy.get_content(&request).await {
            Ok(Some(reply)) => match write_reply(res, reply) {
                Ok(()) => Flow::Done,
                Err(err) => Flow::Fail(err),
            },
            Ok(None) => Flow::Next,
            Err(err) => Flow::Fail(forward_error(&err)),
        }
    }
}

type ForwardSlot = Arc<RwLock<Arc<ForwardToWorker>>>;

/// 晚绑定转发表。
///
/// # 教案式说明
/// - **意图 (Why)**：Worker 重连后会以新连接再次 `register` 同一路径，旧连接已被关闭；
///   若每次登记都追加一层，旧转发层排在前面并持续以 502 失败；
/// - **逻辑 (How)**：每个挂载路径只在 `late_bound` 路由器上挂一层 [`SlotForward`]，
///   该层每次分发时读取槽位中的当前转发目标，重复登记只替换槽位内容；
/// - **契约 (What)**：[`register`](Self::register) 返回 `true` 表示新挂载了一层，`false` 表示替换；
///   `register` 先于 `module` 到达，登记时连接尚无模块标签，因此只以路径为键。
#[derive(Clone)]
pub struct LateBoundRoutes {
    router: HttpRouter,
    slots: Arc<DashMap<String, ForwardSlot>>,
}

impl fmt::Debug for LateBoundRoutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LateBoundRoutes")
            .field("routes", &self.routes())
            .finish()
    }
}

impl LateBoundRoutes {
    pub fn new(router: HttpRouter) -> Self {
        Self {
            router,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, mount: &str, forward: ForwardToWorker) -> bool {
        match self.slots.entry(mount.to_owned()) {
            Entry::Occupied(entry) => {
                *entry.get().write() = Arc::new(forward);
                false
            }
            Entry::Vacant(entry) => {
                let slot: ForwardSlot = Arc::new(RwLock::new(Arc::new(forward)));
                entry.insert(Arc::clone(&slot));
                self.router.use_handler(mount, SlotForward { slot });
                true
            }
        }
    }

    /// 已登记的挂载路径，按字典序排列。
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<_> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        routes.sort();
        routes
    }
}

/// 读取槽位当前目标再转发的处理层。
struct SlotForward {
    slot: ForwardSlot,
}

#[async_trait]
impl Handler<HttpRequest, HttpResponse> for SlotForward {
    async fn handle(&self, req: &mut HttpRequest, res: &mut HttpResponse) -> Flow {
        let forward = Arc::clone(&*self.slot.read());
        forward.handle(req, res).await
    }
}

/// 以 `remap` 重写路径后生成 Worker 请求。
pub fn to_worker_request(req: &HttpRequest, remap: &str) -> WorkerRequest {
    let mut request = WorkerRequest::new(req.method(), path::join(remap, req.path()));
    request.query = req.query().clone();
    request.headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect();
    request.body = decode_body(req);
    request.ip = req.ip().map(|ip| ip.to_string());
    request
}

fn decode_body(req: &HttpRequest) -> Option<Value> {
    let body = req.body();
    if body.is_empty() {
        return None;
    }
    let is_json = req
        .header(CONTENT_TYPE.as_str())
        .is_some_and(|value| value.contains("json"));
    if is_json && let Ok(value) = serde_json::from_slice(body) {
        return Some(value);
    }
    Some(Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// 把 Worker 的回复写成 HTTP 响应。
pub fn write_reply(res: &mut HttpResponse, reply: CallbackResponse) -> Result<(), HandlerError> {
    res.status(reply.status_code);
    let mut has_content_type = false;
    for (name, value) in &reply.headers {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            has_content_type |= name == CONTENT_TYPE;
            res.set_header(name, value);
        }
    }
    match reply.data {
        None | Some(Value::Null) => res.send_status(reply.status_code),
        Some(Value::String(text)) if has_content_type => res.send(Bytes::from(text)),
        Some(Value::String(text)) => res.send_text(text),
        Some(other) => res.json(&other)?,
    }
    Ok(())
}

/// RPC 失败映射为处理器错误：连接断开为 502，其余沿用 Worker 给出的状态码。
pub fn forward_error(err: &RpcError) -> HandlerError {
    if err.numeric_code() == RpcError::CONNECTION_CLOSED {
        return HandlerError::new("hosting.forward.unavailable", err.message()).with_status(502);
    }
    let status = err
        .data()
        .and_then(|data| data.get("status"))
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok())
        .unwrap_or(500);
    HandlerError::new("hosting.forward.failed", err.message()).with_status(status)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn requests_are_remapped_under_the_worker_prefix() {
        let mut req = HttpRequest::new("POST", "/hello?lang=fr")
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"ada"}"#);
        req.set_path("/hello".to_owned());
        let forwarded = to_worker_request(&req, "/api");
        assert_eq!(forwarded.method, "POST");
        assert_eq!(forwarded.path, "/api/hello");
        assert_eq!(forwarded.query.get("lang").map(String::as_str), Some("fr"));
        assert_eq!(forwarded.body, Some(json!({ "name": "ada" })));
        assert_eq!(forwarded.headers.get("content-type").map(String::as_str), Some("application/json"));
    }

    #[test]
    fn replies_become_http_responses() {
        let mut res = HttpResponse::new();
        let mut reply = CallbackResponse::new(201);
        reply.data = Some(json!({ "id": 7 }));
        write_reply(&mut res, reply).unwrap();
        assert_eq!(res.status_code().as_u16(), 201);
        assert_eq!(res.body().as_ref(), br#"{"id":7}"#);

        let mut res = HttpResponse::new();
        write_reply(&mut res, CallbackResponse::new(204)).unwrap();
        assert_eq!(res.status_code().as_u16(), 204);
        assert!(res.is_ended());
    }

    #[test]
    fn rpc_failures_keep_the_worker_status() {
        let err = RpcError::application("nope").with_data(json!({ "code": "x", "status": 403 }));
        assert_eq!(forward_error(&err).status(), 403);
        assert_eq!(forward_error(&RpcError::connection_closed()).status(), 502);
    }
}
