//! Worker 侧的回调式路由器。
//!
//! 请求不来自套接字，而是来自主进程经 RPC 转发的 [`WorkerRequest`]；
//! 处理器通过 [`WorkerResponse`] 写出 `(status, data)` 或 `(meta, data)` 形式的回复，
//! 分发结束后作为 [`CallbackResponse`] 交还调用方。

use std::{collections::BTreeMap, fmt, ops::Deref, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{HandlerError, codes},
    exchange::{AllowList, RoutedRequest, RoutedResponse},
    layer::{self, Flow, HandlerFn},
    path::Params,
    router::{Dispatch, Router},
};

/// 经 RPC 转发到 Worker 的请求。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip)]
    pub params: Params,
}

impl WorkerRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }
}

impl RoutedRequest for WorkerRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn set_path(&mut self, path: String) {
        self.path = path;
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn params(&self) -> &Params {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }
}

/// Worker 回复的完整形态，即 `(meta, data)` 中的两部分合并后的结构。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CallbackResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            headers: BTreeMap::new(),
            status_code,
            status_message: None,
            data: None,
        }
    }
}

/// 处理器手中的回复句柄，只接受第一次回复。
#[derive(Debug, Default)]
pub struct WorkerResponse {
    reply: Option<CallbackResponse>,
}

impl WorkerResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sent(&self) -> bool {
        self.reply.is_some()
    }

    /// 仅以状态码回复。
    pub fn send_status(&mut self, status: u16) {
        self.reply(CallbackResponse::new(status));
    }

    /// 以 200 与数据回复。
    pub fn send(&mut self, data: Value) {
        self.send_with_status(200, data);
    }

    pub fn send_with_status(&mut self, status: u16, data: Value) {
        let mut reply = CallbackResponse::new(status);
        reply.data = Some(data);
        self.reply(reply);
    }

    /// 以完整的元信息对象回复，`data` 覆盖 `meta.data`。
    pub fn send_meta(&mut self, mut meta: CallbackResponse, data: Option<Value>) {
        if data.is_some() {
            meta.data = data;
        }
        self.reply(meta);
    }

    pub fn redirect(&mut self, location: &str) {
        let mut reply = CallbackResponse::new(302);
        reply
            .headers
            .insert("Location".to_owned(), location.to_owned());
        self.reply(reply);
    }

    pub fn into_reply(self) -> Option<CallbackResponse> {
        self.reply
    }

    fn reply(&mut self, reply: CallbackResponse) {
        if self.reply.is_some() {
            warn!(target: "spark_router", status = reply.status_code, "worker response already sent, reply ignored");
            return;
        }
        self.reply = Some(reply);
    }
}

impl RoutedResponse for WorkerResponse {
    fn send_allow(&mut self, allow: &AllowList) -> Result<(), HandlerError> {
        let methods = allow.header_value();
        let mut reply = CallbackResponse::new(200);
        reply.headers.insert("Allow".to_owned(), methods.clone());
        reply
            .headers
            .insert("Content-Length".to_owned(), methods.len().to_string());
        reply
            .headers
            .insert("Content-Type".to_owned(), "text/plain".to_owned());
        reply
            .headers
            .insert("X-Content-Type-Options".to_owned(), "nosniff".to_owned());
        reply.data = Some(Value::String(methods));
        self.reply(reply);
        Ok(())
    }
}

/// 以闭包构造 Worker 处理器。
pub fn handler_fn<F>(f: F) -> HandlerFn<F, WorkerRequest, WorkerResponse>
where
    F: for<'a> Fn(&'a mut WorkerRequest, &'a mut WorkerResponse) -> BoxFuture<'a, Flow>
        + Send
        + Sync
        + 'static,
{
    layer::handler_fn(f)
}

/// 死路回调：无处理器终止链路时调用。
pub type Deadend = Arc<dyn Fn(&WorkerRequest) + Send + Sync + 'static>;

/// 回调式传输上的路由器。
///
/// # 契约 (What)
/// - 分发语义与 [`HttpRouter`](crate::HttpRouter) 完全一致；
/// - 死路行为由调用方通过 [`with_deadend`](Self::with_deadend) 提供，缺省仅记录日志；
/// - 未被错误层消化的错误以 `Err` 交还，对应回复的错误槽。
#[derive(Clone)]
pub struct WorkerRouter {
    inner: Arc<Router<WorkerRequest, WorkerResponse>>,
    deadend: Deadend,
}

impl Default for WorkerRouter {
    fn default() -> Self {
        Self {
            inner: Arc::new(Router::new()),
            deadend: Arc::new(|req: &WorkerRequest| {
                debug!(target: "spark_router", method = %req.method, path = %req.path, "worker request reached deadend");
            }),
        }
    }
}

impl fmt::Debug for WorkerRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerRouter").field(&self.inner).finish()
    }
}

impl Deref for WorkerRouter {
    type Target = Router<WorkerRequest, WorkerResponse>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl WorkerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadend(mut self, deadend: impl Fn(&WorkerRequest) + Send + Sync + 'static) -> Self {
        self.deadend = Arc::new(deadend);
        self
    }

    pub fn router(&self) -> Arc<Router<WorkerRequest, WorkerResponse>> {
        Arc::clone(&self.inner)
    }

    /// 分发请求并返回处理器写出的回复；死路时回复为 `None`。
    pub async fn handle(&self, mut req: WorkerRequest) -> Result<Option<CallbackResponse>, HandlerError> {
        let mut res = WorkerResponse::new();
        let outcome = AssertUnwindSafe(self.inner.dispatch(&mut req, &mut res))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Dispatch::Handled) => Ok(res.into_reply()),
            Ok(Dispatch::Unhandled) => {
                if !res.is_sent() {
                    (self.deadend)(&req);
                }
                Ok(res.into_reply())
            }
            Ok(Dispatch::Failed(err)) => Err(err),
            Err(_) => Err(HandlerError::new(
                codes::HANDLER_PANICKED,
                "worker handler panicked",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn callback_reply_carries_status_and_data() {
        let router = WorkerRouter::new();
        router.get(
            "/api/items/:id",
            handler_fn(|req, res| {
                Box::pin(async move {
                    let id = req.params().get("id").cloned().unwrap_or_default();
                    res.send_with_status(201, serde_json::json!({ "id": id }));
                    Flow::Done
                })
            }),
        );
        let reply = router
            .handle(WorkerRequest::new("get", "/api/items/7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.status_code, 201);
        assert_eq!(reply.data, Some(serde_json::json!({ "id": "7" })));
    }

    #[tokio::test]
    async fn second_reply_is_ignored() {
        let mut res = WorkerResponse::new();
        res.send_status(204);
        res.send(Value::Null);
        assert_eq!(res.into_reply().unwrap().status_code, 204);
    }

    #[tokio::test]
    async fn deadend_runs_once_and_error_reaches_error_slot() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = WorkerRouter::new().with_deadend(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.post(
            "/fail",
            handler_fn(|_req, _res| {
                Box::pin(async move { Flow::Fail(HandlerError::msg("broken")) })
            }),
        );

        let reply = router.handle(WorkerRequest::new("GET", "/nothing")).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = router
            .handle(WorkerRequest::new("POST", "/fail"))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "broken");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_response_uses_camel_case() {
        let mut reply = CallbackResponse::new(404);
        reply.status_message = Some("Not Found".into());
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["statusCode"], 404);
        assert_eq!(json["statusMessage"], "Not Found");
    }
}
