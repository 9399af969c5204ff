//! # http 模块说明
//!
//! ## 角色定位（Why）
//! - 把传输无关的 [`Router`] 绑定到真实的 hyper HTTP/1 连接上；
//! - 统一入站请求的规范化（路径、查询串、客户端 IP、协议升级）与出站响应的辅助语义
//!   （`status`/`send_status`/`json`）。
//!
//! ## 交互契约（What）
//! - 带 `Connection: upgrade` 与 `Upgrade` 头的请求以伪方法 `upgrade` 重新进入同一套分发；
//! - 无人处理返回 404；未被错误层消化的错误记录日志后返回 500 与 JSON 错误体；
//! - 处理器 panic 同样收敛为 500，不会拖垮连接任务。
//!
//! ## 实现策略（How）
//! - 每个连接一个任务，`http1::Builder::serve_connection(..).with_upgrades()`；
//! - 接入循环监听 [`CancellationToken`]，取消后停止接受新连接。

use std::{
    collections::BTreeMap,
    convert::Infallible,
    io,
    net::{IpAddr, SocketAddr},
    ops::Deref,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode,
    header::{self, CONTENT_LENGTH, CONTENT_TYPE},
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Body, server::conn::http1, service::service_fn, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{HandlerError, codes},
    exchange::{AllowList, RoutedRequest, RoutedResponse},
    layer::{self, ErrorHandlerFn, Flow, HandlerFn},
    method,
    path::Params,
    router::{Dispatch, Router},
};

/// 规范化后的入站 HTTP 请求。
pub struct HttpRequest {
    method: String,
    path: String,
    query: BTreeMap<String, String>,
    headers: HeaderMap,
    ip: Option<IpAddr>,
    params: Params,
    body: Bytes,
    upgrade: Option<OnUpgrade>,
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("ip", &self.ip)
            .field("params", &self.params)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl HttpRequest {
    /// 以方法与请求目标（路径 + 可选查询串）构造请求。
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.into(),
            path,
            query,
            headers: HeaderMap::new(),
            ip: None,
            params: Params::new(),
            body: Bytes::new(),
            upgrade: None,
        }
    }

    /// 从 hyper 请求规范化而来，读取完整请求体。
    pub async fn from_hyper<B>(mut req: Request<B>, remote: Option<SocketAddr>) -> Result<Self, HandlerError>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let upgrading = wants_upgrade(req.headers());
        let upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| HandlerError::from_source(codes::BODY_UNREADABLE, err).with_status(400))?
            .to_bytes();

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let method = if upgrading {
            "upgrade".to_owned()
        } else {
            parts.method.as_str().to_owned()
        };
        let mut request = Self::new(method, target);
        request.ip = client_ip(&parts.headers, remote);
        request.headers = parts.headers;
        request.body = body;
        request.upgrade = upgrade;
        Ok(request)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// 请求方法是否为给定的规范动词。
    pub fn is_method(&self, canonical: &str) -> bool {
        method::is(&self.method, canonical)
    }

    /// 取走协议升级句柄；仅升级请求且只能取一次。
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }
}

impl RoutedRequest for HttpRequest {
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
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn params(&self) -> &Params {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }
}

/// 处理器写入的响应。
///
/// `ended` 标记响应已被某个处理器完整写出，传输层据此避免重复应答。
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    ended: bool,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            ended: false,
        }
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置状态码，非法值回落为 500。
    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) -> &mut Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!(target: "spark_router", header = %name, "invalid header value dropped"),
        }
        self
    }

    /// 以状态码及其标准原因短语作为正文结束响应。
    pub fn send_status(&mut self, status: u16) {
        self.status(status);
        let reason = self.status.canonical_reason().unwrap_or("").to_owned();
        self.send_text(reason);
    }

    pub fn send_text(&mut self, body: impl Into<String>) {
        self.set_header(CONTENT_TYPE, "text/plain; charset=utf-8");
        self.send(Bytes::from(body.into()));
    }

    pub fn send(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.set_header(CONTENT_LENGTH, &body.len().to_string());
        self.body = body;
        self.ended = true;
    }

    /// 序列化为 JSON 正文结束响应。
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), HandlerError> {
        let body = serde_json::to_vec(value)
            .map_err(|err| HandlerError::from_source(codes::RESPONSE_ENCODE, err))?;
        self.set_header(CONTENT_TYPE, "application/json");
        self.send(body);
        Ok(())
    }

    /// 写出 101 握手响应，连接随后移交给升级处理逻辑。
    pub fn switching_protocols(&mut self, tag: &str) {
        self.status = StatusCode::SWITCHING_PROTOCOLS;
        self.set_header(header::CONNECTION, "upgrade");
        self.set_header(header::UPGRADE, tag);
        self.body = Bytes::new();
        self.ended = true;
    }

    /// 以 JSON 错误体写出错误，状态码取自 `error.status()`。
    ///
    /// 顶层兜底对未被错误层接手的错误总是先改写为 500 再调用本方法。
    pub fn fail(&mut self, error: &HandlerError) {
        self.status(error.status());
        let body = error.to_json().to_string();
        self.set_header(CONTENT_TYPE, "application/json");
        self.send(body);
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl RoutedResponse for HttpResponse {
    fn send_allow(&mut self, allow: &AllowList) -> Result<(), HandlerError> {
        let methods = allow.header_value();
        self.status = StatusCode::OK;
        self.set_header(header::ALLOW, &methods);
        self.set_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
        self.set_header(CONTENT_TYPE, "text/plain");
        self.send(Bytes::from(methods));
        Ok(())
    }
}

/// 以闭包构造 HTTP 处理器，闭包写作 `|req, res| Box::pin(async move { ... })`。
pub fn handler_fn<F>(f: F) -> HandlerFn<F, HttpRequest, HttpResponse>
where
    F: for<'a> Fn(&'a mut HttpRequest, &'a mut HttpResponse) -> BoxFuture<'a, Flow>
        + Send
        + Sync
        + 'static,
{
    layer::handler_fn(f)
}

/// 以闭包构造 HTTP 错误处理器。
pub fn error_handler_fn<F>(f: F) -> ErrorHandlerFn<F, HttpRequest, HttpResponse>
where
    F: for<'a> Fn(HandlerError, &'a mut HttpRequest, &'a mut HttpResponse) -> BoxFuture<'a, Flow>
        + Send
        + Sync
        + 'static,
{
    layer::error_handler_fn(f)
}

/// 绑定到真实监听套接字的路由器。
///
/// # 教案级注释
/// - **意图 (Why)**：主进程的公共入口与管理入口都需要“路由器 + 监听器”的组合；
/// - **关键逻辑 (How)**：`Deref` 到内部 [`Router`]，注册 API 完全复用；
///   [`respond`](Self::respond) 在分发结果之上补齐 404/500 的终端语义；
/// - **契约 (What)**：克隆共享同一张路由表，可在监听开始后继续注册（例如晚绑定的转发规则）。
#[derive(Clone, Default)]
pub struct HttpRouter {
    inner: Arc<Router<HttpRequest, HttpResponse>>,
}

impl std::fmt::Debug for HttpRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HttpRouter").field(&self.inner).finish()
    }
}

impl Deref for HttpRouter {
    type Target = Router<HttpRequest, HttpResponse>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl HttpRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 共享的内部路由器，用于挂载到父路由器。
    pub fn router(&self) -> Arc<Router<HttpRequest, HttpResponse>> {
        Arc::clone(&self.inner)
    }

    /// 分发一个已规范化的请求，并补齐终端语义。
    pub async fn respond(&self, mut req: HttpRequest) -> HttpResponse {
        let mut res = HttpResponse::new();
        let outcome = AssertUnwindSafe(self.inner.dispatch(&mut req, &mut res))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Dispatch::Handled) => {}
            Ok(Dispatch::Unhandled) => {
                if !res.is_ended() {
                    debug!(target: "spark_router", method = %req.method, path = %req.path, "no route matched");
                    res.send_status(404);
                }
            }
            Ok(Dispatch::Failed(err)) => {
                error!(target: "spark_router", code = err.code(), status = err.status(), error = %err, path = %req.path, "unhandled dispatch error");
                res.fail(&err.with_status(500));
            }
            Err(_) => {
                let err = HandlerError::new(codes::HANDLER_PANICKED, "request handler panicked");
                error!(target: "spark_router", path = %req.path, "request handler panicked");
                res.fail(&err);
            }
        }
        res
    }

    /// 处理 hyper 请求，供连接服务函数调用。
    pub async fn handle<B>(&self, req: Request<B>, remote: Option<SocketAddr>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        match HttpRequest::from_hyper(req, remote).await {
            Ok(request) => self.respond(request).await.into_hyper(),
            Err(err) => {
                warn!(target: "spark_router", error = %err, "request body unreadable");
                let mut res = HttpResponse::new();
                res.fail(&err);
                res.into_hyper()
            }
        }
    }

    /// 在 `listener` 上接受连接，直到 `shutdown` 被取消。
    pub async fn attach_to(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let router = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(router.handle(req, Some(remote)).await) }
                });
                let conn = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades();
                let mut conn = std::pin::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };
                if let Err(err) = result {
                    debug!(target: "spark_router", %remote, error = %err, "connection closed with error");
                }
            });
        }
    }
}

fn split_target(target: &str) -> (String, BTreeMap<String, String>) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let path = if path.is_empty() { "/" } else { path };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    (path.to_owned(), query)
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection && headers.contains_key(header::UPGRADE)
}

fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| remote.map(|addr| addr.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_split_into_path_and_query() {
        let req = HttpRequest::new("GET", "/a/b?x=1&y=two%20words");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query().get("x").map(String::as_str), Some("1"));
        assert_eq!(req.query().get("y").map(String::as_str), Some("two words"));
    }

    #[test]
    fn forwarded_ip_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 10.0.0.1"));
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "10.0.0.7".parse().ok());
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), Some(peer.ip()));
    }

    #[tokio::test]
    async fn unmatched_request_is_404() {
        let router = HttpRouter::new();
        let res = router.respond(HttpRequest::new("GET", "/missing")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    }

    fn explode() -> Flow {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handler_becomes_500() {
        let router = HttpRouter::new();
        router.get(
            "/boom",
            handler_fn(|_req, _res| Box::pin(async move { explode() })),
        );
        let res = router.respond(HttpRequest::new("GET", "/boom")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["code"], codes::HANDLER_PANICKED);
    }

    #[tokio::test]
    async fn unhandled_error_is_json_500() {
        let router = HttpRouter::new();
        router.get(
            "/fail",
            handler_fn(|_req, _res| {
                Box::pin(async move { Flow::Fail(HandlerError::msg("nope")) })
            }),
        );
        let res = router.respond(HttpRequest::new("GET", "/fail")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["message"], "nope");
    }
}
