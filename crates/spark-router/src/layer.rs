//! 单个候选处理器（Layer）与中间件链的推进协议。

use std::{fmt, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    error::HandlerError,
    exchange::{RoutedRequest, RoutedResponse},
    method,
};

/// 处理器对中间件链的裁决。
///
/// # 教案式说明
/// - **意图 (Why)**：以显式返回值取代回调嵌套式的 `next()`，分发循环按裁决推进游标；
/// - **契约 (What)**：
///   - `Done`：已产出响应，链路终止；
///   - `Next`：交给下一个普通层；
///   - `Fail`：携带错误跳到最近的错误处理层，后续普通层全部跳过。
#[derive(Debug)]
pub enum Flow {
    Done,
    Next,
    Fail(HandlerError),
}

/// 普通处理器。
#[async_trait]
pub trait Handler<Req, Res>: Send + Sync + 'static
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    async fn handle(&self, req: &mut Req, res: &mut Res) -> Flow;
}

/// 错误处理器：仅在链路上存在待处理错误时被调用。
///
/// 返回 `Next` 表示错误已被消化，分发恢复到普通层；返回 `Fail` 则继续向后传播。
#[async_trait]
pub trait ErrorHandler<Req, Res>: Send + Sync + 'static
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    async fn handle_error(&self, error: HandlerError, req: &mut Req, res: &mut Res) -> Flow;
}

/// 以闭包实现 [`Handler`]。
///
/// 闭包签名为 `for<'a> Fn(&'a mut Req, &'a mut Res) -> BoxFuture<'a, Flow>`，
/// 通常写作 `|req, res| Box::pin(async move { ... })`。
pub struct HandlerFn<F, Req, Res> {
    f: F,
    _marker: PhantomData<fn(Req, Res)>,
}

pub fn handler_fn<Req, Res, F>(f: F) -> HandlerFn<F, Req, Res>
where
    F: for<'a> Fn(&'a mut Req, &'a mut Res) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
{
    HandlerFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<Req, Res, F> Handler<Req, Res> for HandlerFn<F, Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: for<'a> Fn(&'a mut Req, &'a mut Res) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
{
    async fn handle(&self, req: &mut Req, res: &mut Res) -> Flow {
        (self.f)(req, res).await
    }
}

/// 以闭包实现 [`ErrorHandler`]。
pub struct ErrorHandlerFn<F, Req, Res> {
    f: F,
    _marker: PhantomData<fn(Req, Res)>,
}

pub fn error_handler_fn<Req, Res, F>(f: F) -> ErrorHandlerFn<F, Req, Res>
where
    F: for<'a> Fn(HandlerError, &'a mut Req, &'a mut Res) -> BoxFuture<'a, Flow>
        + Send
        + Sync
        + 'static,
{
    ErrorHandlerFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<Req, Res, F> ErrorHandler<Req, Res> for ErrorHandlerFn<F, Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: for<'a> Fn(HandlerError, &'a mut Req, &'a mut Res) -> BoxFuture<'a, Flow>
        + Send
        + Sync
        + 'static,
{
    async fn handle_error(&self, error: HandlerError, req: &mut Req, res: &mut Res) -> Flow {
        (self.f)(error, req, res).await
    }
}

/// 适用性谓词：在路径与方法之外进一步判断请求是否命中。
pub type Predicate<Req> = Arc<dyn Fn(&Req) -> bool + Send + Sync + 'static>;

pub(crate) enum LayerKind<Req, Res> {
    Handler(Arc<dyn Handler<Req, Res>>),
    Error(Arc<dyn ErrorHandler<Req, Res>>),
}

impl<Req, Res> Clone for LayerKind<Req, Res> {
    fn clone(&self) -> Self {
        match self {
            LayerKind::Handler(handler) => LayerKind::Handler(Arc::clone(handler)),
            LayerKind::Error(handler) => LayerKind::Error(Arc::clone(handler)),
        }
    }
}

/// 绑定到某条路径的一个候选处理器。
///
/// # 契约 (What)
/// - `method`：`None` 表示接受任意方法（`all` 与 `use`），否则为大写规范名；
/// - `predicate`：额外的适用性判断，升级层借此校验 `Connection`/`Upgrade` 头；
/// - 一个 Layer 只属于一条 Route 或一个挂载点。
pub struct Layer<Req, Res> {
    method: Option<&'static str>,
    predicate: Option<Predicate<Req>>,
    pub(crate) kind: LayerKind<Req, Res>,
}

impl<Req, Res> Clone for Layer<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            method: self.method,
            predicate: self.predicate.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl<Req, Res> fmt::Debug for Layer<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("method", &self.method)
            .field("guarded", &self.predicate.is_some())
            .field(
                "kind",
                &match self.kind {
                    LayerKind::Handler(_) => "handler",
                    LayerKind::Error(_) => "error",
                },
            )
            .finish()
    }
}

impl<Req, Res> Layer<Req, Res>
where
    Req: RoutedRequest,
    Res: RoutedResponse,
{
    pub(crate) fn handler(method: Option<&'static str>, handler: Arc<dyn Handler<Req, Res>>) -> Self {
        Self {
            method,
            predicate: None,
            kind: LayerKind::Handler(handler),
        }
    }

    pub(crate) fn error(handler: Arc<dyn ErrorHandler<Req, Res>>) -> Self {
        Self {
            method: None,
            predicate: None,
            kind: LayerKind::Error(handler),
        }
    }

    pub(crate) fn guarded(mut self, predicate: Predicate<Req>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn method(&self) -> Option<&'static str> {
        self.method
    }

    /// 判断该层是否适用于 `effective_method` 指定的方法与当前请求。
    pub(crate) fn applies(&self, effective_method: &str, req: &Req) -> bool {
        let method_ok = self
            .method
            .is_none_or(|expected| method::is(effective_method, expected));
        method_ok && self.predicate.as_ref().is_none_or(|predicate| predicate(req))
    }
}
