//! # spark-router
//!
//! ## 角色定位（Why）
//! - 为模块宿主提供一套同时服务于真实 HTTP 套接字与 Worker 内部回调的路由引擎；
//! - 把“路径 + 方法 + 适用性谓词”的匹配与中间件链推进收敛到传输无关的 [`Router`] 中，
//!   传输差异只体现在 [`RoutedRequest`]/[`RoutedResponse`] 的两份实现上。
//!
//! ## 结构速览（What）
//! - [`Layer`]：绑定路径、方法与谓词的单个候选处理器；
//! - [`Route`]：同一路径上的全部 Layer 与已注册方法集合；
//! - [`Router`]：按注册顺序排列的 Route 与挂载点，负责分发、OPTIONS 自动应答与协议升级匹配；
//! - [`HttpRouter`]：绑定 hyper 监听器，补齐 404/500 终端语义；
//! - [`WorkerRouter`]：回调式响应，错误写入回复的错误槽。
//!
//! ## 并发模型（How）
//! - 注册表与 Route 状态均保存在 `ArcSwap` 中，注册整表替换，分发零锁读取；
//! - 处理器执行期间不持有任何锁，监听开始后仍可继续注册路由。

mod error;
mod exchange;
pub mod http;
mod layer;
pub mod method;
pub mod path;
mod route;
mod router;
pub mod worker;

pub use error::{HandlerError, RouteError, codes};
pub use exchange::{AllowList, RoutedRequest, RoutedResponse};
pub use http::{HttpRequest, HttpResponse, HttpRouter};
pub use layer::{
    ErrorHandler, ErrorHandlerFn, Flow, Handler, HandlerFn, Layer, Predicate, error_handler_fn,
    handler_fn,
};
pub use path::{Params, PathPattern};
pub use route::Route;
pub use router::{Dispatch, Router};
pub use worker::{CallbackResponse, WorkerRequest, WorkerResponse, WorkerRouter};
