use std::{collections::BTreeSet, sync::Arc};

use arc_swap::ArcSwap;

use crate::{
    exchange::{RoutedRequest, RoutedResponse},
    layer::{Handler, Layer, Predicate},
    method,
    path::PathPattern,
};

/// 某一路径上全部 Layer 的聚合。
///
/// # 教案式说明
/// - **意图 (Why)**：同一路径可按不同方法多次注册，Route 负责记录已注册的方法集合，
///   以便在 404 与 405/OPTIONS 之间做出判断；
/// - **逻辑 (How)**：内部状态保存在 [`ArcSwap`] 中，注册时整体复制后替换，
///   分发路径只做一次 `load`，不持锁跨越 `await`；
/// - **契约 (What)**：Layer 按注册顺序执行；`methods` 仅包含按动词注册的方法，`all` 不计入。
pub struct Route<Req, Res> {
    pattern: PathPattern,
    state: ArcSwap<RouteState<Req, Res>>,
}

pub(crate) struct RouteState<Req, Res> {
    pub(crate) layers: Vec<Layer<Req, Res>>,
    pub(crate) methods: BTreeSet<String>,
}

impl<Req, Res> Clone for RouteState<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
            methods: self.methods.clone(),
        }
    }
}

impl<Req, Res> RouteState<Req, Res>
where
    Req: RoutedRequest,
    Res: RoutedResponse,
{
    /// HEAD 请求在没有显式 HEAD 层时落到 GET 层上。
    pub(crate) fn effective_method<'a>(&self, requested: &'a str) -> &'a str {
        if method::is(requested, method::HEAD)
            && !self.methods.contains(method::HEAD)
            && self.methods.contains(method::GET)
        {
            method::GET
        } else {
            requested
        }
    }

    pub(crate) fn handles(&self, effective_method: &str, req: &Req) -> bool {
        self.layers
            .iter()
            .any(|layer| layer.applies(effective_method, req))
    }
}

impl<Req, Res> Route<Req, Res>
where
    Req: RoutedRequest,
    Res: RoutedResponse,
{
    pub(crate) fn new(path: &str) -> Self {
        Self {
            pattern: PathPattern::parse(path),
            state: ArcSwap::from_pointee(RouteState {
                layers: Vec::new(),
                methods: BTreeSet::new(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        self.pattern.as_str()
    }

    pub(crate) fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub(crate) fn snapshot(&self) -> Arc<RouteState<Req, Res>> {
        self.state.load_full()
    }

    /// 已注册的方法集合（大写、有序）。
    pub fn methods(&self) -> Vec<String> {
        self.state.load().methods.iter().cloned().collect()
    }

    /// 以规范动词名追加一个处理层，并把方法记入集合。
    pub fn method(&self, verb: &'static str, handler: impl Handler<Req, Res>) -> &Self {
        self.push(Layer::handler(Some(verb), Arc::new(handler)), Some(verb));
        self
    }

    /// 追加一个接受任意方法的处理层。
    pub fn all(&self, handler: impl Handler<Req, Res>) -> &Self {
        self.push(Layer::handler(None, Arc::new(handler)), None);
        self
    }

    /// 追加一个带适用性谓词的处理层。
    pub(crate) fn guarded(
        &self,
        verb: &'static str,
        predicate: Predicate<Req>,
        handler: Arc<dyn Handler<Req, Res>>,
    ) -> &Self {
        self.push(Layer::handler(Some(verb), handler).guarded(predicate), Some(verb));
        self
    }

    fn push(&self, layer: Layer<Req, Res>, verb: Option<&'static str>) {
        self.state.rcu(|current| {
            let mut next = RouteState::clone(current);
            next.layers.push(layer.clone());
            if let Some(verb) = verb {
                next.methods.insert(verb.to_owned());
            }
            next
        });
    }
}
