//! HTTP 动词表。
//!
//! 所有按动词注册的入口（`get`、`post`、……）都经由 [`verb`] 查表得到规范化名称，
//! 表在编译期固定，路由器实例不会在运行时增删动词。

/// 伪方法：协议升级请求在进入分发前被改写为该方法名。
pub const UPGRADE: &str = "UPGRADE";
pub const GET: &str = "GET";
pub const HEAD: &str = "HEAD";
pub const OPTIONS: &str = "OPTIONS";

/// 路由器接受的全部 HTTP 动词（大写规范形式）。
pub static VERBS: &[&str] = &[
    "CHECKOUT",
    "CONNECT",
    "COPY",
    "DELETE",
    "GET",
    "HEAD",
    "LOCK",
    "M-SEARCH",
    "MERGE",
    "MKACTIVITY",
    "MKCALENDAR",
    "MKCOL",
    "MOVE",
    "NOTIFY",
    "OPTIONS",
    "PATCH",
    "POST",
    "PROPFIND",
    "PROPPATCH",
    "PURGE",
    "PUT",
    "REPORT",
    "SEARCH",
    "SUBSCRIBE",
    "TRACE",
    "UNLOCK",
    "UNSUBSCRIBE",
];

/// 以大小写不敏感的方式查找动词，返回表内的规范名称。
pub fn verb(name: &str) -> Option<&'static str> {
    VERBS
        .iter()
        .copied()
        .find(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// 判断请求方法是否等于给定的规范名称。
pub(crate) fn is(method: &str, canonical: &str) -> bool {
    method.eq_ignore_ascii_case(canonical)
}
