//! 路径模式的解析与匹配。
//!
//! 模式按 `/` 切分为段：字面量、`:name` 参数与 `*` 通配。`*` 吞掉剩余的全部段（含零段），
//! 捕获值写入名为 `*` 的参数。匹配以段为单位，空段被忽略。

use std::collections::BTreeMap;

/// 命中后提取出的路径参数。
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// 前缀匹配的结果：提取的参数与挂载点之后的剩余路径。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    pub params: Params,
    pub remainder: String,
}

/// 已解析的路径模式。
///
/// # 契约 (What)
/// - `raw` 保存注册时的原始字符串，[`Router::route`](crate::Router::route) 以它作为唯一键；
/// - [`matches`](Self::matches) 做整路径匹配，[`match_prefix`](Self::match_prefix) 服务于 `use` 挂载。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = split(&raw)
            .map(|segment| {
                if segment == "*" {
                    Segment::Wildcard
                } else if let Some(name) = segment.strip_prefix(':') {
                    Segment::Param(name.to_owned())
                } else {
                    Segment::Literal(segment.to_owned())
                }
            })
            .collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 整路径匹配，成功时返回参数表。
    pub fn matches(&self, path: &str) -> Option<Params> {
        let parts: Vec<&str> = split(path).collect();
        let mut params = Params::new();
        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::Wildcard => {
                    params.insert("*".to_owned(), parts[index.min(parts.len())..].join("/"));
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(index)?;
                    params.insert(name.clone(), (*value).to_owned());
                }
            }
            index += 1;
        }
        (index == parts.len()).then_some(params)
    }

    /// 前缀匹配：模式的全部段命中路径的前若干段即视为命中。
    pub fn match_prefix(&self, path: &str) -> Option<PrefixMatch> {
        let parts: Vec<&str> = split(path).collect();
        let mut params = Params::new();
        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::Wildcard => {
                    params.insert("*".to_owned(), parts[index.min(parts.len())..].join("/"));
                    return Some(PrefixMatch {
                        params,
                        remainder: "/".to_owned(),
                    });
                }
                Segment::Literal(literal) => {
                    if parts.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(index)?;
                    params.insert(name.clone(), (*value).to_owned());
                }
            }
            index += 1;
        }

        let rest = &parts[index..];
        let mut remainder = String::from("/");
        remainder.push_str(&rest.join("/"));
        if !rest.is_empty() && path.ends_with('/') {
            remainder.push('/');
        }
        Some(PrefixMatch { params, remainder })
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// 将挂载前缀与剩余路径拼回完整路径，供请求转发时重映射使用。
pub fn join(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (prefix.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{rest}"),
        (false, true) => prefix.to_owned(),
        (false, false) => format!("{prefix}/{rest}"),
    }
}
