//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 主进程持有唯一的配置存储（[`JsonConfigStore`]），Worker 经 RPC 读写它；
//! - 两侧都通过 [`ConfigHandle`] 的点分路径 API 访问，键以 `.` 组合（`a.b.c`）。
//!
//! ## 契约（What）
//! - `get(None)` 返回整棵配置树，不存在的键返回 `null`；
//! - `update(value, key)` 覆盖键所在位置，沿途缺失的对象自动创建；
//!   途经非对象值时返回 [`ConfigError::NotAnObject`]。

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ConfigError, HostingError};

/// 配置存储契约。
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn get(&self, key: Option<&str>) -> Result<Value, ConfigError>;

    async fn update(&self, value: Value, key: Option<&str>) -> Result<(), ConfigError>;
}

/// 读取点分路径；空键表示根。
pub fn get_path<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    segments(key).try_fold(root, |node, segment| node.get(segment))
}

/// 写入点分路径，沿途创建缺失的对象。
pub fn set_path(root: &mut Value, key: &str, value: Value) -> Result<(), ConfigError> {
    let parts: Vec<&str> = segments(key).collect();
    let Some((last, parents)) = parts.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut node = root;
    for (depth, segment) in parents.iter().enumerate() {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        let object = node.as_object_mut().ok_or_else(|| ConfigError::NotAnObject {
            key: parts[..depth].join("."),
        })?;
        node = object
            .entry((*segment).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    let object = node.as_object_mut().ok_or_else(|| ConfigError::NotAnObject {
        key: parents.join("."),
    })?;
    object.insert((*last).to_owned(), value);
    Ok(())
}

/// `prefix` 与 `key` 以 `.` 组合，任一为空时取另一方。
pub fn join_key(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_owned(),
        (_, true) => prefix.to_owned(),
        _ => format!("{prefix}.{key}"),
    }
}

fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('.').filter(|segment| !segment.is_empty())
}

/// 内存中的 JSON 配置树，可选地回写到文件。
#[derive(Debug)]
pub struct JsonConfigStore {
    root: RwLock<Value>,
    path: Option<PathBuf>,
}

impl JsonConfigStore {
    pub fn in_memory(root: Value) -> Self {
        Self {
            root: RwLock::new(root),
            path: None,
        }
    }

    /// 从文件加载；文件不存在时以空对象起步，之后的更新仍会写回该路径。
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, HostingError> {
        let path = path.into();
        let root = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| HostingError::Json {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "spark_hosting", path = %path.display(), "config file absent, starting empty");
                Value::Object(Map::new())
            }
            Err(source) => return Err(HostingError::Io { path, source }),
        };
        Ok(Self {
            root: RwLock::new(root),
            path: Some(path),
        })
    }

    /// 当前配置树的快照。
    pub fn snapshot(&self) -> Value {
        self.root.read().clone()
    }

    /// 顶层分节，缺失时为 `null`。
    pub fn section(&self, name: &str) -> Value {
        self.root.read().get(name).cloned().unwrap_or(Value::Null)
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn get(&self, key: Option<&str>) -> Result<Value, ConfigError> {
        let root = self.root.read();
        Ok(get_path(&root, key.unwrap_or_default())
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn update(&self, value: Value, key: Option<&str>) -> Result<(), ConfigError> {
        let serialized = {
            let mut root = self.root.write();
            set_path(&mut root, key.unwrap_or_default(), value)?;
            match &self.path {
                Some(_) => Some(serde_json::to_vec_pretty(&*root)?),
                None => None,
            }
        };
        if let (Some(path), Some(bytes)) = (&self.path, serialized) {
            tokio::fs::write(path, bytes)
                .await
                .map_err(|source| ConfigError::Persist {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// 带前缀的配置访问句柄。
///
/// `scoped("a").get("b")` 等价于 `get("a.b")`；克隆共享同一个底层存储。
#[derive(Clone)]
pub struct ConfigHandle {
    store: Arc<dyn ConfigStore>,
    prefix: String,
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ConfigHandle {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
        }
    }

    pub fn scoped(&self, key: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: join_key(&self.prefix, key),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn get(&self, key: &str) -> Result<Value, ConfigError> {
        let full = join_key(&self.prefix, key);
        self.store
            .get((!full.is_empty()).then_some(full.as_str()))
            .await
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let full = join_key(&self.prefix, key);
        self.store
            .update(value, (!full.is_empty()).then_some(full.as_str()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn dotted_paths_read_and_write_nested_objects() {
        let mut root = json!({ "a": { "b": { "c": 1 } } });
        assert_eq!(get_path(&root, "a.b.c"), Some(&json!(1)));
        assert_eq!(get_path(&root, ""), Some(&root.clone()));
        assert_eq!(get_path(&root, "a.x"), None);

        set_path(&mut root, "a.b.d", json!("new")).unwrap();
        set_path(&mut root, "x.y", json!(true)).unwrap();
        assert_eq!(root, json!({ "a": { "b": { "c": 1, "d": "new" } }, "x": { "y": true } }));

        let err = set_path(&mut root, "a.b.c.z", json!(0)).unwrap_err();
        assert_eq!(err.code(), "config.key.not_object");
    }

    #[tokio::test]
    async fn scoped_handles_compose_keys() {
        let store = Arc::new(JsonConfigStore::in_memory(json!({ "web": { "port": 80 } })));
        let handle = ConfigHandle::new(store.clone());
        let web = handle.scoped("web");
        assert_eq!(web.get("port").await.unwrap(), json!(80));

        web.scoped("tls").set("enabled", json!(true)).await.unwrap();
        assert_eq!(handle.get("web.tls.enabled").await.unwrap(), json!(true));
        assert_eq!(web.get("").await.unwrap()["tls"], json!({ "enabled": true }));
    }

    #[tokio::test]
    async fn updates_are_written_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = JsonConfigStore::load(&path).await.unwrap();
        store.update(json!(5678), Some("spark-modhost.port")).await.unwrap();

        let persisted: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(persisted, json!({ "spark-modhost": { "port": 5678 } }));
        let reloaded = JsonConfigStore::load(&path).await.unwrap();
        assert_eq!(reloaded.section("spark-modhost"), json!({ "port": 5678 }));
    }
}
