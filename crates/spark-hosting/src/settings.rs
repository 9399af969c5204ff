use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// `config.json` 中宿主自身的分节名。
pub const SETTINGS_SECTION: &str = "spark-modhost";

const DEFAULT_PORT: u16 = 5678;

/// 宿主设置。
///
/// # 契约 (What)
/// - `port`：公共监听端口，缺省取环境变量 `PORT`，再缺省为 `5678`；
/// - `dn`：公共监听主机名，缺省 `localhost`；
/// - `root`：兜底路由返回 `index.html` 的静态根目录；
/// - `management`：主从 RPC 管理入口的监听地址，缺省 `127.0.0.1:0`（随机端口）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub port: u16,
    pub dn: String,
    pub root: Option<PathBuf>,
    pub management: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            port: port_from_env(),
            dn: "localhost".to_owned(),
            root: None,
            management: "127.0.0.1:0".to_owned(),
        }
    }
}

fn port_from_env() -> u16 {
    match std::env::var("PORT") {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(target: "spark_hosting", value = %raw, "PORT is not a valid port, using default");
            DEFAULT_PORT
        }),
        Err(_) => DEFAULT_PORT,
    }
}

impl HostSettings {
    /// 从整棵配置树中读取 `spark-modhost` 分节；分节缺失或不合法时使用缺省值。
    pub fn from_config(config: &Value) -> Self {
        match config.get(SETTINGS_SECTION) {
            Some(section) => serde_json::from_value(section.clone()).unwrap_or_else(|err| {
                warn!(target: "spark_hosting", error = %err, "invalid `{SETTINGS_SECTION}` section, using defaults");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// 公共监听地址 `dn:port`。
    pub fn public_address(&self) -> String {
        format!("{}:{}", self.dn, self.port)
    }
}
