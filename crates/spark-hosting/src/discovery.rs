//! 模块发现。
//!
//! - 存在 `sources.list`（JSON 字符串数组）时，枚举 `<modules_dir>/<source>` 下的每个子目录，
//!   模块名为 `source/folder`；
//! - 否则以当前包清单（`Cargo.toml` 的 `package.name`）作为唯一模块，目录为根目录；
//! - 每个模块目录可带 `module.json`（`{"workers": [...], "dependencies": [...]}`），缺失视为空；
//! - 模块配置切片取自整棵配置树的 `config[<module>]`。

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::HostingError;

pub const SOURCES_FILE: &str = "sources.list";
pub const MODULE_MANIFEST: &str = "module.json";
pub const PACKAGE_MANIFEST: &str = "Cargo.toml";

/// 一个已发现的模块。
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub directory: PathBuf,
    /// 模块的子 Worker，Worker 启动时逐一加载。
    pub workers: Vec<String>,
    /// 需先于本模块完成 `#master` 的其它模块。
    pub dependencies: Vec<String>,
    pub config: Value,
}

/// 发现输入的位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// 工作根目录，`Cargo.toml` 与相对路径都以它为基准。
    pub root: PathBuf,
    pub sources_file: PathBuf,
    /// 各 source 目录所在的父目录。
    pub modules_dir: PathBuf,
}

impl DiscoveryOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sources_file: root.join(SOURCES_FILE),
            modules_dir: root.join("modules"),
            root,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModuleManifest {
    #[serde(default)]
    workers: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    package: Option<PackageSection>,
}

#[derive(Debug, Deserialize)]
struct PackageSection {
    name: String,
}

/// 枚举模块，结果按模块名排序。
pub async fn discover(options: &DiscoveryOptions, config: &Value) -> Result<Vec<ModuleDescriptor>, HostingError> {
    let locations = match tokio::fs::read(&options.sources_file).await {
        Ok(bytes) => {
            let sources: Vec<String> = serde_json::from_slice(&bytes).map_err(|source| HostingError::Json {
                path: options.sources_file.clone(),
                source,
            })?;
            from_sources(&options.modules_dir, &sources).await?
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(target: "spark_hosting::coordinator", "no sources list, hosting the current package");
            vec![(package_name(&options.root).await?, options.root.clone())]
        }
        Err(source) => {
            return Err(HostingError::Io {
                path: options.sources_file.clone(),
                source,
            });
        }
    };

    let mut modules = Vec::with_capacity(locations.len());
    for (name, directory) in locations {
        let manifest = read_module_manifest(&directory).await?;
        let config = config.get(&name).cloned().unwrap_or(Value::Null);
        modules.push(ModuleDescriptor {
            name,
            directory,
            workers: manifest.workers,
            dependencies: manifest.dependencies,
            config,
        });
    }
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(modules)
}

async fn from_sources(modules_dir: &Path, sources: &[String]) -> Result<Vec<(String, PathBuf)>, HostingError> {
    let mut found = Vec::new();
    for source in sources {
        let dir = modules_dir.join(source);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(target: "spark_hosting::coordinator", source = %source, path = %dir.display(), error = %err, "module source unreadable, skipped");
                continue;
            }
        };
        let mut folders = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| HostingError::Io {
                path: dir.clone(),
                source,
            })?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if is_dir {
                folders.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        folders.sort();
        found.extend(
            folders
                .into_iter()
                .map(|folder| (format!("{source}/{folder}"), dir.join(&folder))),
        );
    }
    Ok(found)
}

async fn package_name(root: &Path) -> Result<String, HostingError> {
    let path = root.join(PACKAGE_MANIFEST);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| HostingError::Io {
            path: path.clone(),
            source,
        })?;
    let manifest: PackageManifest = toml::from_str(&raw).map_err(|err| HostingError::Manifest {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    manifest
        .package
        .map(|package| package.name)
        .ok_or_else(|| HostingError::Manifest {
            path,
            reason: "missing [package] name".to_owned(),
        })
}

async fn read_module_manifest(directory: &Path) -> Result<ModuleManifest, HostingError> {
    let path = directory.join(MODULE_MANIFEST);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| HostingError::Json { path, source }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ModuleManifest::default()),
        Err(source) => Err(HostingError::Io { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn sources_list_enumerates_module_folders() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join(SOURCES_FILE), r#"["core", "extra", "absent"]"#).unwrap();
        fs::create_dir_all(root.join("modules/core/web")).unwrap();
        fs::create_dir_all(root.join("modules/core/auth")).unwrap();
        fs::create_dir_all(root.join("modules/extra/jobs")).unwrap();
        fs::write(root.join("modules/core/README"), "not a module").unwrap();
        fs::write(
            root.join("modules/core/web/module.json"),
            r#"{ "workers": ["core/web-static"], "dependencies": ["core/auth"] }"#,
        )
        .unwrap();

        let config = json!({ "core/web": { "title": "hello" } });
        let modules = discover(&DiscoveryOptions::new(root), &config).await.unwrap();

        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["core/auth", "core/web", "extra/jobs"]);
        let web = &modules[1];
        assert_eq!(web.workers, ["core/web-static"]);
        assert_eq!(web.dependencies, ["core/auth"]);
        assert_eq!(web.config, json!({ "title": "hello" }));
        assert_eq!(modules[0].config, Value::Null);
    }

    #[tokio::test]
    async fn package_manifest_is_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PACKAGE_MANIFEST),
            "[package]\nname = \"demo-site\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        let modules = discover(&DiscoveryOptions::new(dir.path()), &json!({}))
            .await
            .unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "demo-site");
        assert_eq!(modules[0].directory, dir.path());
        assert!(modules[0].workers.is_empty());
    }

    #[tokio::test]
    async fn workspace_manifest_without_package_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PACKAGE_MANIFEST), "[workspace]\nmembers = []\n").unwrap();
        let err = discover(&DiscoveryOptions::new(dir.path()), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "hosting.manifest");
    }
}
