//! `spark-modhost`：模块宿主入口。
//!
//! - `spark-modhost master`：发现模块、逐个拉起 Worker 子进程并打开公共监听；
//! - `spark-modhost worker <module> <master-url>`：由 master 拉起，执行 Worker 启动协议后常驻，
//!   直到主进程连接关闭。启动失败以 [`BootstrapError::EXIT_STATUS`] 退出。

mod builtin;
mod logging;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use spark_hosting::{
    BootstrapError, Coordinator, DiscoveryOptions, InProcessLauncher, ProcessLauncher, WorkerLauncher, bootstrap,
    coordinator::CONFIG_FILE,
};
use tracing::{error, info, warn};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "spark-modhost", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the coordinator and spawn one worker per module
    Master {
        /// Working root holding `config.json`, `sources.list` and `modules/`
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Override the config file location
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the sources list location
        #[arg(long)]
        sources: Option<PathBuf>,
        /// Run workers as tasks of this process instead of child processes
        #[arg(long)]
        in_process: bool,
    },
    /// Host one module, connecting back to the master
    Worker {
        module: Option<String>,
        master_url: Option<String>,
    },
}

fn main() -> ExitCode {
    if let Err(err) = logging::install() {
        eprintln!("spark-modhost: {err}");
    }
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build the tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    match cli.command {
        Command::Master {
            root,
            config,
            sources,
            in_process,
        } => match runtime.block_on(run_master(root, config, sources, in_process)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = ?err, "master stopped");
                ExitCode::FAILURE
            }
        },
        Command::Worker { module, master_url } => match runtime.block_on(run_worker(module, master_url)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(code = err.code(), error = %err, "worker bootstrap failed");
                ExitCode::from(BootstrapError::EXIT_STATUS as u8)
            }
        },
    }
}

async fn run_master(
    root: PathBuf,
    config: Option<PathBuf>,
    sources: Option<PathBuf>,
    in_process: bool,
) -> anyhow::Result<()> {
    let catalog = builtin::catalog();
    let launcher: Arc<dyn WorkerLauncher> = if in_process {
        Arc::new(InProcessLauncher::new(catalog.clone()))
    } else {
        Arc::new(ProcessLauncher::current_exe().context("locating the spark-modhost executable")?)
    };
    let mut discovery = DiscoveryOptions::new(&root);
    if let Some(sources) = sources {
        discovery.sources_file = sources;
    }
    let config = config.unwrap_or_else(|| root.join(CONFIG_FILE));

    let coordinator = Coordinator::from_files(&config, &discovery, catalog, launcher).await?;
    let host = coordinator.start().await?;
    info!(url = %host.master_url(), "master started");

    tokio::select! {
        ready = host.ready() => match ready {
            Ok(address) => info!(%address, "accepting requests"),
            Err(err) => warn!(code = err.code(), error = %err, "module graph did not complete, public listener stays closed"),
        },
        _ = tokio::signal::ctrl_c() => {
            host.shutdown();
            return Ok(());
        }
    }
    tokio::signal::ctrl_c()
        .await
        .context("waiting for the shutdown signal")?;
    info!("shutting down");
    host.shutdown();
    Ok(())
}

async fn run_worker(module: Option<String>, master_url: Option<String>) -> Result<(), BootstrapError> {
    let module = module.ok_or(BootstrapError::MissingArgument("module"))?;
    let raw = master_url.ok_or(BootstrapError::MissingArgument("master-url"))?;
    let url = Url::parse(&raw).map_err(|source| BootstrapError::InvalidUrl { url: raw, source })?;
    let runtime = bootstrap(&module, &url, builtin::catalog()).await?;
    runtime.closed().await;
    info!(module = %module, "master connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_arguments_are_positional() {
        let cli = Cli::try_parse_from(["spark-modhost", "worker", "status", "http://127.0.0.1:4000/api/manage"]).unwrap();
        match cli.command {
            Command::Worker { module, master_url } => {
                assert_eq!(module.as_deref(), Some("status"));
                assert_eq!(master_url.as_deref(), Some("http://127.0.0.1:4000/api/manage"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn master_defaults_to_the_current_directory() {
        let cli = Cli::try_parse_from(["spark-modhost", "master"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Master { ref root, config: None, sources: None, in_process: false } if root == &PathBuf::from(".")
        ));
    }

    #[tokio::test]
    async fn missing_worker_arguments_fail_the_bootstrap() {
        let err = run_worker(Some("status".to_owned()), None).await.unwrap_err();
        assert!(matches!(err, BootstrapError::MissingArgument("master-url")));
        let err = run_worker(Some("status".to_owned()), Some("not a url".to_owned()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bootstrap.argument.url");
    }
}
