//! 随可执行文件一起编译的模块入口。

use serde_json::json;
use spark_hosting::{ModuleCatalog, WorkerContext, worker_fn};
use spark_router::{Flow, worker::handler_fn};

/// `status`：在 `/api/status` 上报告承载它的模块与进程号。
pub const STATUS: &str = "status";

pub fn catalog() -> ModuleCatalog {
    ModuleCatalog::new().with_worker(
        STATUS,
        worker_fn(|ctx| {
            Box::pin(async move {
                install_status(ctx);
                Ok(())
            })
        }),
    )
}

fn install_status(ctx: &WorkerContext) {
    let module = ctx.module().to_owned();
    ctx.router().get(
        "/api/status",
        handler_fn(move |_, res| {
            let module = module.clone();
            Box::pin(async move {
                res.send(json!({
                    "module": module,
                    "pid": std::process::id(),
                }));
                Flow::Done
            })
        }),
    );
}
