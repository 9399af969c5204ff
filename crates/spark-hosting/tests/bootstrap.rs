//! Worker 启动协议：以内存双工通道连接一个假主进程，观察 Worker 发出的调用。

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::{Value, json};
use spark_hosting::{
    BootstrapError, ModuleCatalog, WorkerRuntime, bootstrap_with_io,
    protocol::{ModuleReply, ModuleRequest, RouteRegistration, host_meta, names},
    worker_fn,
};
use spark_rpc::{Endpoint, Implementation, RpcError};
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(5);

/// 假主进程记录到的调用。
#[derive(Debug, Default)]
struct Recorded {
    modules: Vec<String>,
    masters: Vec<Value>,
    routes: Vec<RouteRegistration>,
}

async fn run_worker(
    module: &str,
    workers: Vec<String>,
    catalog: ModuleCatalog,
) -> (Result<WorkerRuntime, BootstrapError>, Arc<Mutex<Recorded>>) {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let on_module = Arc::clone(&recorded);
    let on_master = Arc::clone(&recorded);
    let on_register = Arc::clone(&recorded);

    let module_api = Implementation::new()
        .typed_two_way(names::MODULE, move |request: ModuleRequest, _| {
            on_module.lock().modules.push(request.module);
            let workers = workers.clone();
            async move {
                Ok::<_, RpcError>(ModuleReply {
                    config: json!({ "answer": 42 }),
                    workers,
                })
            }
        })
        .one_way(names::MASTER, move |params, _| {
            on_master.lock().masters.push(params);
            async {}
        })
        .two_way(names::GET_CONFIG, |_, _| async { Ok::<_, RpcError>(Value::Null) })
        .two_way(names::UPDATE_CONFIG, |_, _| async { Ok::<_, RpcError>(Value::Null) });
    let router_api = Implementation::new().typed_one_way(names::REGISTER, move |registration: RouteRegistration, _| {
        on_register.lock().routes.push(registration);
        async {}
    });

    let endpoint = Endpoint::new();
    let _server = host_meta()
        .unwrap()
        .create_server_on(endpoint.clone(), module_api, router_api)
        .unwrap();
    let (server_io, worker_io) = tokio::io::duplex(64 * 1024);
    endpoint.accept(server_io);

    let outcome = timeout(WAIT, bootstrap_with_io(module, worker_io, catalog))
        .await
        .unwrap();
    (outcome, recorded)
}

async fn wait_for_master(recorded: &Mutex<Recorded>) {
    timeout(WAIT, async {
        while recorded.lock().masters.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // 给重复调用留出到达的时间。
    sleep(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_modules_get_a_default_announcement() {
    let catalog = ModuleCatalog::new().with_worker("quiet", worker_fn(|_| Box::pin(async { Ok(()) })));
    let (outcome, recorded) = run_worker("quiet", Vec::new(), catalog).await;
    let runtime = outcome.unwrap();
    assert_eq!(runtime.context().module(), "quiet");
    assert_eq!(runtime.context().module_config(), &json!({ "answer": 42 }));
    wait_for_master(&recorded).await;

    let recorded = recorded.lock();
    assert_eq!(recorded.modules, vec!["quiet".to_owned()]);
    assert_eq!(recorded.masters, vec![Value::Null]);
    assert_eq!(
        recorded.routes,
        vec![RouteRegistration {
            path: "/api/quiet".to_owned(),
            remap: "/api".to_owned(),
        }]
    );
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn a_second_announcement_is_rejected() {
    let catalog = ModuleCatalog::new().with_worker(
        "web",
        worker_fn(|ctx| {
            Box::pin(async move {
                assert!(ctx.is_module("web"));
                assert!(ctx.announce_master("web/index", Some("./master"), Some("./worker")));
                assert!(!ctx.announce_master("web/index", Some("./other"), None));
                Ok(())
            })
        }),
    );
    let (outcome, recorded) = run_worker("web", Vec::new(), catalog).await;
    outcome.unwrap();
    wait_for_master(&recorded).await;

    assert_eq!(
        recorded.lock().masters,
        vec![json!({ "masterPath": "web/master", "workerPath": "web/worker" })]
    );
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("master announcement already sent"))
            .count()
        {
            1 => Ok(()),
            n => Err(format!("expected one guard error, found {n}")),
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_workers_load_once_and_cannot_announce() {
    let loads = Arc::new(Mutex::new(Vec::<String>::new()));
    let shared_loads = Arc::clone(&loads);
    let own_loads = Arc::clone(&loads);
    let catalog = ModuleCatalog::new()
        .with_worker(
            "shared",
            worker_fn(move |ctx| {
                let loads = Arc::clone(&shared_loads);
                Box::pin(async move {
                    loads.lock().push("shared".to_owned());
                    assert!(!ctx.is_module("app"));
                    assert!(!ctx.announce_master("shared/index", Some("./master"), None));
                    Ok(())
                })
            }),
        )
        .with_worker(
            "app",
            worker_fn(move |ctx| {
                let loads = Arc::clone(&own_loads);
                Box::pin(async move {
                    loads.lock().push("app".to_owned());
                    assert_eq!(ctx.module_config()["answer"], json!(42));
                    assert_eq!(ctx.config().get("answer").await?, json!(null));
                    Ok(())
                })
            }),
        );
    let workers = vec!["shared".to_owned(), String::new(), "shared".to_owned()];
    let (outcome, recorded) = run_worker("app", workers, catalog).await;
    outcome.unwrap();
    wait_for_master(&recorded).await;

    assert_eq!(*loads.lock(), vec!["shared".to_owned(), "app".to_owned()]);
    assert_eq!(recorded.lock().masters, vec![Value::Null]);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_module_listed_among_its_workers_still_loads_as_the_module() {
    let loads = Arc::new(Mutex::new(0_usize));
    let counted = Arc::clone(&loads);
    let catalog = ModuleCatalog::new().with_worker(
        "self",
        worker_fn(move |ctx| {
            let counted = Arc::clone(&counted);
            Box::pin(async move {
                *counted.lock() += 1;
                assert!(ctx.is_module("self"));
                assert!(ctx.announce_master("self/index", None, Some("./worker")));
                Ok(())
            })
        }),
    );
    let (outcome, recorded) = run_worker("self", vec!["self".to_owned()], catalog).await;
    outcome.unwrap();
    wait_for_master(&recorded).await;

    assert_eq!(*loads.lock(), 1);
    assert_eq!(recorded.lock().masters, vec![json!({ "masterPath": null, "workerPath": "self/worker" })]);
}

#[tokio::test(flavor = "multi_thread")]
async fn modules_missing_from_the_catalog_fail_the_bootstrap() {
    let (outcome, _) = run_worker("ghost", Vec::new(), ModuleCatalog::new()).await;
    let err = outcome.unwrap_err();
    assert!(matches!(err, BootstrapError::UnknownModule(ref name) if name == "ghost"));
    assert_eq!(err.code(), "bootstrap.module.unknown");
}
