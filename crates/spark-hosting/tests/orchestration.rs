//! 主进程编排端到端：进程内 Worker、依赖顺序、晚绑定转发与兜底路由。

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::{Value, json};
use spark_hosting::{
    Coordinator, GraphEvent, HostContext, HostSettings, InProcessLauncher, JsonConfigStore, MasterEvent,
    ModuleCatalog, ModuleDescriptor, RunningHost, TaskStatus, WorkerContext, bootstrap, master_fn, worker_fn,
};
use spark_router::{Flow, http, worker};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(10);

fn descriptor(name: &str, dependencies: &[&str]) -> ModuleDescriptor {
    ModuleDescriptor {
        name: name.to_owned(),
        directory: PathBuf::from(name),
        workers: Vec::new(),
        dependencies: dependencies.iter().map(|dep| (*dep).to_owned()).collect(),
        config: json!({ "greeting": format!("hello from {name}") }),
    }
}

fn settings(root: Option<PathBuf>) -> HostSettings {
    HostSettings {
        port: 0,
        dn: "127.0.0.1".to_owned(),
        root,
        management: "127.0.0.1:0".to_owned(),
    }
}

/// 在 `/api/hello` 上回显模块名的 Worker 入口。
fn greeter(ctx: &WorkerContext) {
    let module = ctx.module().to_owned();
    ctx.router().get(
        "/api/hello",
        worker::handler_fn(move |_, res| {
            let module = module.clone();
            Box::pin(async move {
                res.send(json!({ "module": module }));
                Flow::Done
            })
        }),
    );
}

fn catalog(master_started: Arc<AtomicUsize>) -> ModuleCatalog {
    ModuleCatalog::new()
        .with_worker(
            "a",
            worker_fn(|ctx| {
                Box::pin(async move {
                    greeter(ctx);
                    Ok(())
                })
            }),
        )
        .with_worker(
            "b",
            worker_fn(|ctx| {
                Box::pin(async move {
                    greeter(ctx);
                    ctx.announce_master("b/index", Some("./master"), None);
                    Ok(())
                })
            }),
        )
        .with_master(
            "b/master",
            master_fn(move |host, registration| {
                let started = Arc::clone(&master_started);
                Box::pin(async move {
                    assert_eq!(registration.master_path.as_deref(), Some("b/master"));
                    started.fetch_add(1, Ordering::SeqCst);
                    host.routers().app.get(
                        "/b-master",
                        http::handler_fn(|_, res| {
                            Box::pin(async move {
                                res.send_text("mastered");
                                Flow::Done
                            })
                        }),
                    );
                    Ok(())
                })
            }),
        )
}

async fn start(modules: Vec<ModuleDescriptor>, catalog: ModuleCatalog, root: Option<PathBuf>) -> (RunningHost, HostContext) {
    let store = Arc::new(JsonConfigStore::in_memory(json!({ "app": { "name": "demo" } })));
    let context = HostContext::new(settings(root), store);
    let launcher = Arc::new(InProcessLauncher::new(catalog.clone()));
    let coordinator = Coordinator::new(context.clone(), modules, catalog, launcher);
    (coordinator.start().await.unwrap(), context)
}

async fn get(addr: std::net::SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8_lossy(&raw).into_owned();
    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_owned())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn dependencies_start_before_dependents_and_the_listener_opens_last() {
    let master_started = Arc::new(AtomicUsize::new(0));
    let catalog = catalog(Arc::clone(&master_started));
    let store = Arc::new(JsonConfigStore::in_memory(json!({})));
    let context = HostContext::new(settings(None), store);
    let mut events = context.events().subscribe();
    let launcher = Arc::new(InProcessLauncher::new(catalog.clone()));
    let coordinator = Coordinator::new(
        context.clone(),
        vec![descriptor("a", &[]), descriptor("b", &["a"])],
        catalog,
        launcher,
    );
    let host = coordinator.start().await.unwrap();
    let addr = timeout(WAIT, host.ready()).await.unwrap().unwrap();

    let mut started = Vec::new();
    loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            MasterEvent::ModuleStarted { module } => started.push(module),
            MasterEvent::Ready { address } => {
                assert_eq!(address, addr);
                break;
            }
            MasterEvent::ModuleAnnounced { .. } => {}
        }
    }
    assert_eq!(started, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(master_started.load(Ordering::SeqCst), 1);
    assert_eq!(context.connected_modules(), vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(host.graph().status("default"), Some(TaskStatus::Done));
    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_routes_are_forwarded_through_the_master() {
    let (host, _) = start(
        vec![descriptor("a", &[]), descriptor("b", &["a"])],
        catalog(Arc::new(AtomicUsize::new(0))),
        None,
    )
    .await;
    let addr = timeout(WAIT, host.ready()).await.unwrap().unwrap();

    let (status, body) = timeout(WAIT, get(addr, "/api/a/hello")).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "module": "a" }));

    let (status, body) = timeout(WAIT, get(addr, "/b-master")).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "mastered");

    let (status, _) = timeout(WAIT, get(addr, "/api/a/missing")).await.unwrap();
    assert_eq!(status, 404);
    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_reconnected_worker_takes_over_its_routes() {
    let catalog = catalog(Arc::new(AtomicUsize::new(0)));
    let (host, context) = start(vec![descriptor("a", &[])], catalog.clone(), None).await;
    let addr = timeout(WAIT, host.ready()).await.unwrap().unwrap();
    let (status, _) = timeout(WAIT, get(addr, "/api/a/hello")).await.unwrap();
    assert_eq!(status, 200);
    let first = context.connection("a").unwrap();

    let _reconnected = timeout(WAIT, bootstrap("a", host.master_url(), catalog))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, first.closed()).await.unwrap();

    let body = timeout(WAIT, async {
        loop {
            let (status, body) = get(addr, "/api/a/hello").await;
            if status == 200 {
                break body;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "module": "a" }));
    assert_ne!(context.connection("a").unwrap().id(), first.id());
    assert_eq!(context.late_bound().routes(), vec!["/api/a".to_owned()]);
    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn fallback_serves_the_index_and_rejects_source_maps() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), "<html>spark</html>").unwrap();
    let (host, _) = start(vec![descriptor("a", &[])], catalog(Arc::new(AtomicUsize::new(0))), Some(root.path().to_owned())).await;
    let addr = timeout(WAIT, host.ready()).await.unwrap().unwrap();

    let (status, body) = timeout(WAIT, get(addr, "/some/page")).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "<html>spark</html>");

    let (status, _) = timeout(WAIT, get(addr, "/bundle.js.map")).await.unwrap();
    assert_eq!(status, 404);
    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_read_and_write_master_config() {
    let seen = Arc::new(parking_lot::Mutex::new(None::<Value>));
    let observed = Arc::clone(&seen);
    let catalog = ModuleCatalog::new().with_worker(
        "cfg",
        worker_fn(move |ctx| {
            let observed = Arc::clone(&observed);
            Box::pin(async move {
                ctx.config().set("app.visits", json!(3)).await?;
                let app = ctx.config().get("app").await?;
                *observed.lock() = Some(app);
                Ok(())
            })
        }),
    );
    let (host, context) = start(vec![descriptor("cfg", &[])], catalog, None).await;
    timeout(WAIT, host.ready()).await.unwrap().unwrap();

    assert_eq!(seen.lock().clone(), Some(json!({ "name": "demo", "visits": 3 })));
    assert_eq!(context.config().get("app.visits").await.unwrap(), json!(3));
    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_module_abandons_its_dependents_only() {
    let catalog = ModuleCatalog::new()
        .with_worker(
            "ok",
            worker_fn(|_| Box::pin(async move { Ok(()) })),
        )
        .with_worker(
            "broken",
            worker_fn(|_| Box::pin(async move { Err("boom".into()) })),
        );
    let store = Arc::new(JsonConfigStore::in_memory(json!({})));
    let context = HostContext::new(settings(None), store);
    let launcher = Arc::new(InProcessLauncher::new(catalog.clone()));
    let coordinator = Coordinator::new(
        context,
        vec![descriptor("ok", &[]), descriptor("broken", &[])],
        catalog,
        launcher,
    );
    let failures = Arc::new(parking_lot::Mutex::new(BTreeSet::new()));
    let recorded = Arc::clone(&failures);
    coordinator.graph().on_all(move |event| {
        if let GraphEvent::TaskErr { task, .. } = event {
            recorded.lock().insert(task.clone());
        }
    });
    let host = coordinator.start().await.unwrap();

    assert!(timeout(WAIT, host.ready()).await.unwrap().is_err());
    assert_eq!(host.public_addr(), None);
    assert_eq!(host.graph().status("ok#master"), Some(TaskStatus::Done));
    assert!(failures.lock().contains("broken#master"));
    host.shutdown();
}
