//! 路由分发的端到端行为：注册顺序、错误层、挂载、OPTIONS 自动应答与协议升级匹配。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use proptest::prelude::*;
use spark_router::{
    Flow, HandlerError, HttpRequest, HttpRouter, RoutedRequest, WorkerRequest, WorkerRouter,
    http::{error_handler_fn, handler_fn},
    method, worker,
};

fn done() -> impl spark_router::Handler<HttpRequest, spark_router::HttpResponse> {
    handler_fn(|_req, res| {
        Box::pin(async move {
            res.send_status(200);
            Flow::Done
        })
    })
}

fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl spark_router::Handler<HttpRequest, spark_router::HttpResponse> {
    let log = Arc::clone(log);
    handler_fn(move |_req, _res| {
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().push(name);
            Flow::Next
        })
    })
}

#[tokio::test]
async fn options_answers_with_sorted_allow_header() {
    let router = HttpRouter::new();
    router.post("/items", done()).get("/items", done()).delete("/items", done());

    let res = router.respond(HttpRequest::new("OPTIONS", "/items")).await;

    assert_eq!(res.status_code(), 200);
    assert_eq!(res.headers()["allow"], "DELETE, GET, POST");
    assert_eq!(res.headers()["content-type"], "text/plain");
    assert_eq!(res.headers()["x-content-type-options"], "nosniff");
    assert_eq!(res.headers()["content-length"], "17");
    assert_eq!(&res.body()[..], b"DELETE, GET, POST");
}

#[tokio::test]
async fn method_mismatch_skips_handlers_and_falls_to_404() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let router = HttpRouter::new();
    router.post(
        "/items",
        handler_fn(move |_req, res| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                res.send_status(201);
                Flow::Done
            })
        }),
    );

    let res = router.respond(HttpRequest::new("GET", "/items")).await;
    assert_eq!(res.status_code(), 404);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn head_falls_through_to_get() {
    let router = HttpRouter::new();
    router.get("/page", done());
    let res = router.respond(HttpRequest::new("HEAD", "/page")).await;
    assert_eq!(res.status_code(), 200);
}

#[tokio::test]
async fn layers_run_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let router = HttpRouter::new();
    router.use_handler("/", record(&log, "first"));
    router.get("/a", record(&log, "route-1"));
    router.use_handler("/a", record(&log, "second"));
    router.get("/a", done());

    let res = router.respond(HttpRequest::new("GET", "/a")).await;
    assert_eq!(res.status_code(), 200);
    // 同一路径上的 `get` 共用一条 Route，因此 route-1 与终结处理器相邻执行。
    assert_eq!(*log.lock(), vec!["first", "route-1"]);
}

#[tokio::test]
async fn errors_skip_normal_layers_until_an_error_layer() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let router = HttpRouter::new();
    router.get(
        "/boom",
        handler_fn(|_req, _res| {
            Box::pin(async move { Flow::Fail(HandlerError::msg("exploded").with_status(418)) })
        }),
    );
    router.use_handler("/", record(&log, "skipped"));
    router.use_error(
        "/",
        error_handler_fn(|err, _req, res| {
            Box::pin(async move {
                res.status(err.status());
                res.send_text(err.message().to_owned());
                Flow::Done
            })
        }),
    );

    let res = router.respond(HttpRequest::new("GET", "/boom")).await;
    assert_eq!(res.status_code(), 418);
    assert_eq!(&res.body()[..], b"exploded");
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn unrecovered_errors_always_answer_500() {
    let router = HttpRouter::new();
    router.get(
        "/forbidden",
        handler_fn(|_req, _res| {
            Box::pin(async move { Flow::Fail(HandlerError::msg("denied").with_status(403)) })
        }),
    );

    let res = router.respond(HttpRequest::new("GET", "/forbidden")).await;
    assert_eq!(res.status_code(), 500);
    assert_eq!(res.headers()["content-type"], "application/json");
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["code"], "router.handler.failed");
    assert_eq!(body["message"], "denied");
    assert_eq!(body["status"], 500);
}

#[tokio::test]
async fn mounted_router_sees_stripped_path() {
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let api = HttpRouter::new();
    api.get(
        "/items/:id",
        handler_fn(move |req, res| {
            *sink.lock() = Some((req.path().to_owned(), req.params().get("id").cloned()));
            Box::pin(async move {
                res.send_status(200);
                Flow::Done
            })
        }),
    );
    let root = HttpRouter::new();
    root.mount("/api", api.router());

    let res = root.respond(HttpRequest::new("GET", "/api/items/42")).await;
    assert_eq!(res.status_code(), 200);
    assert_eq!(
        *seen.lock(),
        Some(("/items/42".to_owned(), Some("42".to_owned())))
    );
}

#[tokio::test]
async fn upgrade_requires_both_headers() {
    let router = HttpRouter::new();
    router.upgrade(
        "/rt",
        "realtime",
        handler_fn(|_req, res| {
            Box::pin(async move {
                res.switching_protocols("realtime");
                Flow::Done
            })
        }),
    );

    let missing_connection =
        HttpRequest::new(method::UPGRADE, "/rt").with_header("upgrade", "realtime");
    let missing_upgrade = HttpRequest::new(method::UPGRADE, "/rt").with_header("connection", "upgrade");
    let wrong_tag = HttpRequest::new(method::UPGRADE, "/rt")
        .with_header("connection", "upgrade")
        .with_header("upgrade", "websocket");
    for req in [missing_connection, missing_upgrade, wrong_tag] {
        assert_eq!(router.respond(req).await.status_code(), 404);
    }

    let accepted = HttpRequest::new("upgrade", "/rt")
        .with_header("Connection", "keep-alive, Upgrade")
        .with_header("Upgrade", "ReaLtime");
    assert_eq!(router.respond(accepted).await.status_code(), 101);
}

#[tokio::test]
async fn upgrade_layer_is_not_advertised_by_options() {
    let router = HttpRouter::new();
    router.upgrade("/rt", "realtime", done());
    router.get("/rt", done());
    let res = router.respond(HttpRequest::new("OPTIONS", "/rt")).await;
    assert_eq!(res.headers()["allow"], "GET");
}

#[test]
fn unknown_verb_is_rejected() {
    let router = HttpRouter::new();
    let err = router.on("brew", "/coffee", done()).unwrap_err();
    assert_eq!(err.code(), "router.verb.unknown");
    assert!(router.on("m-search", "/ssdp", done()).is_ok());
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn registrable_verbs() -> Vec<&'static str> {
    method::VERBS
        .iter()
        .copied()
        .filter(|verb| *verb != method::OPTIONS)
        .collect()
}

proptest! {
    #[test]
    fn options_reports_exactly_the_registered_methods(
        picked in proptest::sample::subsequence(registrable_verbs(), 1..8),
        path in "/[a-z]{1,6}(/[a-z]{1,6}){0,2}",
    ) {
        let router = HttpRouter::new();
        for verb in picked.iter().rev() {
            router.on(verb, &path, done()).unwrap();
        }
        let res = runtime().block_on(router.respond(HttpRequest::new("options", &path)));

        let mut expected: Vec<&str> = picked.clone();
        expected.sort_unstable();
        let expected = expected.join(", ");
        prop_assert_eq!(res.status_code().as_u16(), 200);
        prop_assert_eq!(res.headers()["allow"].to_str().unwrap(), expected.as_str());
        prop_assert_eq!(&res.body()[..], expected.as_bytes());
    }

    #[test]
    fn unmatched_worker_requests_reach_the_deadend_once(
        registered in "/[a-z]{1,6}",
        requested in "/[a-z]{1,6}/[0-9]{1,3}",
        verb in proptest::sample::select(registrable_verbs()),
    ) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = WorkerRouter::new().with_deadend(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.get(&registered, worker::handler_fn(|_req, res| Box::pin(async move {
            res.send_status(200);
            Flow::Done
        })));

        let reply = runtime()
            .block_on(router.handle(WorkerRequest::new(verb, requested)))
            .unwrap();
        prop_assert!(reply.is_none());
        prop_assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
