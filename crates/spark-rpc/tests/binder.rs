//! 绑定器端到端行为：内存双工通道与真实 HTTP 升级两种传输。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::{Value, json};
use spark_router::HttpRouter;
use spark_rpc::{
    BindError, DualMetadata, Endpoint, Implementation, Meta, MetaError, RemoteProxy, RpcError,
    create_server_from_meta,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::oneshot,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use url::Url;

fn content_meta() -> Meta {
    Meta::builder()
        .server_two_way("echo")
        .server_two_way("hang")
        .server_one_way("announce")
        .client_two_way("getContent")
        .client_one_way("ready")
        .build()
        .unwrap()
}

fn server_impl(announced: Arc<AtomicUsize>) -> Implementation {
    Implementation::new()
        .two_way("echo", |params, _connection| async move { Ok(params) })
        .two_way("hang", |_params, _connection| async move {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        })
        .one_way("announce", move |_params, _connection| {
            let announced = Arc::clone(&announced);
            async move {
                announced.fetch_add(1, Ordering::SeqCst);
            }
        })
}

fn client_impl(local_calls: Arc<AtomicUsize>) -> Implementation {
    Implementation::new().two_way("getContent", move |params, _connection| {
        local_calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!({ "served": params })) }
    })
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn two_way_calls_travel_both_directions() {
    let announced = Arc::new(AtomicUsize::new(0));
    let client_calls = Arc::new(AtomicUsize::new(0));
    let meta = content_meta();

    let endpoint = Endpoint::new();
    let server = create_server_from_meta(meta.clone())
        .bind_endpoint(endpoint.clone(), server_impl(Arc::clone(&announced)))
        .unwrap();
    assert!(server.has_stub("getContent"));
    assert!(server.has_stub("ready"));

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server_side = endpoint.accept(server_io);
    let client = meta
        .create_client(client_impl(Arc::clone(&client_calls)))
        .connect_io(client_io);

    let echoed = timeout(WAIT, client.proxy().call("echo", json!({ "n": 1 })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, json!({ "n": 1 }));

    client.proxy().notify("announce", Value::Null).unwrap();

    let (tx, rx) = oneshot::channel();
    server
        .call_with("getContent", json!("/index"), move |replies| {
            let _ = tx.send(replies);
        })
        .unwrap();
    let replies = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(replies, vec![Ok(json!({ "served": "/index" }))]);
    assert_eq!(client_calls.load(Ordering::SeqCst), 1);

    let typed: RemoteProxy = server.proxy(server_side.clone());
    let reply = timeout(WAIT, typed.call("getContent", json!("/typed")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({ "served": "/typed" }));

    timeout(WAIT, async {
        while announced.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn client_capabilities_are_not_served_by_the_server() {
    let meta = content_meta();
    let endpoint = Endpoint::new();
    let _server = create_server_from_meta(meta.clone())
        .bind_endpoint(endpoint.clone(), server_impl(Arc::new(AtomicUsize::new(0))))
        .unwrap();
    let client_calls = Arc::new(AtomicUsize::new(0));
    let (server_io, client_io) = tokio::io::duplex(4096);
    endpoint.accept(server_io);
    let client = meta
        .create_client(client_impl(Arc::clone(&client_calls)))
        .connect_io(client_io);

    let refused = client.proxy().call("getContent", Value::Null).await.unwrap_err();
    assert_eq!(refused.numeric_code(), RpcError::NOT_DECLARED);

    let raw = timeout(WAIT, client.connection().request("getContent", Value::Null))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(raw.code(), "rpc.method.not_found");
    assert_eq!(client_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_fails_outstanding_calls() {
    let meta = content_meta();
    let endpoint = Endpoint::new();
    create_server_from_meta(meta.clone())
        .bind_endpoint(endpoint.clone(), server_impl(Arc::new(AtomicUsize::new(0))))
        .unwrap();
    let (server_io, client_io) = tokio::io::duplex(4096);
    endpoint.accept(server_io);
    let client = meta.create_client(Implementation::new()).connect_io(client_io);

    let pending = {
        let proxy = client.proxy().clone();
        tokio::spawn(async move { proxy.call("hang", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.connection().close();

    let outcome = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap_err().numeric_code(), RpcError::CONNECTION_CLOSED);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_frames_close_the_connection() {
    let endpoint = Endpoint::with_max_frame_length(64);
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let connection = endpoint.accept(server_io);
    let (peer_read, mut peer_write) = tokio::io::split(peer_io);

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.request("getContent", Value::Null).await })
    };
    let mut request = String::new();
    timeout(WAIT, BufReader::new(peer_read).read_line(&mut request))
        .await
        .unwrap()
        .unwrap();
    assert!(request.contains("getContent"));

    peer_write.write_all("x".repeat(200).as_bytes()).await.unwrap();
    peer_write.flush().await.unwrap();

    let outcome = timeout(WAIT, pending).await.unwrap().unwrap();
    let err = outcome.unwrap_err();
    assert_eq!(err.numeric_code(), RpcError::FRAME_TOO_LARGE);
    assert_eq!(err.code(), "rpc.frame.too_large");
    timeout(WAIT, connection.closed()).await.unwrap();
    assert!(connection.is_closed());
}

#[test]
fn missing_server_implementation_is_rejected() {
    let meta = content_meta();
    let err = create_server_from_meta(meta)
        .bind_endpoint(Endpoint::new(), Implementation::new())
        .unwrap_err();
    assert!(matches!(err, BindError::MissingImplementation { .. }));
    assert_eq!(err.code(), "rpc.bind.missing_implementation");
}

#[test]
fn dual_metadata_is_the_union_of_both_descriptors() {
    let module = Meta::builder()
        .server_two_way("module")
        .server_one_way("master")
        .client_one_way("ready")
        .build()
        .unwrap();
    let router = Meta::builder()
        .server_one_way("register")
        .client_two_way("getContent")
        .build()
        .unwrap();

    let dual = DualMetadata::new(module, router).unwrap();
    let merged = dual.meta();
    assert_eq!(merged.server_one_way(), ["master", "register"]);
    assert_eq!(merged.server_two_way(), ["module"]);
    assert_eq!(merged.client_one_way(), ["ready"]);
    assert_eq!(merged.client_two_way(), ["getContent"]);

    let mut names: Vec<&str> = merged.names().collect();
    let total = names.len();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), total);
}

#[test]
fn dual_metadata_rejects_overlapping_names() {
    let a = Meta::builder().server_two_way("getConfig").build().unwrap();
    let b = Meta::builder().client_two_way("getConfig").build().unwrap();
    let err = DualMetadata::new(a, b).unwrap_err();
    assert_eq!(
        err,
        MetaError::OverlappingCapability {
            name: "getConfig".into()
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn http_upgrade_carries_the_rpc_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = HttpRouter::new();
    let meta = content_meta();
    let dual = DualMetadata::new(meta, Meta::builder().server_two_way("ping").build().unwrap()).unwrap();
    let server = dual
        .create_server(
            &router,
            "/api/manage",
            server_impl(Arc::new(AtomicUsize::new(0))),
            Implementation::new().two_way("ping", |_p, _c| async move { Ok(json!("pong")) }),
        )
        .unwrap();

    let shutdown = CancellationToken::new();
    let serving = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { router.attach_to(listener, shutdown).await })
    };

    let url = Url::parse(&format!("http://{addr}/api/manage")).unwrap();
    let client_calls = Arc::new(AtomicUsize::new(0));
    let client = timeout(
        WAIT,
        dual.create_client(client_impl(Arc::clone(&client_calls)), Implementation::new())
            .connect(&url),
    )
    .await
    .unwrap()
    .unwrap();

    let (module_side, ping_side) = client.proxy();
    assert_eq!(
        timeout(WAIT, ping_side.call("ping", Value::Null)).await.unwrap().unwrap(),
        json!("pong")
    );
    assert_eq!(
        timeout(WAIT, module_side.call("echo", json!([1, 2]))).await.unwrap().unwrap(),
        json!([1, 2])
    );

    timeout(WAIT, async {
        while server.endpoint().connections().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let replies = timeout(WAIT, server.call("getContent", json!("/x")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replies, vec![Ok(json!({ "served": "/x" }))]);

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}
