//! 客户端侧的 HTTP 协议升级：把一次 `GET` 握手变成双工 RPC 通道。

use bytes::Bytes;
use http::{Request, StatusCode, header};
use http_body_util::Empty;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use crate::{endpoint::RPC_UPGRADE_PROTOCOL, error::ConnectError};

/// 向 `url` 发起升级握手，成功后返回可直接用于 RPC 连接的 I/O。
pub async fn connect(url: &Url) -> Result<TokioIo<Upgraded>, ConnectError> {
    let invalid = |reason: &str| ConnectError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_owned(),
    };
    if !matches!(url.scheme(), "http" | "ws") {
        return Err(invalid("scheme must be http or ws"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .unwrap_or(80);
    let authority = format!("{host}:{port}");

    let stream = TcpStream::connect(&authority).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(target: "spark_rpc", error = %err, "upgrade client connection ended");
        }
    });

    let target = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    };
    let request = Request::get(target)
        .header(header::HOST, &authority)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, RPC_UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())?;
    trace!(target: "spark_rpc", %url, "sending upgrade request");
    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ConnectError::Rejected {
            status: response.status().as_u16(),
        });
    }
    let upgraded = hyper::upgrade::on(response).await?;
    debug!(target: "spark_rpc", %url, "rpc channel upgraded");
    Ok(TokioIo::new(upgraded))
}
