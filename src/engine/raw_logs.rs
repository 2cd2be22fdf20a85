// Raw framed log bytes over the engine's Unix socket.
//
// The typed client demultiplexes log frames internally; the fabric owns
// demuxing (per-read deadlines, size validation, protocol-error recovery),
// so this endpoint alone is fetched as plain HTTP over the socket.

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use super::{ByteStream, LogStreamOptions};
use crate::error::EngineError;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Socket path per the standard engine environment. Non-unix DOCKER_HOST
/// schemes fall back to the default socket; this daemon is local-engine only.
pub(super) fn socket_path_from_env() -> String {
    match std::env::var("DOCKER_HOST") {
        Ok(host) => match host.strip_prefix("unix://") {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => DEFAULT_SOCKET.to_string(),
        },
        Err(_) => DEFAULT_SOCKET.to_string(),
    }
}

pub(super) async fn open(
    socket_path: &str,
    id: &str,
    opts: LogStreamOptions,
) -> Result<ByteStream, EngineError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| EngineError::Unavailable(format!("connect {socket_path}: {e}")))?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| EngineError::Unavailable(format!("handshake: {e}")))?;
    // The connection task serves the response body until it is dropped
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("log connection closed: {e}");
        }
    });

    let uri = format!(
        "/containers/{}/logs?follow={}&stdout={}&stderr={}&tail={}",
        id, opts.follow, opts.stdout, opts.stderr, opts.tail
    );
    let request = Request::get(uri)
        .header(hyper::header::HOST, "docker")
        .body(Empty::<Bytes>::new())
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| EngineError::Unavailable(format!("logs request: {e}")))?;

    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => return Err(EngineError::NotFound(id.to_string())),
        status => {
            return Err(EngineError::Internal(format!(
                "logs request for {id} returned {status}"
            )))
        }
    }

    let body = response
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(|e| EngineError::Unavailable(e.to_string())));
    Ok(Box::pin(body))
}
