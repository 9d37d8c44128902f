//! A scripted control socket used by unit tests.

use std::{convert::Infallible, path::Path};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{net::UnixListener, sync::mpsc, task::JoinHandle};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A request received by [`MockControlSocket`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) body: Vec<u8>,
}

/// Answers every request on a unix socket with the same status and body.
pub(crate) struct MockControlSocket {
    requests: mpsc::UnboundedReceiver<RecordedRequest>,
    handle: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MockControlSocket {
    pub(crate) fn start(path: &Path, status: u16, body: &str) -> anyhow::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let status = StatusCode::from_u16(status)?;
        let body = Bytes::from(body.to_string());
        let (tx, requests) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let body = body.clone();
                let service = service_fn(move |request: Request<Incoming>| {
                    let tx = tx.clone();
                    let body = body.clone();
                    async move {
                        let _ = tx.send(RecordedRequest::read(request).await);
                        let mut response = Response::new(Full::new(body));
                        *response.status_mut() = status;
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                        Ok::<_, Infallible>(response)
                    }
                });

                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(Self { requests, handle })
    }

    pub(crate) async fn next_request(&mut self) -> anyhow::Result<RecordedRequest> {
        self.requests
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("mock control socket closed"))
    }

    pub(crate) fn try_next_request(&mut self) -> Option<RecordedRequest> {
        self.requests.try_recv().ok()
    }
}

impl RecordedRequest {
    async fn read(request: Request<Incoming>) -> Self {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(_) => Vec::new(),
        };

        Self {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            body,
        }
    }

    pub(crate) fn json(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for MockControlSocket {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
