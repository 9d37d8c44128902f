use std::{
    error::Error as StdError,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Uri};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde::Serialize;
use tokio::{net::UnixStream, time::Instant};

use crate::{FirewardError, FirewardResult};

use super::{
    ActionType, ApiFault, BootSource, Drive, InstanceActionInfo, Logger, MachineConfiguration,
    Metrics, MmdsConfig, NetworkInterface, Vsock,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SOCKET_POLL_INITIAL_DELAY: Duration = Duration::from_millis(10);

const SOCKET_POLL_MAX_DELAY: Duration = Duration::from_millis(200);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Routes every request to a fixed unix socket, whatever the URI says.
#[derive(Debug, Clone)]
struct UnixConnector {
    socket_path: PathBuf,
}

/// HTTP client for the control API of a single hypervisor.
///
/// Speaks HTTP/1.1 over the instance's unix socket. Requests carry a `localhost` host that the
/// connector ignores.
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerClient {
    /// Creates a client for the control socket at `socket_path`. No connection is made yet.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        let connector = UnixConnector {
            socket_path: socket_path.clone(),
        };

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            socket_path,
        }
    }

    /// Returns the control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Submits an instance action.
    pub async fn instance_action(&self, action: ActionType) -> FirewardResult<()> {
        self.put("/actions", &InstanceActionInfo::new(action)).await
    }

    /// Replaces the metadata store with `data`.
    pub async fn put_mmds(&self, data: &serde_json::Value) -> FirewardResult<()> {
        self.put("/mmds", data).await
    }

    /// Merges `data` into the metadata store.
    pub async fn patch_mmds(&self, data: &serde_json::Value) -> FirewardResult<()> {
        self.send(Method::PATCH, "/mmds", data).await
    }

    /// Configures the metadata service.
    pub async fn put_mmds_config(&self, config: &MmdsConfig) -> FirewardResult<()> {
        self.put("/mmds/config", config).await
    }

    /// Sets vCPU and memory sizing.
    pub async fn put_machine_config(&self, config: &MachineConfiguration) -> FirewardResult<()> {
        self.put("/machine-config", config).await
    }

    /// Sets the kernel image and command line.
    pub async fn put_boot_source(&self, source: &BootSource) -> FirewardResult<()> {
        self.put("/boot-source", source).await
    }

    /// Attaches a block device.
    pub async fn put_drive(&self, drive: &Drive) -> FirewardResult<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    /// Attaches a network interface.
    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> FirewardResult<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    /// Attaches a vsock device.
    pub async fn put_vsock(&self, vsock: &Vsock) -> FirewardResult<()> {
        self.put("/vsock", vsock).await
    }

    /// Configures the hypervisor logger.
    pub async fn put_logger(&self, logger: &Logger) -> FirewardResult<()> {
        self.put("/logger", logger).await
    }

    /// Configures the metrics pipe.
    pub async fn put_metrics(&self, metrics: &Metrics) -> FirewardResult<()> {
        self.put("/metrics", metrics).await
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> FirewardResult<()> {
        self.send(Method::PUT, path, body).await
    }

    async fn send(&self, method: Method, path: &str, body: &impl Serialize) -> FirewardResult<()> {
        let uri: Uri = format!("http://localhost{path}")
            .parse()
            .map_err(|e| FirewardError::Http(format!("invalid request path {path}: {e}")))?;

        let body = serde_json::to_vec(body)?;
        tracing::debug!("{} {} on {}", method, path, self.socket_path.display());

        let request = hyper::Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Host", "localhost")
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| FirewardError::Http(e.to_string()))?;

        let response = self.client.request(request).await.map_err(|e| {
            if is_unreachable(&e) {
                FirewardError::ControlSocketUnavailable(self.socket_path.clone())
            } else {
                FirewardError::Http(format!("{method} {path} failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FirewardError::Http(format!("failed to read response body: {e}")))?
            .to_bytes();

        if status.is_success() {
            return Ok(());
        }

        let fault: ApiFault = serde_json::from_slice(&body).unwrap_or_else(|_| ApiFault {
            fault_message: String::from_utf8_lossy(&body).into_owned(),
        });

        Err(FirewardError::ControlApi {
            status: status.as_u16(),
            message: fault.fault_message,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Polls until the control socket accepts connections or `timeout` elapses.
pub async fn wait_for_socket(socket_path: &Path, timeout: Duration) -> FirewardResult<()> {
    let deadline = Instant::now() + timeout;
    let mut delay = SOCKET_POLL_INITIAL_DELAY;

    loop {
        match UnixStream::connect(socket_path).await {
            Ok(_) => {
                tracing::debug!("control socket {} is ready", socket_path.display());
                return Ok(());
            }
            Err(e) => {
                tracing::trace!("control socket {} not ready: {}", socket_path.display(), e);
            }
        }

        if Instant::now() + delay > deadline {
            return Err(FirewardError::ControlSocketUnavailable(
                socket_path.to_path_buf(),
            ));
        }

        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, SOCKET_POLL_MAX_DELAY);
    }
}

/// Walks the error chain looking for a refused or vanished socket.
fn is_unreachable(error: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) {
                return true;
            }
        }
        source = err.source();
    }

    false
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl tower::Service<Uri> for UnixConnector {
    type Response = hyper_util::rt::TokioIo<UnixStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.socket_path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(&path).await?;
            Ok(hyper_util::rt::TokioIo::new(stream))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
