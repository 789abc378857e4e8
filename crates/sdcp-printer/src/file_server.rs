//! Single-file HTTP server for pull transfers.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Result;

struct ServedFile {
    path: PathBuf,
    name: String,
}

/// Serves one file under one name on an ephemeral port until stopped or dropped.
pub struct FileServer {
    addr: SocketAddr,
    name: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FileServer {
    /// Bind to `host` on an ephemeral port and start serving `path` as `name`.
    pub async fn start(path: &Path, name: &str, host: IpAddr) -> Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let addr = listener.local_addr()?;
        let file = Arc::new(ServedFile {
            path: path.to_path_buf(),
            name: name.to_string(),
        });
        let app = Router::new().fallback(serve_file).with_state(file);

        let (shutdown, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = stopped.await;
            });
            if let Err(e) = server.await {
                tracing::warn!(%addr, "file server failed: {e}");
            }
        });
        tracing::debug!(%addr, name, "file server started");

        Ok(Self {
            addr,
            name: name.to_string(),
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL the printer should fetch.
    pub fn url(&self) -> String {
        format!("http://{}/{}", self.addr, urlencoding::encode(&self.name))
    }

    /// Stop serving and wait briefly for in-flight responses.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        tracing::debug!(addr = %self.addr, "file server stopped");
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn serve_file(State(file): State<Arc<ServedFile>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let segment = uri.path().rsplit('/').next().unwrap_or_default();
    match urlencoding::decode(segment) {
        Ok(requested) if requested == file.name => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    match tokio::fs::read(&file.path).await {
        Ok(bytes) => {
            tracing::debug!(path = uri.path(), len = bytes.len(), "serving file");
            ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response()
        }
        Err(e) => {
            tracing::warn!(path = %file.path.display(), "cannot read served file: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Local address the OS would use to reach `peer`.
pub async fn local_ip_for(peer: IpAddr) -> Result<IpAddr> {
    let bind: SocketAddr = if peer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect((peer, 1)).await?;
    Ok(socket.local_addr()?.ip())
}
