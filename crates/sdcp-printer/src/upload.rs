//! G-code upload: protocol pull transfer with an HTTP push fallback.
//!
//! The pull path serves the file from a local [`FileServer`] and tells the
//! printer to fetch it (Cmd 256), then watches the status queue for the
//! transfer's terminal state. When that fails, the push path tries a matrix
//! of conventional upload endpoints until one answers with a 2xx status.
//!
//! Transfer status is matched by filename only, so two concurrent uploads of
//! identically named files cannot be told apart.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{Result, SdcpError};
use crate::file_server::{local_ip_for, FileServer};
use crate::protocol::{Command, Envelope};
use crate::router::StatusQueue;
use crate::status::{FileTransferInfo, TransferState};
use crate::transport::Connection;

/// Endpoint name reported for pull transfers.
pub const PULL_ENDPOINT: &str = "sdcp:256";

/// Everything the printer needs to pull one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Local file.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// MD5 digest, lowercase hex.
    pub md5: String,
    /// Name the printer stores the file under.
    pub filename: String,
    /// URL the file is served at.
    pub url: String,
}

impl TransferDescriptor {
    /// Payload of the pull-upload command.
    pub fn to_payload(&self) -> Value {
        json!({
            "Check": 0,
            "CleanCache": 1,
            "Compress": 0,
            "FileSize": self.size,
            "Filename": self.filename,
            "MD5": self.md5,
            "URL": self.url,
        })
    }
}

/// How an upload completed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// The printer pulled the file.
    Pulled {
        /// Response to the pull-upload command.
        ack: Value,
        /// Status message reporting completion.
        transfer: Value,
    },
    /// A push endpoint accepted the file.
    Pushed {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    /// `sdcp:256` for pull transfers, the URL for pushes.
    pub endpoint: String,
    /// What happened.
    pub outcome: TransferOutcome,
}

/// Request encoding used by a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEncoding {
    /// `multipart/form-data` POST with a `file` field.
    Multipart,
    /// PUT with the raw file as body.
    RawPut,
    /// POST with JSON metadata only.
    JsonPost,
}

impl PushEncoding {
    /// Every encoding, in the order they are tried.
    pub const ALL: [PushEncoding; 3] = [Self::Multipart, Self::RawPut, Self::JsonPost];
}

impl fmt::Display for PushEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multipart => f.write_str("POST multipart"),
            Self::RawPut => f.write_str("PUT"),
            Self::JsonPost => f.write_str("POST json"),
        }
    }
}

/// What a push attempt got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The endpoint answered with this status.
    Status(u16),
    /// The request failed before a response arrived.
    Error(String),
}

/// One push attempt, kept for the aggregated error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAttempt {
    /// Request URL without query.
    pub url: String,
    /// Encoding used.
    pub encoding: PushEncoding,
    /// Result.
    pub outcome: AttemptOutcome,
}

impl fmt::Display for PushAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Status(code) => write!(f, "{} {} ({code})", self.encoding, self.url),
            AttemptOutcome::Error(e) => write!(f, "{} {} (error: {e})", self.encoding, self.url),
        }
    }
}

/// Size and MD5 of a file, read in chunks.
pub async fn hash_file(path: &Path) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// Final path component, used as the name on the printer.
pub fn target_filename(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            SdcpError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no file name in {}", path.display()),
            ))
        })
}

/// Pull transfer: serve the file and have the printer fetch it.
pub(crate) async fn pull_upload(
    connection: &Connection,
    mainboard_id: &str,
    printer_ip: IpAddr,
    file_path: &Path,
    config: &ClientConfig,
) -> Result<UploadReport> {
    let filename = target_filename(file_path)?;
    let (size, md5) = hash_file(file_path).await?;
    let host = local_ip_for(printer_ip).await?;
    let server = FileServer::start(file_path, &filename, host).await?;

    let descriptor = TransferDescriptor {
        path: file_path.to_path_buf(),
        size,
        md5,
        filename,
        url: server.url(),
    };
    tracing::info!(url = %descriptor.url, size, "starting pull transfer");

    let result = request_pull(connection, mainboard_id, &descriptor, config).await;
    server.stop().await;
    result
}

async fn request_pull(
    connection: &Connection,
    mainboard_id: &str,
    descriptor: &TransferDescriptor,
    config: &ClientConfig,
) -> Result<UploadReport> {
    let envelope = Envelope::new(
        Command::UploadFile.code(),
        descriptor.to_payload(),
        Some(mainboard_id),
    );
    // Only status pushed after the request can describe this transfer.
    let stale = connection.status_queue().clear();
    if stale > 0 {
        tracing::debug!(stale, "discarded queued status before pull transfer");
    }
    let ack = connection
        .send_request(&envelope, config.upload_command_timeout)
        .await?;
    let transfer = wait_for_transfer(
        connection.status_queue(),
        &descriptor.filename,
        config.transfer_timeout,
    )
    .await?;

    Ok(UploadReport {
        endpoint: PULL_ENDPOINT.into(),
        outcome: TransferOutcome::Pulled { ack, transfer },
    })
}

/// Read status messages until the transfer of `filename` ends or `timeout` elapses.
///
/// Messages about other files are discarded.
pub async fn wait_for_transfer(
    queue: &StatusQueue,
    filename: &str,
    timeout: Duration,
) -> Result<Value> {
    let deadline = Instant::now() + timeout;
    let timed_out = || SdcpError::TransferTimeout {
        filename: filename.to_string(),
        timeout,
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        let Some(status) = queue.pop(remaining).await? else {
            return Err(timed_out());
        };
        let Some(info) = status.pointer("/Status/FileTransferInfo") else {
            continue;
        };
        let info = FileTransferInfo::from_value(info);
        if info.filename.as_deref().is_some_and(|name| name != filename) {
            continue;
        }

        match info.state {
            TransferState::Completed => {
                tracing::info!(filename, "printer finished pulling file");
                return Ok(status);
            }
            TransferState::Failed => {
                return Err(SdcpError::TransferFailed {
                    filename: filename.to_string(),
                    detail: format!(
                        "printer reported failure at {} of {} bytes",
                        info.download_offset, info.total_size
                    ),
                });
            }
            state => {
                tracing::debug!(
                    filename,
                    ?state,
                    offset = info.download_offset,
                    total = info.total_size,
                    "transfer progress"
                );
            }
        }
    }
}

fn base_url(ip: IpAddr, port: u16) -> String {
    match (ip, port) {
        (IpAddr::V4(v4), 80) => format!("http://{v4}"),
        (IpAddr::V6(v6), 80) => format!("http://[{v6}]"),
        _ => format!("http://{}", SocketAddr::new(ip, port)),
    }
}

/// Push fallback: try every port × endpoint × encoding until one answers 2xx.
///
/// `pull_error` is why the pull transfer was abandoned; it is kept in the
/// aggregated error when every attempt fails.
pub async fn push_upload(
    printer_ip: IpAddr,
    file_path: &Path,
    dest_dir: &str,
    config: &ClientConfig,
    pull_error: Option<SdcpError>,
) -> Result<UploadReport> {
    let filename = target_filename(file_path)?;
    let data = Bytes::from(tokio::fs::read(file_path).await?);
    let http = reqwest::Client::builder()
        .timeout(config.push_attempt_timeout)
        .build()?;

    let mut attempts = Vec::new();
    for &port in &config.push_ports {
        let base = base_url(printer_ip, port);
        for endpoint in &config.push_endpoints {
            let url = format!("{base}{}", endpoint.path);
            for encoding in PushEncoding::ALL {
                let request = match encoding {
                    PushEncoding::Multipart => {
                        let part = Part::stream_with_length(data.clone(), data.len() as u64)
                            .file_name(filename.clone())
                            .mime_str("application/octet-stream")?;
                        http.post(&url)
                            .query(&[(endpoint.dir_param.as_str(), dest_dir)])
                            .multipart(Form::new().part("file", part))
                    }
                    PushEncoding::RawPut => http
                        .put(&url)
                        .query(&[("path", dest_dir), ("filename", filename.as_str())])
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                        .body(data.clone()),
                    PushEncoding::JsonPost => http
                        .post(&url)
                        .json(&json!({ "path": dest_dir, "filename": filename })),
                };

                let outcome = match request.send().await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            let body = match response.text().await {
                                Ok(body) => body,
                                Err(e) => {
                                    tracing::debug!(%url, "could not read push response body: {e}");
                                    format!("<unreadable body: {e}>")
                                }
                            };
                            tracing::info!(%url, %encoding, status = status.as_u16(), "push upload accepted");
                            return Ok(UploadReport {
                                endpoint: url,
                                outcome: TransferOutcome::Pushed {
                                    status: status.as_u16(),
                                    body,
                                },
                            });
                        }
                        AttemptOutcome::Status(status.as_u16())
                    }
                    Err(e) => AttemptOutcome::Error(e.to_string()),
                };
                tracing::debug!(%url, %encoding, ?outcome, "push attempt failed");
                attempts.push(PushAttempt {
                    url: url.clone(),
                    encoding,
                    outcome,
                });
            }
        }
    }

    Err(SdcpError::UploadExhausted {
        attempts,
        pull_error: pull_error.map(Box::new),
    })
}
