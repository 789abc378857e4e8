//! High-level SDCP printer client.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::config::ClientConfig;
use crate::discovery::{self, SdcpDevice};
use crate::error::{Result, SdcpError};
use crate::mqtt::{self, MqttSettings};
use crate::protocol::{Command, Envelope, PrintOptions};
use crate::status::MainboardIdentity;
use crate::transport::Connection;
use crate::upload::{self, UploadReport};
use crate::websocket;

/// Client for one SDCP printer.
///
/// All request methods take `&self`, so several commands may be in flight
/// at once; each is matched to its response by correlation id.
pub struct SdcpClient {
    ip: IpAddr,
    config: ClientConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    mainboard: RwLock<Option<MainboardIdentity>>,
}

impl SdcpClient {
    /// Client for the printer at `ip` with default settings.
    pub fn new(ip: IpAddr) -> Self {
        Self::with_config(ip, ClientConfig::default())
    }

    /// Client for the printer at `ip`.
    pub fn with_config(ip: IpAddr, config: ClientConfig) -> Self {
        Self {
            ip,
            config,
            connection: RwLock::new(None),
            mainboard: RwLock::new(None),
        }
    }

    /// Broadcast a discovery probe; see [`discovery::discover`].
    pub async fn discover(timeout: Duration) -> Result<Vec<SdcpDevice>> {
        discovery::discover(timeout).await
    }

    /// Printer address.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the WebSocket channel using the configured candidates.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(&self.config.ws_ports, &self.config.ws_paths)
            .await
    }

    /// Open the WebSocket channel, probing `ports` × `paths` in order.
    ///
    /// Empty lists fall back to the configured candidates.
    pub async fn connect_with(&self, ports: &[u16], paths: &[String]) -> Result<()> {
        let ports = if ports.is_empty() { &self.config.ws_ports[..] } else { ports };
        let paths = if paths.is_empty() { &self.config.ws_paths[..] } else { paths };

        let connection =
            websocket::connect(self.ip, ports, paths, self.config.handshake_timeout).await?;
        self.install(connection).await;
        Ok(())
    }

    /// Tell the printer which MQTT broker port to use.
    pub async fn register_mqtt_broker(&self, broker_port: u16) -> Result<()> {
        mqtt::register_broker(SocketAddr::new(self.ip, self.config.udp_port), broker_port).await
    }

    /// Use an MQTT broker as the control channel.
    ///
    /// The mainboard id addresses the broker topics and becomes the client's identity.
    pub async fn connect_mqtt(
        &self,
        broker_host: &str,
        broker_port: u16,
        mainboard_id: &str,
    ) -> Result<()> {
        let mut settings = MqttSettings::new(broker_host, broker_port, mainboard_id);
        settings.keep_alive = self.config.mqtt_keep_alive;
        settings.connect_timeout = self.config.mqtt_connect_timeout;

        let connection = mqtt::connect(settings).await?;
        {
            let mut mainboard = self.mainboard.write();
            if mainboard.as_ref().map(|m| m.id.as_str()) != Some(mainboard_id) {
                *mainboard = Some(MainboardIdentity::new(mainboard_id));
            }
        }
        self.install(connection).await;
        Ok(())
    }

    async fn install(&self, connection: Connection) {
        let previous = self.connection.write().replace(Arc::new(connection));
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Close the channel. Safe to call any number of times.
    ///
    /// Pending requests fail with `ConnectionClosed` and queued status is discarded.
    pub async fn close(&self) {
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Whether a channel is open.
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Endpoint of the open channel.
    pub fn endpoint(&self) -> Option<String> {
        self.connection.read().as_ref().map(|c| c.endpoint())
    }

    /// Mainboard identity, once learned.
    pub fn mainboard(&self) -> Option<MainboardIdentity> {
        self.mainboard.read().clone()
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.connection
            .read()
            .as_ref()
            .map_or(0, |c| c.pending_requests())
    }

    /// Status messages not yet consumed.
    pub fn queued_status(&self) -> usize {
        self.connection
            .read()
            .as_ref()
            .map_or(0, |c| c.status_queue().len())
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .read()
            .as_ref()
            .cloned()
            .ok_or(SdcpError::NotConnected)
    }

    fn mainboard_id(&self) -> Option<String> {
        self.mainboard.read().as_ref().map(|m| m.id.clone())
    }

    /// Send a command and wait up to `timeout` for its response.
    pub async fn send_command(&self, code: u16, payload: Value, timeout: Duration) -> Result<Value> {
        let connection = self.connection()?;
        let envelope = Envelope::new(code, payload, self.mainboard_id().as_deref());
        connection.send_request(&envelope, timeout).await
    }

    async fn command(&self, command: Command, payload: Value) -> Result<Value> {
        self.send_command(command.code(), payload, self.config.command_timeout)
            .await
    }

    /// Cmd 0: request a status push.
    pub async fn get_status(&self) -> Result<Value> {
        self.command(Command::Status, Value::Null).await
    }

    /// Cmd 1: request device attributes and remember the mainboard identity.
    pub async fn get_attributes(&self) -> Result<Value> {
        let response = self.command(Command::Attributes, Value::Null).await?;
        if let Some(identity) = MainboardIdentity::from_response(&response) {
            tracing::info!(mainboard_id = %identity.id, "learned mainboard identity");
            *self.mainboard.write() = Some(identity);
        }
        Ok(response)
    }

    /// Cmd 258: list files under `directory` (`/local` on most firmware).
    pub async fn list_files(&self, directory: &str) -> Result<Value> {
        self.command(Command::ListFiles, json!({ "Url": directory }))
            .await
    }

    /// Cmd 128: start printing `filename` with default options.
    pub async fn start_print(&self, filename: &str) -> Result<Value> {
        self.start_print_with(filename, &PrintOptions::default())
            .await
    }

    /// Cmd 128: start printing `filename`.
    pub async fn start_print_with(&self, filename: &str, options: &PrintOptions) -> Result<Value> {
        self.command(Command::StartPrint, options.to_payload(filename))
            .await
    }

    /// Cmd 129: pause the current print.
    pub async fn pause_print(&self) -> Result<Value> {
        self.command(Command::PausePrint, Value::Null).await
    }

    /// Cmd 130: stop the current print.
    pub async fn stop_print(&self) -> Result<Value> {
        self.command(Command::StopPrint, Value::Null).await
    }

    /// Cmd 131: resume a paused print.
    pub async fn resume_print(&self) -> Result<Value> {
        self.command(Command::ResumePrint, Value::Null).await
    }

    /// Cmd 403: switch the light.
    pub async fn set_light(&self, on: bool) -> Result<Value> {
        self.command(
            Command::SetLight,
            json!({ "LightStatus": { "SecondLight": on } }),
        )
        .await
    }

    /// Cmd 259: not implemented.
    pub async fn delete_files(&self, _files: &[String]) -> Result<Value> {
        Err(SdcpError::NotSupported("delete files (Cmd 259)"))
    }

    /// Cmd 386: not implemented.
    pub async fn enable_video_stream(&self, _enable: bool) -> Result<Value> {
        Err(SdcpError::NotSupported("video stream (Cmd 386)"))
    }

    /// Wait up to `timeout` for the next unsolicited status message.
    pub async fn wait_for_status(&self, timeout: Duration) -> Result<Value> {
        let connection = self.connection()?;
        connection
            .status_queue()
            .pop(timeout)
            .await?
            .ok_or(SdcpError::CommandTimeout {
                code: Command::Status.code(),
                timeout,
            })
    }

    /// Upload a G-code file: pull transfer first, push endpoints if that fails.
    pub async fn upload(&self, file_path: impl AsRef<Path>, dest_dir: &str) -> Result<UploadReport> {
        let file_path = file_path.as_ref();
        self.connection()?;

        let pull_error = match self.upload_via_pull(file_path).await {
            Ok(report) => return Ok(report),
            Err(e) => e,
        };
        tracing::warn!("SDCP upload failed, falling back to HTTP endpoints: {pull_error}");

        upload::push_upload(self.ip, file_path, dest_dir, &self.config, Some(pull_error)).await
    }

    /// Cmd 256: have the printer pull `file_path` from a temporary local server.
    pub async fn upload_via_pull(&self, file_path: impl AsRef<Path>) -> Result<UploadReport> {
        let connection = self.connection()?;
        let mainboard_id = self.mainboard_id().ok_or(SdcpError::MissingMainboardId)?;
        upload::pull_upload(
            &connection,
            &mainboard_id,
            self.ip,
            file_path.as_ref(),
            &self.config,
        )
        .await
    }
}
