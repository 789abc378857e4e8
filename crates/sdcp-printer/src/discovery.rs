//! SDCP printer discovery via UDP broadcast.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::config::DEFAULT_UDP_PORT;
use crate::error::{Result, SdcpError};

/// Discovery probe datagram.
pub const DISCOVERY_PROBE: &[u8] = b"M99999";

/// A device that answered the discovery probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdcpDevice {
    /// Source address of the reply.
    pub ip: IpAddr,
    /// Reply text as received.
    pub raw: String,
}

/// Fields a printer reports in its discovery reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceInfo {
    /// User-visible printer name.
    pub name: Option<String>,
    /// Model name.
    pub machine_name: Option<String>,
    /// Vendor.
    pub brand_name: Option<String>,
    /// Mainboard id.
    #[serde(rename = "MainboardID")]
    pub mainboard_id: Option<String>,
    /// Address the printer reports for itself.
    #[serde(rename = "MainboardIP")]
    pub mainboard_ip: Option<String>,
    /// SDCP protocol version.
    pub protocol_version: Option<String>,
    /// Firmware version.
    pub firmware_version: Option<String>,
}

impl SdcpDevice {
    /// Parse the reply as a JSON discovery document.
    ///
    /// Returns `None` when the reply is not in the expected shape.
    pub fn info(&self) -> Option<DeviceInfo> {
        let value: serde_json::Value = serde_json::from_str(&self.raw).ok()?;
        let data = value.get("Data").unwrap_or(&value);
        serde_json::from_value(data.clone()).ok()
    }
}

/// Broadcast the discovery probe on the local segment and collect replies.
pub async fn discover(timeout: Duration) -> Result<Vec<SdcpDevice>> {
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DEFAULT_UDP_PORT);
    discover_at(target, timeout).await
}

/// Send the discovery probe to `target` and collect every reply until `timeout` elapses.
///
/// Replies are returned in arrival order without de-duplication.
pub async fn discover_at(target: SocketAddr, timeout: Duration) -> Result<Vec<SdcpDevice>> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| SdcpError::Discovery(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| SdcpError::Discovery(e.to_string()))?;

    socket
        .send_to(DISCOVERY_PROBE, target)
        .await
        .map_err(|e| SdcpError::Discovery(e.to_string()))?;
    tracing::debug!(%target, "sent discovery probe");

    let deadline = Instant::now() + timeout;
    let mut devices = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
                tracing::debug!(ip = %addr.ip(), "discovery reply");
                devices.push(SdcpDevice { ip: addr.ip(), raw });
            }
            Ok(Err(e)) => return Err(SdcpError::Discovery(e.to_string())),
            Err(_) => break,
        }
    }

    Ok(devices)
}
