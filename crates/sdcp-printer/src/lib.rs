#![warn(missing_docs)]

//! SDCP (ElegooLink) printer connector.
//!
//! This crate provides:
//! - UDP broadcast discovery
//! - WebSocket control channel with port/path negotiation
//! - Request/response correlation and unsolicited status delivery
//! - Optional MQTT control channel
//! - G-code upload (printer pull, with an HTTP push fallback)
//!
//! # Example
//!
//! ```ignore
//! use sdcp_printer::SdcpClient;
//! use std::time::Duration;
//!
//! let devices = SdcpClient::discover(Duration::from_secs(2)).await?;
//! let client = SdcpClient::new(devices[0].ip);
//! client.connect().await?;
//!
//! let attributes = client.get_attributes().await?;
//! let report = client.upload("plate_1.gcode", "/local").await?;
//! client.start_print("plate_1.gcode").await?;
//!
//! client.close().await;
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod file_server;
pub mod mqtt;
pub mod protocol;
pub mod router;
pub mod status;
pub mod transport;
pub mod upload;
pub mod websocket;

pub use client::SdcpClient;
pub use config::{ClientConfig, PushEndpoint};
pub use discovery::{discover, discover_at, DeviceInfo, SdcpDevice};
pub use error::{Result, SdcpError};
pub use mqtt::MqttSettings;
pub use protocol::{Command, Envelope, PrintOptions};
pub use router::{FrameRouter, InboundFrame, PendingTable, StatusQueue};
pub use status::{FileTransferInfo, MachineState, MainboardIdentity, PrinterStatus, TransferState};
pub use transport::{Connection, Transport};
pub use upload::{AttemptOutcome, PushAttempt, PushEncoding, TransferOutcome, UploadReport};
