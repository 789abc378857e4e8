//! Typed views over status and attribute payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine activity reported in `CurrentStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    /// Idle.
    Idle,
    /// Printing.
    Printing,
    /// Receiving a file.
    FileTransferring,
    /// Running an exposure test.
    ExposureTesting,
    /// Running a self test.
    DevicesTesting,
    /// Code not known to this client.
    Other(i64),
}

impl MachineState {
    /// Map an SDCP machine status code.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Printing,
            2 => Self::FileTransferring,
            3 => Self::ExposureTesting,
            4 => Self::DevicesTesting,
            other => Self::Other(other),
        }
    }
}

/// File transfer state reported in `FileTransferInfo.Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferState {
    /// No transfer.
    #[default]
    Idle,
    /// Download in progress.
    InProgress,
    /// Download finished and verified.
    Completed,
    /// Download failed.
    Failed,
    /// Code not known to this client.
    Other(u64),
}

impl TransferState {
    /// Map an SDCP transfer status code.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::InProgress,
            2 => Self::Completed,
            3 => Self::Failed,
            other => Self::Other(other),
        }
    }

    /// Whether the transfer has ended, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// File transfer progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileTransferInfo {
    /// Transfer state.
    pub state: TransferState,
    /// File being transferred.
    pub filename: Option<String>,
    /// Bytes downloaded so far.
    pub download_offset: u64,
    /// Total file size.
    pub total_size: u64,
}

impl FileTransferInfo {
    /// Parse a `FileTransferInfo` object.
    pub fn from_value(info: &Value) -> Self {
        Self {
            state: TransferState::from_code(info.get("Status").and_then(Value::as_u64).unwrap_or(0)),
            filename: info
                .get("Filename")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            download_offset: info.get("DownloadOffset").and_then(Value::as_u64).unwrap_or(0),
            total_size: info.get("FileTotalSize").and_then(Value::as_u64).unwrap_or(0),
        }
    }
}

/// Print job progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintInfo {
    /// Raw print stage code.
    pub stage: u64,
    /// Current layer.
    pub current_layer: u64,
    /// Total layers.
    pub total_layer: u64,
    /// Elapsed ticks (ms).
    pub current_ticks: u64,
    /// Estimated total ticks (ms).
    pub total_ticks: u64,
    /// File being printed.
    pub filename: Option<String>,
    /// Progress percentage, when reported.
    pub progress: Option<f64>,
}

/// Printer status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    /// Current machine activities.
    pub machine_states: Vec<MachineState>,
    /// Print job, if any fields were reported.
    pub print: Option<PrintInfo>,
    /// File transfer, if reported.
    pub transfer: Option<FileTransferInfo>,
    /// Nozzle temperature (°C).
    pub nozzle_temp: Option<f64>,
    /// Bed temperature (°C).
    pub bed_temp: Option<f64>,
    /// Enclosure temperature (°C).
    pub box_temp: Option<f64>,
}

impl PrinterStatus {
    /// Parse a status message. Accepts the full frame or its `Status` object.
    pub fn from_payload(payload: &Value) -> Self {
        let status = payload.get("Status").unwrap_or(payload);
        let mut parsed = Self::default();

        // Older firmware reports a single integer instead of a list.
        match status.get("CurrentStatus") {
            Some(Value::Array(codes)) => {
                parsed.machine_states = codes
                    .iter()
                    .filter_map(Value::as_i64)
                    .map(MachineState::from_code)
                    .collect();
            }
            Some(code) => {
                if let Some(code) = code.as_i64() {
                    parsed.machine_states = vec![MachineState::from_code(code)];
                }
            }
            None => {}
        }

        if let Some(print) = status.get("PrintInfo") {
            parsed.print = Some(PrintInfo {
                stage: print.get("Status").and_then(Value::as_u64).unwrap_or(0),
                current_layer: print.get("CurrentLayer").and_then(Value::as_u64).unwrap_or(0),
                total_layer: print.get("TotalLayer").and_then(Value::as_u64).unwrap_or(0),
                current_ticks: print.get("CurrentTicks").and_then(Value::as_u64).unwrap_or(0),
                total_ticks: print.get("TotalTicks").and_then(Value::as_u64).unwrap_or(0),
                filename: print
                    .get("Filename")
                    .and_then(Value::as_str)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
                progress: print.get("Progress").and_then(Value::as_f64),
            });
        }

        if let Some(info) = status.get("FileTransferInfo") {
            parsed.transfer = Some(FileTransferInfo::from_value(info));
        }

        parsed.nozzle_temp = status.get("TempOfNozzle").and_then(Value::as_f64);
        parsed.bed_temp = status.get("TempOfHotbed").and_then(Value::as_f64);
        parsed.box_temp = status.get("TempOfBox").and_then(Value::as_f64);

        parsed
    }

    /// Whether the printer reports itself idle.
    pub fn is_idle(&self) -> bool {
        self.machine_states.iter().all(|s| *s == MachineState::Idle)
    }
}

/// The device's self-reported identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainboardIdentity {
    /// Mainboard id.
    pub id: String,
    /// Address the device reports for itself.
    pub ip: Option<String>,
}

impl MainboardIdentity {
    /// Create an identity without a reported address.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: None,
        }
    }

    /// Find the mainboard identity in an attributes response.
    ///
    /// Firmware revisions place it at the top level, under `Data`, under
    /// `Data.Data`, or under `Attributes`.
    pub fn from_response(response: &Value) -> Option<Self> {
        let scopes = [
            Some(response),
            response.get("Data"),
            response.pointer("/Data/Data"),
            response.get("Attributes"),
        ];
        let field = |key: &str| {
            scopes
                .iter()
                .flatten()
                .find_map(|scope| {
                    scope
                        .get(key)
                        .and_then(Value::as_str)
                        .filter(|value| !value.is_empty())
                })
                .map(str::to_string)
        };

        Some(Self {
            id: field("MainboardID")?,
            ip: field("MainboardIP"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_from_frame() {
        let frame = json!({
            "Topic": "sdcp/status/B",
            "Status": {
                "CurrentStatus": [1],
                "TempOfNozzle": 212.5,
                "TempOfHotbed": 60.0,
                "PrintInfo": {
                    "Status": 3,
                    "CurrentLayer": 10,
                    "TotalLayer": 200,
                    "Filename": "benchy.gcode",
                    "Progress": 5
                },
                "FileTransferInfo": {
                    "Status": 0,
                    "DownloadOffset": 0,
                    "FileTotalSize": 0,
                    "Filename": ""
                }
            }
        });
        let status = PrinterStatus::from_payload(&frame);

        assert_eq!(status.machine_states, vec![MachineState::Printing]);
        assert!(!status.is_idle());
        assert_eq!(status.nozzle_temp, Some(212.5));
        let print = status.print.unwrap();
        assert_eq!(print.current_layer, 10);
        assert_eq!(print.filename.as_deref(), Some("benchy.gcode"));
        assert_eq!(print.progress, Some(5.0));
        let transfer = status.transfer.unwrap();
        assert_eq!(transfer.state, TransferState::Idle);
        assert_eq!(transfer.filename, None);
    }

    #[test]
    fn test_scalar_current_status() {
        let status = PrinterStatus::from_payload(&json!({"CurrentStatus": 0}));
        assert_eq!(status.machine_states, vec![MachineState::Idle]);
        assert!(status.is_idle());
    }

    #[test]
    fn test_transfer_states() {
        assert!(TransferState::from_code(2).is_terminal());
        assert!(TransferState::from_code(3).is_terminal());
        assert!(!TransferState::from_code(1).is_terminal());
        assert_eq!(TransferState::from_code(9), TransferState::Other(9));
    }

    #[test]
    fn test_mainboard_locations() {
        let nested = json!({"Data": {"Data": {"MainboardID": "BOARD-123", "MainboardIP": "10.0.0.2"}}});
        let identity = MainboardIdentity::from_response(&nested).unwrap();
        assert_eq!(identity.id, "BOARD-123");
        assert_eq!(identity.ip.as_deref(), Some("10.0.0.2"));

        let top = json!({"MainboardID": "TOP", "Data": {"MainboardIP": "10.0.0.3"}});
        let identity = MainboardIdentity::from_response(&top).unwrap();
        assert_eq!(identity.id, "TOP");
        assert_eq!(identity.ip.as_deref(), Some("10.0.0.3"));

        assert!(MainboardIdentity::from_response(&json!({"Data": {"MainboardID": ""}})).is_none());

        // Empty values at an outer scope do not hide nested ones.
        let shadowed = json!({
            "MainboardID": "",
            "MainboardIP": "",
            "Data": {"MainboardID": "BOARD-123", "MainboardIP": "10.0.0.4"}
        });
        let identity = MainboardIdentity::from_response(&shadowed).unwrap();
        assert_eq!(identity.id, "BOARD-123");
        assert_eq!(identity.ip.as_deref(), Some("10.0.0.4"));
    }
}
