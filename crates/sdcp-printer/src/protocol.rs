//! SDCP command codes and envelopes.

use serde::Serialize;
use serde_json::{json, Value};

/// Prefix of the `Topic` field carried by unsolicited status messages.
pub const STATUS_TOPIC_PREFIX: &str = "sdcp/status/";

/// Origin tag for requests sent from a controller.
pub const ORIGIN_CONTROLLER: u8 = 1;

/// Command sent to the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Request a status push.
    Status,
    /// Request device attributes.
    Attributes,
    /// Start printing a file.
    StartPrint,
    /// Pause the current print.
    PausePrint,
    /// Stop the current print.
    StopPrint,
    /// Resume a paused print.
    ResumePrint,
    /// Ask the printer to pull a file over HTTP.
    UploadFile,
    /// List files in a directory.
    ListFiles,
    /// Delete files.
    DeleteFiles,
    /// Enable or disable the camera stream.
    VideoStream,
    /// Switch the light.
    SetLight,
}

impl Command {
    /// Numeric SDCP command code.
    pub fn code(self) -> u16 {
        match self {
            Command::Status => 0,
            Command::Attributes => 1,
            Command::StartPrint => 128,
            Command::PausePrint => 129,
            Command::StopPrint => 130,
            Command::ResumePrint => 131,
            Command::UploadFile => 256,
            Command::ListFiles => 258,
            Command::DeleteFiles => 259,
            Command::VideoStream => 386,
            Command::SetLight => 403,
        }
    }
}

/// Options for [`Command::StartPrint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrintOptions {
    /// Layer to resume from (0 for a fresh print).
    pub start_layer: u32,
    /// Run auto-calibration before printing.
    pub calibration: bool,
    /// Build platform type reported by the slicer.
    pub platform_type: u8,
    /// Record a timelapse.
    pub timelapse: bool,
}

impl PrintOptions {
    /// Inner payload for a start-print command.
    pub fn to_payload(&self, filename: &str) -> Value {
        json!({
            "Filename": filename,
            "StartLayer": self.start_layer,
            "Calibration_switch": u8::from(self.calibration),
            "PrintPlatformType": self.platform_type,
            "Tlp_Switch": u8::from(self.timelapse),
        })
    }
}

/// A request frame, immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Data")]
    data: EnvelopeData,
}

#[derive(Debug, Clone, Serialize)]
struct EnvelopeData {
    #[serde(rename = "Cmd")]
    cmd: u16,
    #[serde(rename = "Data")]
    data: Value,
    #[serde(rename = "RequestID")]
    request_id: String,
    #[serde(rename = "MainboardID")]
    mainboard_id: String,
    #[serde(rename = "TimeStamp")]
    timestamp: i64,
    #[serde(rename = "From")]
    from: u8,
}

impl Envelope {
    /// Build an envelope with a freshly generated correlation id.
    ///
    /// A `Null` payload is sent as an empty object.
    pub fn new(code: u16, payload: Value, mainboard_id: Option<&str>) -> Self {
        let data = if payload.is_null() { json!({}) } else { payload };
        Self {
            id: String::new(),
            data: EnvelopeData {
                cmd: code,
                data,
                request_id: new_request_id(),
                mainboard_id: mainboard_id.unwrap_or_default().to_string(),
                timestamp: chrono::Utc::now().timestamp(),
                from: ORIGIN_CONTROLLER,
            },
        }
    }

    /// Command code.
    pub fn code(&self) -> u16 {
        self.data.cmd
    }

    /// Correlation id.
    pub fn request_id(&self) -> &str {
        &self.data.request_id
    }

    /// Mainboard id embedded in the envelope (empty when unknown).
    pub fn mainboard_id(&self) -> &str {
        &self.data.mainboard_id
    }

    /// Inner payload.
    pub fn payload(&self) -> &Value {
        &self.data.data
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Generate a correlation id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Extract the correlation id a response frame answers.
pub fn response_request_id(frame: &Value) -> Option<&str> {
    let data = frame.get("Data");
    data.and_then(|d| d.get("RequestID"))
        .or_else(|| data.and_then(|d| d.get("request_id")))
        .or_else(|| frame.get("request_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Whether a frame carries the status topic marker.
pub fn is_status_frame(frame: &Value) -> bool {
    frame
        .get("Topic")
        .and_then(Value::as_str)
        .is_some_and(|topic| topic.starts_with(STATUS_TOPIC_PREFIX))
}

/// MQTT topic requests are published to.
pub fn request_topic(mainboard_id: &str) -> String {
    format!("/sdcp/request/{mainboard_id}")
}

/// MQTT topic responses arrive on.
pub fn response_topic(mainboard_id: &str) -> String {
    format!("/sdcp/response/{mainboard_id}")
}

/// MQTT topic status pushes arrive on.
pub fn status_topic(mainboard_id: &str) -> String {
    format!("/sdcp/status/{mainboard_id}")
}
