//! JSON tool surface for an agent layer.
//!
//! Each tool takes a JSON object of arguments and returns a JSON value. Open
//! capture sessions live in a table keyed by capture id; a session is taken
//! out of the table while a tool drives it and is dropped once it reaches a
//! terminal state.
//!
//! `cancel_capture` works on sessions that another call is still driving,
//! including the blocking `start_capture_with_trigger` and
//! `capture_and_analyze_*`: their cancel handles are registered as soon as the
//! capture exists.

use crate::analysis::{analyze_analog, analyze_digital, estimate_sample_rate};
use crate::analyzer::AnalyzerSettings;
use crate::automation_service::{AutomationService, ExportFormat};
use crate::controller::{require_analog_channel, require_digital_channel, LogicController};
use crate::dataset::{analog_samples, digital_samples, read_analog_csv, read_digital_csv, Sample, TimeWindow};
use crate::device::{DeviceInfo, DeviceType};
use crate::error::{ErrorKind, LogicError};
use crate::registry::{CaptureConfiguration, DeviceConfiguration};
use crate::session::{CancelHandle, CaptureSession, SessionState};
use crate::trigger_config::{TriggerEdge, TriggerSpec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

pub const TOOL_NAMES: &[&str] = &[
    "get_available_devices",
    "find_device_by_type",
    "create_device_config",
    "get_device_config",
    "list_device_configs",
    "remove_device_config",
    "create_capture_config",
    "get_capture_config",
    "list_capture_configs",
    "remove_capture_config",
    "start_capture",
    "wait_capture",
    "stop_capture",
    "save_capture",
    "export_capture",
    "cancel_capture",
    "discard_capture",
    "start_capture_with_trigger",
    "capture_and_analyze_digital",
    "capture_and_analyze_analog",
    "add_protocol_analyzer",
    "export_analyzer_data",
    "analyze_exported_digital",
    "analyze_exported_analog",
    "get_digital_data",
    "get_analog_data",
    "get_sample_rate",
    "list_capture_sessions",
];

/// Rows returned by the sample data tools unless `max_rows` says otherwise.
pub const DEFAULT_MAX_ROWS: usize = 10_000;

/// Failure as reported to the agent: `{ "kind": ..., "message": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    fn configuration(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Configuration,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "kind": self.kind, "message": self.message })
    }
}

impl From<LogicError> for ToolError {
    fn from(e: LogicError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FindDeviceRequest {
    device_type: String,
}

#[derive(Debug, Deserialize)]
struct StartCaptureRequest {
    device_config: String,
    #[serde(default)]
    capture_config: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CaptureIdRequest {
    capture_id: String,
}

#[derive(Debug, Deserialize)]
struct SaveCaptureRequest {
    capture_id: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ExportCaptureRequest {
    capture_id: String,
    directory: PathBuf,
    #[serde(default)]
    format: ExportFormat,
}

#[derive(Debug, Deserialize)]
struct TriggeredCaptureRequest {
    device_config: String,
    channel: u32,
    #[serde(default = "default_edge")]
    edge: TriggerEdge,
    after_trigger_seconds: f64,
}

fn default_edge() -> TriggerEdge {
    TriggerEdge::Rising
}

#[derive(Debug, Deserialize)]
struct CaptureAndAnalyzeRequest {
    device_config: String,
    capture_config: String,
    channel: u32,
}

#[derive(Debug, Deserialize)]
struct AddAnalyzerRequest {
    capture_id: String,
    decoder_type: String,
    label: String,
    #[serde(default)]
    settings: AnalyzerSettings,
}

#[derive(Debug, Deserialize)]
struct ExportAnalyzerRequest {
    capture_id: String,
    label: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct AnalyzeExportedRequest {
    path: PathBuf,
    channel: u32,
    #[serde(default)]
    start_time: Option<f64>,
    #[serde(default)]
    end_time: Option<f64>,
}

impl AnalyzeExportedRequest {
    fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Deserialize)]
struct SampleDataRequest {
    path: PathBuf,
    channel: u32,
    #[serde(default)]
    start_time: Option<f64>,
    #[serde(default)]
    end_time: Option<f64>,
    #[serde(default = "default_max_rows")]
    max_rows: usize,
}

impl SampleDataRequest {
    fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time)
    }

    fn check_max_rows(&self) -> Result<(), ToolError> {
        if self.max_rows == 0 {
            return Err(ToolError::configuration("max_rows must be at least 1"));
        }
        Ok(())
    }
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

#[derive(Debug, Deserialize)]
struct SampleRateRequest {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct SampleData<V> {
    channel: u32,
    /// Samples inside the window, before the row cap.
    total_samples: usize,
    truncated: bool,
    data: Vec<Sample<V>>,
}

impl<V> SampleData<V> {
    fn capped(channel: u32, mut data: Vec<Sample<V>>, max_rows: usize) -> Self {
        let total_samples = data.len();
        data.truncate(max_rows);
        Self {
            channel,
            total_samples,
            truncated: total_samples > max_rows,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceSummary {
    device_id: String,
    device_type: DeviceType,
    is_simulation: bool,
}

impl From<&DeviceInfo> for DeviceSummary {
    fn from(device: &DeviceInfo) -> Self {
        Self {
            device_id: device.masked_id(),
            device_type: device.device_type,
            is_simulation: device.is_simulation,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    capture_id: Option<String>,
    state: SessionState,
    mode: &'static str,
    device_config: String,
    analyzers: Vec<String>,
}

impl From<&CaptureSession> for SessionSummary {
    fn from(session: &CaptureSession) -> Self {
        Self {
            capture_id: session.capture_id().map(ToString::to_string),
            state: session.state(),
            mode: session.mode().as_str(),
            device_config: session.device().name.clone(),
            analyzers: session.analyzers().iter().map(|a| a.label.clone()).collect(),
        }
    }
}

/// Dispatches tool calls onto a [`LogicController`].
pub struct LogicTools<S> {
    controller: LogicController<S>,
    sessions: Mutex<HashMap<String, CaptureSession>>,
    /// Cancel handles of every open session, including those currently
    /// taken out of `sessions` by a running tool.
    cancels: Mutex<HashMap<String, CancelHandle>>,
}

impl<S: AutomationService> LogicTools<S> {
    pub fn new(controller: LogicController<S>) -> Self {
        Self {
            controller,
            sessions: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &LogicController<S> {
        &self.controller
    }

    /// Capture ids of sessions that are open and not currently being driven.
    pub fn open_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn call(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        log::debug!("Tool call {} {}", tool, args);
        match tool {
            "get_available_devices" => {
                let devices = self.controller.get_available_devices()?;
                let devices: Vec<DeviceSummary> = devices.iter().map(DeviceSummary::from).collect();
                Ok(json!({ "devices": devices }))
            }
            "find_device_by_type" => {
                let request: FindDeviceRequest = parse_args(tool, args)?;
                let device_type: DeviceType = request
                    .device_type
                    .parse()
                    .map_err(|e: crate::device::UnknownDeviceType| ToolError::configuration(e.to_string()))?;
                let found = self.controller.find_device_by_type(device_type)?;
                Ok(json!({ "device": found.as_ref().map(DeviceSummary::from) }))
            }
            "create_device_config" => {
                let config: DeviceConfiguration = parse_args(tool, args)?;
                to_value(&*self.controller.create_device_config(config)?)
            }
            "get_device_config" => {
                let request: NameRequest = parse_args(tool, args)?;
                to_value(&*self.controller.get_device_config(&request.name)?)
            }
            "list_device_configs" => Ok(json!({ "names": self.controller.list_device_configs() })),
            "remove_device_config" => {
                let request: NameRequest = parse_args(tool, args)?;
                Ok(json!({ "removed": self.controller.remove_device_config(&request.name) }))
            }
            "create_capture_config" => {
                let config: CaptureConfiguration = parse_args(tool, args)?;
                to_value(&*self.controller.create_capture_config(config)?)
            }
            "get_capture_config" => {
                let request: NameRequest = parse_args(tool, args)?;
                to_value(&*self.controller.get_capture_config(&request.name)?)
            }
            "list_capture_configs" => Ok(json!({ "names": self.controller.list_capture_configs() })),
            "remove_capture_config" => {
                let request: NameRequest = parse_args(tool, args)?;
                Ok(json!({ "removed": self.controller.remove_capture_config(&request.name) }))
            }
            "start_capture" => {
                let request: StartCaptureRequest = parse_args(tool, args)?;
                let session = self
                    .controller
                    .start(&request.device_config, request.capture_config.as_deref())?;
                Ok(self.open(session))
            }
            "start_capture_with_trigger" => {
                let request: TriggeredCaptureRequest = parse_args(tool, args)?;
                let trigger = TriggerSpec::new(request.channel, request.edge, request.after_trigger_seconds);
                let mut session = self.controller.arm_trigger(&request.device_config, trigger)?;
                // Reachable by cancel_capture while the trigger wait blocks.
                self.track(&session);
                let result = self.controller.wait(&mut session);
                let (summary, cancelled) = self.put_back(session);
                settle(result, cancelled)?;
                Ok(json!(summary))
            }
            "wait_capture" => {
                let request: CaptureIdRequest = parse_args(tool, args)?;
                self.drive(&request.capture_id, |c, s| c.wait(s))
            }
            "stop_capture" => {
                let request: CaptureIdRequest = parse_args(tool, args)?;
                self.drive(&request.capture_id, |c, s| c.stop(s))
            }
            "save_capture" => {
                let request: SaveCaptureRequest = parse_args(tool, args)?;
                self.drive(&request.capture_id, |c, s| c.save(s, &request.path))
            }
            "export_capture" => {
                let request: ExportCaptureRequest = parse_args(tool, args)?;
                self.drive(&request.capture_id, |c, s| c.export(s, &request.directory, request.format))
            }
            "cancel_capture" => {
                let request: CaptureIdRequest = parse_args(tool, args)?;
                self.cancel(&request.capture_id)
            }
            "discard_capture" => {
                let request: CaptureIdRequest = parse_args(tool, args)?;
                self.drive(&request.capture_id, |c, s| {
                    c.discard(s);
                    Ok(())
                })
            }
            "capture_and_analyze_digital" => {
                let request: CaptureAndAnalyzeRequest = parse_args(tool, args)?;
                require_digital_channel(
                    &*self.controller.get_device_config(&request.device_config)?,
                    request.channel,
                )?;
                let result = self.run_capture(&request, |c, s| c.analyze_digital_capture(s, request.channel))?;
                to_value(&result)
            }
            "capture_and_analyze_analog" => {
                let request: CaptureAndAnalyzeRequest = parse_args(tool, args)?;
                require_analog_channel(
                    &*self.controller.get_device_config(&request.device_config)?,
                    request.channel,
                )?;
                let result = self.run_capture(&request, |c, s| c.analyze_analog_capture(s, request.channel))?;
                to_value(&result)
            }
            "add_protocol_analyzer" => {
                let request: AddAnalyzerRequest = parse_args(tool, args)?;
                let mut session = self.take(&request.capture_id)?;
                let result = self.controller.attach_analyzer(
                    &mut session,
                    &request.decoder_type,
                    &request.label,
                    request.settings,
                );
                let (_, cancelled) = self.put_back(session);
                to_value(&settle(result, cancelled)?)
            }
            "export_analyzer_data" => {
                let request: ExportAnalyzerRequest = parse_args(tool, args)?;
                let session = self.take(&request.capture_id)?;
                let result = self.controller.export_analyzer(&session, &request.label, &request.path);
                let (_, cancelled) = self.put_back(session);
                settle(result, cancelled)?;
                Ok(json!({ "label": request.label, "path": request.path }))
            }
            "analyze_exported_digital" => {
                let request: AnalyzeExportedRequest = parse_args(tool, args)?;
                let df = read_digital_csv(&request.path).map_err(LogicError::from)?;
                let df = request.window().select(df).map_err(LogicError::from)?;
                let result = analyze_digital(&df, request.channel).map_err(LogicError::from)?;
                to_value(&result)
            }
            "analyze_exported_analog" => {
                let request: AnalyzeExportedRequest = parse_args(tool, args)?;
                let df = read_analog_csv(&request.path).map_err(LogicError::from)?;
                let df = request.window().select(df).map_err(LogicError::from)?;
                let result = analyze_analog(&df, request.channel).map_err(LogicError::from)?;
                to_value(&result)
            }
            "get_digital_data" => {
                let request: SampleDataRequest = parse_args(tool, args)?;
                request.check_max_rows()?;
                let df = read_digital_csv(&request.path).map_err(LogicError::from)?;
                let df = request.window().select(df).map_err(LogicError::from)?;
                let samples = digital_samples(&df, request.channel).map_err(LogicError::from)?;
                to_value(&SampleData::capped(request.channel, samples, request.max_rows))
            }
            "get_analog_data" => {
                let request: SampleDataRequest = parse_args(tool, args)?;
                request.check_max_rows()?;
                let df = read_analog_csv(&request.path).map_err(LogicError::from)?;
                let df = request.window().select(df).map_err(LogicError::from)?;
                let samples = analog_samples(&df, request.channel).map_err(LogicError::from)?;
                to_value(&SampleData::capped(request.channel, samples, request.max_rows))
            }
            "get_sample_rate" => {
                let request: SampleRateRequest = parse_args(tool, args)?;
                let df = read_digital_csv(&request.path).map_err(LogicError::from)?;
                to_value(&estimate_sample_rate(&df).map_err(LogicError::from)?)
            }
            "list_capture_sessions" => Ok(self.list_sessions()),
            other => Err(ToolError::configuration(format!("Unknown tool '{other}'"))),
        }
    }

    /// Like [`call`](Self::call), with failures folded into an `error` field.
    pub fn respond(&self, tool: &str, args: Value) -> Value {
        match self.call(tool, args) {
            Ok(result) => json!({ "result": result }),
            Err(e) => {
                log::info!("Tool {} failed: {}", tool, e);
                json!({ "error": e.to_json() })
            }
        }
    }

    fn open(&self, session: CaptureSession) -> Value {
        self.track(&session);
        let (summary, _) = self.put_back(session);
        json!(summary)
    }

    /// Register the session's cancel handle so `cancel_capture` reaches it
    /// while a tool is still driving it.
    fn track(&self, session: &CaptureSession) {
        if let Some(id) = session.capture_id() {
            self.cancels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.to_string(), session.cancel_handle());
        }
    }

    /// Start a timed capture, wait for it and hand the completed session to
    /// `analyze`. The session is tracked from the moment it exists.
    fn run_capture<T>(
        &self,
        request: &CaptureAndAnalyzeRequest,
        analyze: impl FnOnce(&LogicController<S>, &mut CaptureSession) -> Result<T, LogicError>,
    ) -> Result<T, ToolError> {
        let mut session = self
            .controller
            .start(&request.device_config, Some(&request.capture_config))?;
        self.track(&session);
        let result = self
            .controller
            .wait(&mut session)
            .and_then(|()| analyze(&self.controller, &mut session));
        let (_, cancelled) = self.put_back(session);
        settle(result, cancelled)
    }

    fn drive(
        &self,
        capture_id: &str,
        step: impl FnOnce(&LogicController<S>, &mut CaptureSession) -> Result<(), LogicError>,
    ) -> Result<Value, ToolError> {
        let mut session = self.take(capture_id)?;
        let result = step(&self.controller, &mut session);
        let (summary, cancelled) = self.put_back(session);
        settle(result, cancelled)?;
        Ok(json!(summary))
    }

    fn cancel(&self, capture_id: &str) -> Result<Value, ToolError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = sessions.remove(capture_id);
        if let Some(mut session) = idle {
            drop(sessions);
            self.controller.cancel(&mut session);
            let (summary, _) = self.put_back(session);
            return Ok(json!(summary));
        }

        // The session is being driven by another call. The table stays
        // locked until the flag is set, so the driving call sees it when it
        // puts the session back.
        let cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        match cancels.get(capture_id) {
            Some(handle) => {
                handle.cancel();
                log::info!("Cancel requested for busy capture {}", capture_id);
                Ok(json!({ "capture_id": capture_id, "cancel_requested": true }))
            }
            None => Err(unknown_session(capture_id)),
        }
    }

    fn list_sessions(&self) -> Value {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        let mut open: Vec<SessionSummary> = sessions.values().map(SessionSummary::from).collect();
        open.sort_by(|a, b| a.capture_id.cmp(&b.capture_id));
        let mut busy: Vec<&String> = cancels.keys().filter(|id| !sessions.contains_key(*id)).collect();
        busy.sort();
        json!({ "sessions": open, "busy": busy })
    }

    fn take(&self, capture_id: &str) -> Result<CaptureSession, ToolError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.remove(capture_id) {
            return Ok(session);
        }
        let busy = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(capture_id);
        if busy {
            Err(ToolError::configuration(format!(
                "Capture session '{capture_id}' is busy with another operation"
            )))
        } else {
            Err(unknown_session(capture_id))
        }
    }

    /// Return a driven session to the table. A cancel that arrived while the
    /// session was out is carried out first; terminal sessions are dropped.
    /// Returns the final summary and whether the session was cancelled here.
    fn put_back(&self, mut session: CaptureSession) -> (SessionSummary, bool) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = session.cancel_handle().is_cancelled() && !session.state().is_terminal();
        if !cancelled && !session.state().is_terminal() {
            let summary = SessionSummary::from(&session);
            if let Some(id) = session.capture_id().map(ToString::to_string) {
                sessions.insert(id, session);
            }
            return (summary, false);
        }
        drop(sessions);

        if cancelled {
            self.controller.cancel(&mut session);
        }
        let summary = SessionSummary::from(&session);
        if let Some(id) = session.capture_id() {
            log::debug!("Closing capture session {} ({})", id, session.state());
            self.cancels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id.0.as_str());
        }
        (summary, cancelled)
    }
}

/// A step that finished while a cancel was pending still reports the cancel.
fn settle<T>(result: Result<T, LogicError>, cancelled: bool) -> Result<T, ToolError> {
    let value = result?;
    if cancelled {
        return Err(LogicError::Cancelled.into());
    }
    Ok(value)
}

fn unknown_session(capture_id: &str) -> ToolError {
    ToolError::configuration(format!("No open capture session '{capture_id}'"))
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::configuration(format!("Invalid arguments for {tool}: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError {
        kind: ErrorKind::Remote,
        message: format!("Failed to encode result: {e}"),
    })
}
