#![allow(dead_code)]

use logic_automation::analyzer::{AnalyzerId, AnalyzerSettings};
use logic_automation::automation_service::{
    AutomationService, CaptureRequest, ExportFormat, RawExport, ServiceError,
};
use logic_automation::dataset::{analog_export_path, digital_export_path};
use logic_automation::protocol::RemoteCode;
use logic_automation::{AutomationConfig, CancelHandle, CaptureId, DeviceInfo, DeviceType};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// How a scripted wait behaves.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Complete,
    /// Block until the timeout passes or the wait is cancelled.
    Hang,
    Fail(ServiceError),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub devices: Vec<DeviceInfo>,
    pub wait_trigger: WaitOutcome,
    pub wait_capture: WaitOutcome,
    /// Decoder names the service rejects with UNKNOWN_ANALYZER.
    pub unknown_decoders: Vec<String>,
    pub export_error: Option<ServiceError>,
    /// Whether a CSV raw export actually writes its files.
    pub export_writes_files: bool,
    /// How long `add_analyzer` takes to answer.
    pub analyzer_delay: Duration,
    pub digital_csv: String,
    pub analog_csv: String,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            devices: vec![DeviceInfo::new("F4241A7D0E3B".into(), DeviceType::LogicPro16, true)],
            wait_trigger: WaitOutcome::Complete,
            wait_capture: WaitOutcome::Complete,
            unknown_decoders: vec!["Manchester".into()],
            export_error: None,
            export_writes_files: true,
            analyzer_delay: Duration::ZERO,
            digital_csv: square_wave_csv(1_000.0, 0.5, 100_000.0, 10),
            analog_csv: "Time [s],Channel 2\n0.0,0.5\n0.001,3.3\n0.002,1.0\n0.003,2.2\n".into(),
        }
    }
}

/// In-process automation service that follows a [`Script`] and records calls.
#[derive(Debug)]
pub struct ScriptedService {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU32,
}

impl ScriptedService {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn update(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }

    fn wait(
        &self,
        outcome: WaitOutcome,
        operation: &'static str,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<(), ServiceError> {
        match outcome {
            WaitOutcome::Complete => Ok(()),
            WaitOutcome::Fail(e) => Err(e),
            WaitOutcome::Hang => {
                let start = Instant::now();
                loop {
                    if cancel.is_cancelled() {
                        return Err(ServiceError::Cancelled { operation });
                    }
                    if start.elapsed() >= timeout {
                        return Err(ServiceError::Timeout {
                            operation,
                            after: timeout,
                        });
                    }
                    thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}

impl AutomationService for ScriptedService {
    fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError> {
        self.record("get_devices".into());
        Ok(self.script().devices)
    }

    fn start_capture(&self, request: &CaptureRequest<'_>) -> Result<CaptureId, ServiceError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(format!("start_capture:{}:{}", request.mode.as_str(), request.device_id));
        Ok(CaptureId(id.to_string()))
    }

    fn wait_trigger(&self, capture: &CaptureId, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        self.record(format!("wait_trigger:{capture}"));
        self.wait(self.script().wait_trigger, "WAIT_TRIGGER", timeout, cancel)
    }

    fn wait_capture(&self, capture: &CaptureId, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        self.record(format!("wait_capture:{capture}"));
        self.wait(self.script().wait_capture, "WAIT_CAPTURE", timeout, cancel)
    }

    fn stop_capture(&self, capture: &CaptureId) -> Result<(), ServiceError> {
        self.record(format!("stop_capture:{capture}"));
        Ok(())
    }

    fn close_capture(&self, capture: &CaptureId) -> Result<(), ServiceError> {
        self.record(format!("close_capture:{capture}"));
        Ok(())
    }

    fn save_capture(&self, capture: &CaptureId, path: &Path, _timeout: Duration) -> Result<(), ServiceError> {
        self.record(format!("save_capture:{capture}:{}", path.display()));
        match self.script().export_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn export_raw(&self, capture: &CaptureId, export: &RawExport<'_>, _timeout: Duration) -> Result<(), ServiceError> {
        self.record(format!("export_raw:{capture}:{}", export.format.as_str()));
        let script = self.script();
        if let Some(e) = script.export_error {
            return Err(e);
        }
        if export.format == ExportFormat::Csv && script.export_writes_files {
            let io = |e: std::io::Error| ServiceError::Remote {
                code: RemoteCode::Io,
                message: e.to_string(),
            };
            if !export.digital_channels.is_empty() {
                std::fs::write(digital_export_path(export.directory), &script.digital_csv).map_err(io)?;
            }
            if !export.analog_channels.is_empty() {
                std::fs::write(analog_export_path(export.directory), &script.analog_csv).map_err(io)?;
            }
        }
        Ok(())
    }

    fn add_analyzer(
        &self,
        capture: &CaptureId,
        decoder: &str,
        label: &str,
        _settings: &AnalyzerSettings,
    ) -> Result<AnalyzerId, ServiceError> {
        self.record(format!("add_analyzer:{capture}:{decoder}:{label}"));
        thread::sleep(self.script().analyzer_delay);
        if self.script().unknown_decoders.iter().any(|d| d == decoder) {
            return Err(ServiceError::Remote {
                code: RemoteCode::UnknownAnalyzer,
                message: format!("no analyzer named '{decoder}'"),
            });
        }
        Ok(AnalyzerId(format!("{capture}-{label}")))
    }

    fn export_analyzer(
        &self,
        capture: &CaptureId,
        analyzer: &AnalyzerId,
        path: &Path,
        _timeout: Duration,
    ) -> Result<(), ServiceError> {
        self.record(format!("export_analyzer:{capture}:{analyzer}"));
        std::fs::write(path, "name,type,start_time,duration,data\nuart,data,0.001,0.0001,0x55\n").map_err(|e| {
            ServiceError::Remote {
                code: RemoteCode::Io,
                message: e.to_string(),
            }
        })
    }
}

/// Short bounds so timeout tests finish quickly.
pub fn fast_config(export_directory: PathBuf) -> AutomationConfig {
    AutomationConfig {
        wait_grace_secs: 0.05,
        trigger_timeout_secs: 0.05,
        export_timeout_secs: 0.5,
        export_directory,
        ..AutomationConfig::default()
    }
}

/// Raw-export CSV of a square wave on channel 0, with channel 1 held high.
pub fn square_wave_csv(frequency: f64, duty: f64, sample_rate: f64, periods: usize) -> String {
    let samples_per_period = (sample_rate / frequency).round() as usize;
    let high = (samples_per_period as f64 * duty).round() as usize;
    let mut csv = String::from("Time [s],Channel 0,Channel 1\n");
    for i in 0..samples_per_period * periods {
        let level = u8::from(i % samples_per_period < high);
        writeln!(csv, "{:.9},{},1", i as f64 / sample_rate, level).unwrap();
    }
    csv
}
