use crate::analyzer::{AnalyzerId, AnalyzerSettings};
use crate::automation_terminal::{IdleAutomationTerminal, TerminalError};
use crate::config::AutomationConfig;
use crate::device::{DeviceInfo, DeviceType};
use crate::protocol::{split_fields, RemoteCode, Reply, Request};
use crate::registry::DeviceConfiguration;
use crate::session::{CancelHandle, CaptureId, CaptureMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Automation service refused the connection at {addr}; is it running?")]
    ConnectionRefused { addr: String },

    #[error("Connection to automation service lost")]
    ConnectionLost,

    #[error("{operation} did not finish within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    #[error("Automation service reported {code}: {message}")]
    Remote { code: RemoteCode, message: String },

    #[error("Unexpected reply from automation service: {0}")]
    Protocol(String),

    #[error("Request cannot be sent: {0}")]
    InvalidRequest(String),
}

impl From<TerminalError> for ServiceError {
    fn from(e: TerminalError) -> Self {
        match e {
            TerminalError::ConnectionRefused { addr } | TerminalError::AddressResolution { addr } => {
                ServiceError::ConnectionRefused { addr }
            }
            TerminalError::ConnectionLost | TerminalError::Io(_) => ServiceError::ConnectionLost,
            TerminalError::Timeout { command, after, .. } => ServiceError::Timeout {
                operation: command,
                after,
            },
            TerminalError::Cancelled { command } => ServiceError::Cancelled { operation: command },
            TerminalError::Protocol(e) => match e {
                crate::protocol::ProtocolError::InvalidField { .. } => {
                    ServiceError::InvalidRequest(e.to_string())
                }
                other => ServiceError::Protocol(other.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Delimited text, `digital.csv` / `analog.csv` in the target directory.
    #[default]
    Csv,
    /// Vendor binary sample files.
    Binary,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Binary => "binary",
        }
    }
}

/// Parameters of a capture the service should begin.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest<'a> {
    pub device_id: &'a str,
    pub device: &'a DeviceConfiguration,
    pub mode: &'a CaptureMode,
}

#[derive(Debug, Clone, Copy)]
pub struct RawExport<'a> {
    pub directory: &'a Path,
    pub format: ExportFormat,
    pub digital_channels: &'a BTreeSet<u32>,
    pub analog_channels: &'a BTreeSet<u32>,
}

/// Operations offered by the vendor automation service.
///
/// Every method that can block takes an explicit bound. Implementations must
/// not retry on their own; a failed call is reported as-is.
pub trait AutomationService: Send + Sync {
    fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError>;

    fn start_capture(&self, request: &CaptureRequest<'_>) -> Result<CaptureId, ServiceError>;

    /// Returns once the armed trigger condition was observed.
    fn wait_trigger(
        &self,
        capture: &CaptureId,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<(), ServiceError>;

    /// Returns once the capture finished recording.
    fn wait_capture(
        &self,
        capture: &CaptureId,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<(), ServiceError>;

    fn stop_capture(&self, capture: &CaptureId) -> Result<(), ServiceError>;

    /// Release the service-side capture handle.
    fn close_capture(&self, capture: &CaptureId) -> Result<(), ServiceError>;

    fn save_capture(&self, capture: &CaptureId, path: &Path, timeout: Duration) -> Result<(), ServiceError>;

    fn export_raw(&self, capture: &CaptureId, export: &RawExport<'_>, timeout: Duration) -> Result<(), ServiceError>;

    fn add_analyzer(
        &self,
        capture: &CaptureId,
        decoder: &str,
        label: &str,
        settings: &AnalyzerSettings,
    ) -> Result<AnalyzerId, ServiceError>;

    fn export_analyzer(
        &self,
        capture: &CaptureId,
        analyzer: &AnalyzerId,
        path: &Path,
        timeout: Duration,
    ) -> Result<(), ServiceError>;
}

impl<S: AutomationService + ?Sized> AutomationService for Arc<S> {
    fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError> {
        (**self).get_devices()
    }

    fn start_capture(&self, request: &CaptureRequest<'_>) -> Result<CaptureId, ServiceError> {
        (**self).start_capture(request)
    }

    fn wait_trigger(&self, capture: &CaptureId, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        (**self).wait_trigger(capture, timeout, cancel)
    }

    fn wait_capture(&self, capture: &CaptureId, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        (**self).wait_capture(capture, timeout, cancel)
    }

    fn stop_capture(&self, capture: &CaptureId) -> Result<(), ServiceError> {
        (**self).stop_capture(capture)
    }

    fn close_capture(&self, capture: &CaptureId) -> Result<(), ServiceError> {
        (**self).close_capture(capture)
    }

    fn save_capture(&self, capture: &CaptureId, path: &Path, timeout: Duration) -> Result<(), ServiceError> {
        (**self).save_capture(capture, path, timeout)
    }

    fn export_raw(&self, capture: &CaptureId, export: &RawExport<'_>, timeout: Duration) -> Result<(), ServiceError> {
        (**self).export_raw(capture, export, timeout)
    }

    fn add_analyzer(
        &self,
        capture: &CaptureId,
        decoder: &str,
        label: &str,
        settings: &AnalyzerSettings,
    ) -> Result<AnalyzerId, ServiceError> {
        (**self).add_analyzer(capture, decoder, label, settings)
    }

    fn export_analyzer(
        &self,
        capture: &CaptureId,
        analyzer: &AnalyzerId,
        path: &Path,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        (**self).export_analyzer(capture, analyzer, path, timeout)
    }
}

/// [`AutomationService`] over the service's TCP line protocol.
///
/// Short requests share one connection, opened on first use and used by one
/// caller at a time. After a connection failure the socket is dropped and the
/// next call connects again. Trigger and capture waits each open their own
/// connection for as long as they block.
#[derive(Debug)]
pub struct SocketAutomationService {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    terminal: Mutex<Option<IdleAutomationTerminal>>,
}

impl SocketAutomationService {
    pub fn new(config: &AutomationConfig) -> Self {
        Self {
            addr: config.address(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            terminal: Mutex::new(None),
        }
    }

    /// Connect immediately, so an absent service is reported up front.
    pub fn connect(config: &AutomationConfig) -> Result<Self, ServiceError> {
        let service = Self::new(config);
        {
            let mut guard = service.terminal.lock().unwrap_or_else(PoisonError::into_inner);
            *guard = Some(IdleAutomationTerminal::connect(&service.addr, service.connect_timeout)?);
        }
        Ok(service)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn request(&self, request: &Request, timeout: Duration) -> Result<Vec<String>, ServiceError> {
        let mut guard = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
        let mut terminal = match guard.take() {
            Some(terminal) => terminal,
            None => IdleAutomationTerminal::connect(&self.addr, self.connect_timeout)?,
        };

        match terminal.exec(request, timeout) {
            Ok(reply) => {
                *guard = Some(terminal);
                into_payload(reply)
            }
            Err(e) => {
                if e.is_fatal() {
                    log::debug!("Dropping connection to {} after {}", self.addr, e);
                } else {
                    *guard = Some(terminal);
                }
                Err(e.into())
            }
        }
    }

    /// `WAIT_*` requests run on a connection of their own, so a capture that
    /// takes minutes does not hold up requests for other sessions on the
    /// shared one. The connection is closed when the wait ends.
    fn wait(&self, request: &Request, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        let idle = IdleAutomationTerminal::connect(&self.addr, self.connect_timeout)?;
        let busy = idle.exec_async(request).map_err(|(_, e)| ServiceError::from(e))?;
        let (result, _) = busy.wait_timeout(timeout, cancel);
        into_payload(result?).map(|_| ())
    }

    fn simple(&self, request: Request) -> Result<(), ServiceError> {
        self.request(&request, self.request_timeout).map(|_| ())
    }
}

fn into_payload(reply: Reply) -> Result<Vec<String>, ServiceError> {
    match reply {
        Reply::Ack { payload } => Ok(payload),
        Reply::Nak { code, message, .. } => Err(ServiceError::Remote { code, message }),
    }
}

fn first_line(payload: Vec<String>, what: &str) -> Result<String, ServiceError> {
    payload
        .into_iter()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ServiceError::Protocol(format!("reply carried no {what}")))
}

fn parse_device_line(line: &str) -> Result<DeviceInfo, ServiceError> {
    match split_fields(line).as_slice() {
        [id, device_type, simulation, ..] => {
            let device_type = device_type
                .parse::<DeviceType>()
                .map_err(|e| ServiceError::Protocol(e.to_string()))?;
            let is_simulation = matches!(*simulation, "1" | "true" | "TRUE" | "True");
            Ok(DeviceInfo::new((*id).to_string(), device_type, is_simulation))
        }
        _ => Err(ServiceError::Protocol(format!("malformed device line '{line}'"))),
    }
}

pub(crate) fn encode_start(request: &CaptureRequest<'_>) -> Request {
    let device = request.device;
    let analog = device.analog_channel_set();

    let mut line = Request::new("START_CAPTURE")
        .kv("device", request.device_id)
        .kv_list("digital", &device.digital_channels)
        .kv("digital_rate", device.digital_sample_rate);
    if !analog.is_empty() {
        line = line
            .kv_list("analog", &analog)
            .kv_opt("analog_rate", device.analog_sample_rate);
    }
    line = line
        .kv_opt("threshold", device.digital_threshold_volts)
        .kv("mode", request.mode.as_str());

    match request.mode {
        CaptureMode::Manual => line,
        CaptureMode::Timed(capture) => line
            .kv("duration", capture.duration_seconds)
            .kv_opt("buffer", capture.buffer_size_megabytes),
        CaptureMode::Trigger(trigger) => line
            .kv("channel", trigger.channel)
            .kv("edge", trigger.edge)
            .kv("after", trigger.after_trigger_seconds),
    }
}

impl AutomationService for SocketAutomationService {
    fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError> {
        let payload = self.request(&Request::new("GET_DEVICES"), self.request_timeout)?;
        payload
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_device_line(line))
            .collect()
    }

    fn start_capture(&self, request: &CaptureRequest<'_>) -> Result<CaptureId, ServiceError> {
        let payload = self.request(&encode_start(request), self.request_timeout)?;
        first_line(payload, "capture id").map(CaptureId)
    }

    fn wait_trigger(&self, capture: &CaptureId, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        self.wait(&Request::new("WAIT_TRIGGER").arg(capture), timeout, cancel)
    }

    fn wait_capture(&self, capture: &CaptureId, timeout: Duration, cancel: &CancelHandle) -> Result<(), ServiceError> {
        self.wait(&Request::new("WAIT_CAPTURE").arg(capture), timeout, cancel)
    }

    fn stop_capture(&self, capture: &CaptureId) -> Result<(), ServiceError> {
        self.simple(Request::new("STOP_CAPTURE").arg(capture))
    }

    fn close_capture(&self, capture: &CaptureId) -> Result<(), ServiceError> {
        self.simple(Request::new("CLOSE_CAPTURE").arg(capture))
    }

    fn save_capture(&self, capture: &CaptureId, path: &Path, timeout: Duration) -> Result<(), ServiceError> {
        let request = Request::new("SAVE_CAPTURE").arg(capture).arg(path.display());
        self.request(&request, timeout).map(|_| ())
    }

    fn export_raw(&self, capture: &CaptureId, export: &RawExport<'_>, timeout: Duration) -> Result<(), ServiceError> {
        let request = Request::new("EXPORT_RAW")
            .arg(capture)
            .arg(export.directory.display())
            .kv("format", export.format.as_str())
            .kv_list("digital", export.digital_channels)
            .kv_list("analog", export.analog_channels);
        self.request(&request, timeout).map(|_| ())
    }

    fn add_analyzer(
        &self,
        capture: &CaptureId,
        decoder: &str,
        label: &str,
        settings: &AnalyzerSettings,
    ) -> Result<AnalyzerId, ServiceError> {
        let mut request = Request::new("ADD_ANALYZER").arg(capture).arg(decoder).arg(label);
        for (key, value) in settings {
            request = request.kv(key, value);
        }
        let payload = self.request(&request, self.request_timeout)?;
        first_line(payload, "analyzer id").map(AnalyzerId)
    }

    fn export_analyzer(
        &self,
        capture: &CaptureId,
        analyzer: &AnalyzerId,
        path: &Path,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        let request = Request::new("EXPORT_ANALYZER")
            .arg(capture)
            .arg(analyzer)
            .arg(path.display());
        self.request(&request, timeout).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CaptureConfiguration;
    use crate::trigger_config::{TriggerEdge, TriggerSpec};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    fn config_for(addr: &str) -> AutomationConfig {
        let (host, port) = addr.rsplit_once(':').unwrap();
        AutomationConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            request_timeout_secs: 2.0,
            ..AutomationConfig::default()
        }
    }

    fn serve(replies: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut seen = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                seen.push(line.trim_end().to_string());
                writer.write_all(reply.as_bytes()).unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn test_get_devices_parses_payload() {
        let (addr, server) = serve(vec!["A1B2C3D4E5\tLOGIC_PRO_16\t0\nSIM0\tLOGIC_8\t1\nACK\n"]);
        let service = SocketAutomationService::new(&config_for(&addr));

        let devices = service.get_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_type, DeviceType::LogicPro16);
        assert!(!devices[0].is_simulation);
        assert!(devices[1].is_simulation);
        drop(service);
        assert_eq!(server.join().unwrap(), vec!["GET_DEVICES"]);
    }

    #[test]
    fn test_start_capture_encodes_timed_request() {
        let (addr, server) = serve(vec!["17\nACK\n"]);
        let service = SocketAutomationService::new(&config_for(&addr));
        let device = DeviceConfiguration::new("cfg1", [1, 0], 1_000_000);
        let mode = CaptureMode::Timed(Arc::new(CaptureConfiguration::new("cap1", 1.0).with_buffer_size(64)));

        let id = service
            .start_capture(&CaptureRequest {
                device_id: "SIM0",
                device: &device,
                mode: &mode,
            })
            .unwrap();
        assert_eq!(id, CaptureId("17".into()));
        drop(service);
        assert_eq!(
            server.join().unwrap(),
            vec!["START_CAPTURE\tdevice=SIM0\tdigital=0,1\tdigital_rate=1000000\tmode=timed\tduration=1\tbuffer=64"]
        );
    }

    #[test]
    fn test_trigger_request_fields() {
        let device = DeviceConfiguration::new("cfg", [2], 500_000)
            .with_analog([0], 10_000)
            .with_digital_threshold(1.8);
        let mode = CaptureMode::Trigger(TriggerSpec::new(2, TriggerEdge::Falling, 0.25));
        let line = encode_start(&CaptureRequest {
            device_id: "D",
            device: &device,
            mode: &mode,
        })
        .encode()
        .unwrap();
        assert_eq!(
            line,
            "START_CAPTURE\tdevice=D\tdigital=2\tdigital_rate=500000\tanalog=0\tanalog_rate=10000\tthreshold=1.8\tmode=trigger\tchannel=2\tedge=falling\tafter=0.25\n"
        );
    }

    #[test]
    fn test_nak_maps_to_remote_error() {
        let (addr, _server) = serve(vec!["NAK\tUNKNOWN_ANALYZER\tno decoder 'Foo'\n"]);
        let service = SocketAutomationService::new(&config_for(&addr));

        let err = service
            .add_analyzer(&CaptureId("1".into()), "Foo", "foo", &AnalyzerSettings::new())
            .unwrap_err();
        assert_eq!(
            err,
            ServiceError::Remote {
                code: RemoteCode::UnknownAnalyzer,
                message: "no decoder 'Foo'".into()
            }
        );
    }

    #[test]
    fn test_absent_service_is_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = SocketAutomationService::connect(&config_for(&addr)).unwrap_err();
        assert!(matches!(err, ServiceError::ConnectionRefused { .. }));

        let lazy = SocketAutomationService::new(&config_for(&addr));
        assert!(matches!(
            lazy.get_devices(),
            Err(ServiceError::ConnectionRefused { .. })
        ));
    }

    #[test]
    fn test_wait_capture_timeout() {
        let (addr, _server) = serve(vec!["", "NAK\tABORTED\taborted\n"]);
        let service = SocketAutomationService::new(&config_for(&addr));

        let err = service
            .wait_capture(&CaptureId("3".into()), Duration::from_millis(50), &CancelHandle::new())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { operation: "WAIT_CAPTURE", .. }));
    }

    /// Answers every request line on its own connection; waits take `wait_for`.
    fn serve_concurrently(wait_for: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    let reader = BufReader::new(stream);
                    for line in reader.lines() {
                        let Ok(line) = line else { break };
                        let reply = if line.starts_with("WAIT_") {
                            thread::sleep(wait_for);
                            "ACK\n"
                        } else {
                            "SIM0\tLOGIC_8\t1\nACK\n"
                        };
                        if writer.write_all(reply.as_bytes()).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_long_wait_does_not_block_other_requests() {
        let addr = serve_concurrently(Duration::from_millis(500));
        let service = Arc::new(SocketAutomationService::new(&config_for(&addr)));

        let waiter = {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                service.wait_capture(&CaptureId("1".into()), Duration::from_secs(5), &CancelHandle::new())
            })
        };
        thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let devices = service.get_devices().unwrap();
        assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
        assert_eq!(devices.len(), 1);
        assert!(!waiter.is_finished());
        waiter.join().unwrap().unwrap();
    }
}
