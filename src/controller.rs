use crate::analysis::{analyze_analog, analyze_digital, AnalogAnalysis, DigitalAnalysis};
use crate::analyzer::{remote_decoder_name, validate_settings, AnalyzerAttachment, AnalyzerSettings};
use crate::automation_service::{AutomationService, CaptureRequest, ExportFormat, RawExport, ServiceError};
use crate::config::{secs, AutomationConfig};
use crate::dataset::{analog_export_path, digital_export_path, read_analog_csv, read_digital_csv};
use crate::device::{find_device_by_type, DeviceInfo, DeviceType};
use crate::error::{LogicError, Result, Stage};
use crate::protocol::RemoteCode;
use crate::registry::{CaptureConfiguration, ConfigError, ConfigRegistry, DeviceConfiguration};
use crate::session::{CaptureId, CaptureMode, CaptureSession, InvalidTransition, SessionState};
use crate::trigger_config::TriggerSpec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Drives captures on an [`AutomationService`] using named configurations.
///
/// The controller owns both configuration registries. Sessions it hands out
/// are plain values; every lifecycle call takes the session by `&mut`, so a
/// session cannot be driven by two sequences at once.
#[derive(Debug)]
pub struct LogicController<S> {
    service: S,
    config: AutomationConfig,
    device_configs: ConfigRegistry<DeviceConfiguration>,
    capture_configs: ConfigRegistry<CaptureConfiguration>,
}

impl<S: AutomationService> LogicController<S> {
    pub fn new(service: S, config: AutomationConfig) -> Self {
        Self {
            service,
            config,
            device_configs: ConfigRegistry::new(),
            capture_configs: ConfigRegistry::new(),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub fn create_device_config(&self, config: DeviceConfiguration) -> Result<Arc<DeviceConfiguration>> {
        Ok(self.device_configs.create(config)?)
    }

    pub fn get_device_config(&self, name: &str) -> Result<Arc<DeviceConfiguration>> {
        Ok(self.device_configs.get(name)?)
    }

    pub fn list_device_configs(&self) -> Vec<String> {
        self.device_configs.list()
    }

    pub fn remove_device_config(&self, name: &str) -> bool {
        self.device_configs.remove(name)
    }

    pub fn create_capture_config(&self, config: CaptureConfiguration) -> Result<Arc<CaptureConfiguration>> {
        Ok(self.capture_configs.create(config)?)
    }

    pub fn get_capture_config(&self, name: &str) -> Result<Arc<CaptureConfiguration>> {
        Ok(self.capture_configs.get(name)?)
    }

    pub fn list_capture_configs(&self) -> Vec<String> {
        self.capture_configs.list()
    }

    pub fn remove_capture_config(&self, name: &str) -> bool {
        self.capture_configs.remove(name)
    }

    pub fn get_available_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self
            .service
            .get_devices()
            .map_err(|e| LogicError::from_service(e, Stage::Request))?;
        log::debug!("Automation service reports {} device(s)", devices.len());
        Ok(devices)
    }

    pub fn find_device_by_type(&self, device_type: DeviceType) -> Result<Option<DeviceInfo>> {
        let devices = self.get_available_devices()?;
        Ok(find_device_by_type(&devices, device_type).cloned())
    }

    /// Begin a capture. Without a capture configuration the capture runs
    /// until [`stop`](Self::stop) or [`wait`](Self::wait) ends it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn start(&self, device_config: &str, capture_config: Option<&str>) -> Result<CaptureSession> {
        let device = self.device_configs.get(device_config)?;
        let mode = match capture_config {
            Some(name) => CaptureMode::Timed(self.capture_configs.get(name)?),
            None => CaptureMode::Manual,
        };
        self.begin(device, mode, SessionState::Running)
    }

    /// Arm a trigger and block until the edge was seen and the post-trigger
    /// window has been recorded.
    ///
    /// This is [`arm_trigger`](Self::arm_trigger) followed by
    /// [`wait`](Self::wait). Callers that need to cancel the trigger wait from
    /// another thread arm first and take the session's [`CancelHandle`]
    /// before waiting.
    ///
    /// [`CancelHandle`]: crate::session::CancelHandle
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn start_with_trigger(&self, device_config: &str, trigger: TriggerSpec) -> Result<CaptureSession> {
        let mut session = self.arm_trigger(device_config, trigger)?;
        self.wait(&mut session)?;
        Ok(session)
    }

    /// Begin a trigger capture and return it armed, without waiting.
    ///
    /// The trigger channel is checked against the device configuration
    /// before anything is sent to the service.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn arm_trigger(&self, device_config: &str, trigger: TriggerSpec) -> Result<CaptureSession> {
        let device = self.device_configs.get(device_config)?;
        require_digital_channel(&device, trigger.channel)?;
        if !trigger.after_trigger_seconds.is_finite() || trigger.after_trigger_seconds < 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "after_trigger_seconds must be zero or positive, got {}",
                trigger.after_trigger_seconds
            ))
            .into());
        }
        self.begin(device, CaptureMode::Trigger(trigger), SessionState::Armed)
    }

    /// Block until the capture has finished recording.
    ///
    /// Armed trigger captures first wait for the trigger. Timed captures are
    /// given their duration plus the configured grace; manual captures are
    /// stopped first.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn wait(&self, session: &mut CaptureSession) -> Result<()> {
        if session.state() == SessionState::Armed {
            self.await_trigger(session)?;
        }
        session.require(SessionState::Running)?;
        let recording = match session.mode() {
            CaptureMode::Manual => return self.stop(session),
            CaptureMode::Timed(capture) => secs(capture.duration_seconds),
            CaptureMode::Trigger(trigger) => trigger.after_trigger(),
        };
        self.await_completion(session, recording + self.config.wait_grace())
    }

    fn await_trigger(&self, session: &mut CaptureSession) -> Result<()> {
        let id = bound_id(session)?;
        let cancel = session.cancel_handle();
        let timeout = self.config.trigger_timeout();
        if let CaptureMode::Trigger(trigger) = session.mode() {
            log::info!(
                "Capture {} armed on channel {} ({} edge), waiting up to {:?}",
                id,
                trigger.channel,
                trigger.edge,
                timeout
            );
        }
        if let Err(e) = self.service.wait_trigger(&id, timeout, &cancel) {
            return Err(self.abandon(session, e, Stage::Trigger));
        }
        session.transition(SessionState::Running)?;
        Ok(())
    }

    /// End recording now and wait for the service to finalise the capture.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn stop(&self, session: &mut CaptureSession) -> Result<()> {
        session.require(SessionState::Running)?;
        let id = bound_id(session)?;
        if let Err(e) = self.service.stop_capture(&id) {
            return Err(self.abandon(session, e, Stage::Request));
        }
        self.await_completion(session, self.config.wait_grace())
    }

    fn await_completion(&self, session: &mut CaptureSession, bound: Duration) -> Result<()> {
        let id = bound_id(session)?;
        let cancel = session.cancel_handle();
        log::debug!("Waiting up to {:?} for capture {}", bound, id);
        if let Err(e) = self.service.wait_capture(&id, bound, &cancel) {
            return Err(self.abandon(session, e, Stage::Capture));
        }
        session.transition(SessionState::Completed)?;
        Ok(())
    }

    /// Save the capture in the service's native format. Ends the session.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn save(&self, session: &mut CaptureSession, path: &Path) -> Result<()> {
        session.require(SessionState::Completed)?;
        let id = bound_id(session)?;
        if let Err(e) = self.service.save_capture(&id, path, self.config.export_timeout()) {
            return Err(self.abandon(session, e, Stage::Export));
        }
        log::info!("Capture {} saved to {}", id, path.display());
        self.finish(session, SessionState::Saved)
    }

    /// Export raw samples of every enabled channel into `directory`. Ends the
    /// session.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn export(&self, session: &mut CaptureSession, directory: &Path, format: ExportFormat) -> Result<()> {
        session.require(SessionState::Completed)?;
        let id = bound_id(session)?;
        if let Err(e) = std::fs::create_dir_all(directory) {
            self.release(session);
            session.fail();
            return Err(LogicError::Export(format!(
                "cannot create {}: {}",
                directory.display(),
                e
            )));
        }

        let digital = session.device().digital_channels.clone();
        let analog = session.device().analog_channel_set();
        let export = RawExport {
            directory,
            format,
            digital_channels: &digital,
            analog_channels: &analog,
        };
        if let Err(e) = self.service.export_raw(&id, &export, self.config.export_timeout()) {
            return Err(self.abandon(session, e, Stage::Export));
        }
        log::info!("Capture {} exported as {} to {}", id, format.as_str(), directory.display());
        self.finish(session, SessionState::Exported)
    }

    /// Cancel the session: any pending wait returns, the remote capture is
    /// released and the session is marked failed, whether or not the
    /// service acknowledges in time.
    pub fn cancel(&self, session: &mut CaptureSession) {
        session.cancel_handle().cancel();
        if !session.state().is_terminal() {
            log::info!("Cancelling capture {:?}", session.capture_id());
            self.release(session);
            session.fail();
        }
    }

    /// Drop a session without saving it, releasing the remote capture.
    pub fn discard(&self, session: &mut CaptureSession) {
        if !session.state().is_terminal() {
            log::debug!("Discarding capture {:?}", session.capture_id());
            self.release(session);
            session.fail();
        }
    }

    /// Attach a protocol decoder to a completed capture.
    #[tracing::instrument(level = "debug", skip(self, session, settings), fields(capture = ?session.capture_id()))]
    pub fn attach_analyzer(
        &self,
        session: &mut CaptureSession,
        decoder_type: &str,
        label: &str,
        settings: AnalyzerSettings,
    ) -> Result<AnalyzerAttachment> {
        session.require(SessionState::Completed)?;
        if label.trim().is_empty() || label.contains(['\t', '\n', '\r']) {
            return Err(ConfigError::InvalidParameter(format!("invalid analyzer label '{label}'")).into());
        }
        if session.analyzer(label).is_some() {
            return Err(LogicError::DuplicateLabel {
                label: label.to_string(),
            });
        }
        validate_settings(decoder_type, &settings, session.device())?;

        let id = bound_id(session)?;
        let remote_name = remote_decoder_name(decoder_type);
        let analyzer_id = self
            .service
            .add_analyzer(&id, &remote_name, label, &settings)
            .map_err(|e| match e {
                ServiceError::Remote {
                    code: RemoteCode::UnknownAnalyzer,
                    ..
                } => LogicError::UnknownDecoderType {
                    decoder: decoder_type.to_string(),
                },
                other => LogicError::from_service(other, Stage::Analyzer),
            })?;

        log::info!("Attached {} analyzer '{}' to capture {}", remote_name, label, id);
        let attachment = AnalyzerAttachment {
            decoder_type: remote_name,
            label: label.to_string(),
            settings,
            analyzer_id,
        };
        session.push_analyzer(attachment.clone());
        Ok(attachment)
    }

    /// Write the decoded table of the analyzer `label` to `path`. The session
    /// stays usable.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn export_analyzer(&self, session: &CaptureSession, label: &str, path: &Path) -> Result<()> {
        let attachment = session
            .analyzer(label)
            .ok_or_else(|| LogicError::Export(format!("no analyzer labelled '{label}' on this capture")))?;
        let id = bound_id(session)?;
        self.service
            .export_analyzer(&id, &attachment.analyzer_id, path, self.config.export_timeout())
            .map_err(|e| LogicError::from_service(e, Stage::Export))?;
        log::info!("Analyzer '{}' exported to {}", label, path.display());
        Ok(())
    }

    /// Capture, export as CSV and compute frequency and duty cycle of one
    /// digital channel.
    ///
    /// The whole sequence blocks. To cancel it from another thread, run the
    /// steps separately: [`start`](Self::start), [`wait`](Self::wait), then
    /// [`analyze_digital_capture`](Self::analyze_digital_capture).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn capture_and_analyze_digital(
        &self,
        device_config: &str,
        capture_config: &str,
        channel: u32,
    ) -> Result<DigitalAnalysis> {
        require_digital_channel(&*self.device_configs.get(device_config)?, channel)?;
        let mut session = self.start(device_config, Some(capture_config))?;
        self.wait(&mut session)?;
        self.analyze_digital_capture(&mut session, channel)
    }

    /// Capture, export as CSV and compute voltage statistics of one analog
    /// channel.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn capture_and_analyze_analog(
        &self,
        device_config: &str,
        capture_config: &str,
        channel: u32,
    ) -> Result<AnalogAnalysis> {
        require_analog_channel(&*self.device_configs.get(device_config)?, channel)?;
        let mut session = self.start(device_config, Some(capture_config))?;
        self.wait(&mut session)?;
        self.analyze_analog_capture(&mut session, channel)
    }

    /// Export a completed capture as CSV into the export directory and
    /// analyse one digital channel. Ends the session.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn analyze_digital_capture(&self, session: &mut CaptureSession, channel: u32) -> Result<DigitalAnalysis> {
        session.require(SessionState::Completed)?;
        require_digital_channel(session.device(), channel)?;
        let directory = self.export_for_analysis(session)?;
        let df = read_digital_csv(&digital_export_path(&directory))?;
        Ok(analyze_digital(&df, channel)?)
    }

    /// Export a completed capture as CSV into the export directory and
    /// analyse one analog channel. Ends the session.
    #[tracing::instrument(level = "debug", skip(self, session), fields(capture = ?session.capture_id()))]
    pub fn analyze_analog_capture(&self, session: &mut CaptureSession, channel: u32) -> Result<AnalogAnalysis> {
        session.require(SessionState::Completed)?;
        require_analog_channel(session.device(), channel)?;
        let directory = self.export_for_analysis(session)?;
        let df = read_analog_csv(&analog_export_path(&directory))?;
        Ok(analyze_analog(&df, channel)?)
    }

    /// Export into `<export_directory>/capture-<id>`, emptied first so files
    /// of an earlier capture with the same id are never read back.
    fn export_for_analysis(&self, session: &mut CaptureSession) -> Result<PathBuf> {
        let id = bound_id(session)?;
        let directory = self.config.export_directory.join(export_dir_name(&id));
        if directory.exists() {
            log::debug!("Clearing stale export directory {}", directory.display());
            if let Err(e) = std::fs::remove_dir_all(&directory) {
                self.discard(session);
                return Err(LogicError::Export(format!(
                    "cannot clear {}: {}",
                    directory.display(),
                    e
                )));
            }
        }
        self.export(session, &directory, ExportFormat::Csv)?;
        Ok(directory)
    }

    fn begin(&self, device: Arc<DeviceConfiguration>, mode: CaptureMode, state: SessionState) -> Result<CaptureSession> {
        let hardware = self.resolve_device(&device)?;
        let mut session = CaptureSession::new(device, mode);

        let request = CaptureRequest {
            device_id: &hardware.device_id,
            device: session.device(),
            mode: session.mode(),
        };
        let id = self
            .service
            .start_capture(&request)
            .map_err(|e| LogicError::from_service(e, Stage::Request))?;

        log::info!(
            "Started {} capture {} on {} {}",
            session.mode().as_str(),
            id,
            hardware.device_type,
            hardware.masked_id()
        );
        session.bind(id, hardware.device_id);
        if let Err(e) = session.transition(state) {
            self.release(&session);
            session.fail();
            return Err(e.into());
        }
        Ok(session)
    }

    /// Pick the device a configuration runs on and re-check the hardware
    /// constraints against it.
    fn resolve_device(&self, device: &DeviceConfiguration) -> Result<DeviceInfo> {
        let devices = self.get_available_devices()?;
        let found = match device.device_type {
            Some(device_type) => find_device_by_type(&devices, device_type),
            None => devices.first(),
        }
        .cloned()
        .ok_or_else(|| LogicError::NoDevice {
            device_type: device.device_type.map(|t| t.to_string()),
        })?;

        device.check_hardware(found.device_type)?;
        Ok(found)
    }

    /// Release the remote capture, mark the session failed and translate the
    /// service error.
    fn abandon(&self, session: &mut CaptureSession, error: ServiceError, stage: Stage) -> LogicError {
        log::warn!("Capture {:?} failed: {}", session.capture_id(), error);
        self.release(session);
        session.fail();
        LogicError::from_service(error, stage)
    }

    fn finish(&self, session: &mut CaptureSession, state: SessionState) -> Result<()> {
        session.transition(state)?;
        self.release(session);
        Ok(())
    }

    /// Best-effort: stop a capture that may still be recording, then close it.
    fn release(&self, session: &CaptureSession) {
        let Some(id) = session.capture_id() else {
            return;
        };
        if matches!(session.state(), SessionState::Armed | SessionState::Running) {
            if let Err(e) = self.service.stop_capture(id) {
                log::warn!("Failed to stop capture {}: {}", id, e);
            }
        }
        if let Err(e) = self.service.close_capture(id) {
            log::warn!("Failed to close capture {}: {}", id, e);
        }
    }
}

pub(crate) fn require_digital_channel(device: &DeviceConfiguration, channel: u32) -> Result<()> {
    if device.has_digital_channel(channel) {
        Ok(())
    } else {
        Err(LogicError::InvalidChannel {
            channel,
            config: device.name.clone(),
        })
    }
}

pub(crate) fn require_analog_channel(device: &DeviceConfiguration, channel: u32) -> Result<()> {
    if device.has_analog_channel(channel) {
        Ok(())
    } else {
        Err(LogicError::InvalidChannel {
            channel,
            config: device.name.clone(),
        })
    }
}

fn bound_id(session: &CaptureSession) -> Result<CaptureId> {
    session.capture_id().cloned().ok_or_else(|| {
        InvalidTransition {
            expected: "started",
            actual: session.state(),
        }
        .into()
    })
}

/// Directory name for an export, safe whatever the service's id looks like.
fn export_dir_name(id: &CaptureId) -> String {
    let safe: String = id
        .0
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("capture-{safe}")
}
