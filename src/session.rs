//! Capture session handles and their lifecycle.
//!
//! ```text
//! Created -> Armed (trigger only) -> Running -> Completed -> Saved | Exported
//!     \________________\_______________\___________\______> Failed
//! ```
//!
//! `Saved`, `Exported` and `Failed` are terminal. A session is driven through
//! `&mut` by the controller, so one handle can only ever be in one lifecycle
//! call at a time; cancelling from elsewhere goes through a [`CancelHandle`].

use crate::analyzer::AnalyzerAttachment;
use crate::registry::{CaptureConfiguration, DeviceConfiguration};
use crate::trigger_config::TriggerSpec;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier the automation service gave to a capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CaptureId(pub String);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cooperative cancellation flag shared between a session and other threads.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Armed,
    Running,
    Completed,
    Saved,
    Exported,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Saved | Self::Exported | Self::Failed)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (state, Failed) => !state.is_terminal(),
            (Created, Armed) | (Created, Running) => true,
            (Armed, Running) => true,
            (Running, Completed) => true,
            (Completed, Saved) | (Completed, Exported) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Armed => "armed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Saved => "saved",
            Self::Exported => "exported",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Capture session is {actual}, expected {expected}")]
pub struct InvalidTransition {
    pub expected: &'static str,
    pub actual: SessionState,
}

/// How the remote capture decides when to stop recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureMode {
    /// Records until explicitly stopped.
    Manual,
    Timed(Arc<CaptureConfiguration>),
    Trigger(TriggerSpec),
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Manual => "manual",
            CaptureMode::Timed(_) => "timed",
            CaptureMode::Trigger(_) => "trigger",
        }
    }
}

#[derive(Debug)]
pub struct CaptureSession {
    capture_id: Option<CaptureId>,
    device_id: Option<String>,
    device: Arc<DeviceConfiguration>,
    mode: CaptureMode,
    state: SessionState,
    analyzers: Vec<AnalyzerAttachment>,
    cancel: CancelHandle,
    created: Instant,
}

impl CaptureSession {
    pub(crate) fn new(device: Arc<DeviceConfiguration>, mode: CaptureMode) -> Self {
        Self {
            capture_id: None,
            device_id: None,
            device,
            mode,
            state: SessionState::Created,
            analyzers: Vec::new(),
            cancel: CancelHandle::new(),
            created: Instant::now(),
        }
    }

    /// Remote capture handle; present once the service accepted the capture.
    pub fn capture_id(&self) -> Option<&CaptureId> {
        self.capture_id.as_ref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn device(&self) -> &DeviceConfiguration {
        &self.device
    }

    pub fn mode(&self) -> &CaptureMode {
        &self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn analyzers(&self) -> &[AnalyzerAttachment] {
        &self.analyzers
    }

    pub fn analyzer(&self, label: &str) -> Option<&AnalyzerAttachment> {
        self.analyzers.iter().find(|a| a.label == label)
    }

    /// Handle that lets another thread cancel a wait on this session.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    pub(crate) fn bind(&mut self, capture_id: CaptureId, device_id: String) {
        self.capture_id = Some(capture_id);
        self.device_id = Some(device_id);
    }

    pub(crate) fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                expected: expected_before(next),
                actual: self.state,
            });
        }
        log::debug!(
            "Capture {} {} -> {}",
            self.capture_id.as_ref().map_or("<unbound>", |id| id.0.as_str()),
            self.state,
            next
        );
        self.state = next;
        if next.is_terminal() {
            self.analyzers.clear();
        }
        Ok(())
    }

    pub(crate) fn require(&self, state: SessionState) -> Result<(), InvalidTransition> {
        if self.state == state {
            Ok(())
        } else {
            Err(InvalidTransition {
                expected: expected_name(state),
                actual: self.state,
            })
        }
    }

    pub(crate) fn push_analyzer(&mut self, attachment: AnalyzerAttachment) {
        self.analyzers.push(attachment);
    }

    pub(crate) fn fail(&mut self) {
        if !self.state.is_terminal() {
            log::debug!("Capture {:?} failed in state {}", self.capture_id, self.state);
            self.state = SessionState::Failed;
            self.analyzers.clear();
        }
    }
}

fn expected_before(next: SessionState) -> &'static str {
    match next {
        SessionState::Armed | SessionState::Running => "created or armed",
        SessionState::Completed => "running",
        SessionState::Saved | SessionState::Exported => "completed",
        SessionState::Failed => "not finished",
        SessionState::Created => "new",
    }
}

fn expected_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Created => "created",
        SessionState::Armed => "armed",
        SessionState::Running => "running",
        SessionState::Completed => "completed",
        SessionState::Saved => "saved",
        SessionState::Exported => "exported",
        SessionState::Failed => "failed",
    }
}
