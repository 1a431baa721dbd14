//! # logic-automation-rs
//!
//! Capture orchestration for logic analyzers controlled through a vendor
//! automation service running on the local machine.
//!
//! The service does the sampling, triggering and protocol decoding. This
//! library keeps named device and capture configurations, sequences the
//! remote calls of a capture (start, optional trigger wait, completion wait,
//! save or export), attaches protocol decoders and computes simple signal
//! statistics from exported sample data.
//!
//! ## Features
//!
//! - **Configuration registries**: named, validated, immutable device and capture configurations
//! - **Capture lifecycle**: timed, manual and edge-triggered captures with bounded waits and cancellation
//! - **Protocol analyzers**: attach decoders such as async serial, I2C or SPI and export their tables
//! - **Signal statistics**: frequency and duty cycle of digital channels, voltage statistics of analog ones, using `polars`
//! - **Tool surface**: JSON in, JSON out dispatch for agent integrations
//!
//! ## Examples
//!
//! ### Timed capture
//!
//! ```rust,no_run
//! use logic_automation::{
//!     AutomationConfig, CaptureConfiguration, DeviceConfiguration, LogicController, SocketAutomationService,
//! };
//! use std::path::Path;
//!
//! let config = AutomationConfig::load_from(None)?;
//! let service = SocketAutomationService::connect(&config)?;
//! let controller = LogicController::new(service, config);
//!
//! controller.create_device_config(DeviceConfiguration::new("cfg1", [0, 1], 1_000_000))?;
//! controller.create_capture_config(CaptureConfiguration::new("cap1", 1.0))?;
//!
//! let mut session = controller.start("cfg1", Some("cap1"))?;
//! controller.wait(&mut session)?;
//! controller.save(&mut session, Path::new("/tmp/out.sal"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger
//!
//! ```rust
//! use logic_automation::trigger_config::{TriggerEdge, TriggerSpec};
//!
//! let trigger = TriggerSpec::start_capturing_when()
//!     .channel(0)
//!     .falling_edge()
//!     .then_record_for(0.5);
//! assert_eq!(trigger.edge, TriggerEdge::Falling);
//! ```
//!
//! ### Analysing an existing export
//!
//! ```rust,no_run
//! use logic_automation::{analyze_digital, read_digital_csv};
//! use std::path::Path;
//!
//! let df = read_digital_csv(Path::new("export/digital.csv"))?;
//! let result = analyze_digital(&df, 0)?;
//! println!("{:.1} Hz, duty {:.1}%", result.frequency_hz, result.duty_cycle * 100.0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analysis;
pub mod analyzer;
pub mod automation_service;
pub mod automation_terminal;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod device;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tools;
pub mod trigger_config;

pub use analysis::{
    analyze_analog, analyze_digital, estimate_sample_rate, AnalogAnalysis, AnalysisError, DigitalAnalysis, SampleRate,
};

pub use analyzer::{AnalyzerAttachment, AnalyzerId, AnalyzerSettings, DecoderKind, SettingValue};

pub use automation_service::{AutomationService, ExportFormat, ServiceError, SocketAutomationService};

pub use config::{AutomationConfig, ConfigFileError};

pub use controller::LogicController;

pub use dataset::{read_analog_csv, read_digital_csv, Sample, TimeWindow};

pub use device::{find_device_by_type, DeviceInfo, DeviceType};

pub use error::{ErrorKind, LogicError};

pub use registry::{CaptureConfiguration, ConfigError, DeviceConfiguration};

pub use session::{CancelHandle, CaptureId, CaptureMode, CaptureSession, SessionState};

pub use tools::{LogicTools, ToolError};

pub use trigger_config::{TriggerEdge, TriggerSpec};
