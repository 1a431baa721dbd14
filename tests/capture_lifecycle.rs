mod common;

use common::{fast_config, square_wave_csv, Script, ScriptedService, WaitOutcome};
use logic_automation::automation_service::ServiceError;
use logic_automation::{
    CaptureConfiguration, ConfigError, DeviceConfiguration, DeviceInfo, DeviceType, ErrorKind, ExportFormat,
    LogicController, LogicError, SessionState, TriggerEdge, TriggerSpec,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn controller(script: Script) -> (Arc<ScriptedService>, LogicController<Arc<ScriptedService>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(ScriptedService::new(script));
    let controller = LogicController::new(Arc::clone(&service), fast_config(dir.path().join("exports")));
    controller
        .create_device_config(DeviceConfiguration::new("cfg1", [0, 1], 1_000_000))
        .unwrap();
    controller
        .create_capture_config(CaptureConfiguration::new("cap1", 0.01))
        .unwrap();
    (service, controller, dir)
}

#[test]
fn test_timed_capture_is_saved() {
    let (service, controller, dir) = controller(Script::default());

    let mut session = controller.start("cfg1", Some("cap1")).unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.device_id(), Some("F4241A7D0E3B"));

    controller.wait(&mut session).unwrap();
    assert_eq!(session.state(), SessionState::Completed);

    let out = dir.path().join("out.bin");
    controller.save(&mut session, &out).unwrap();
    assert_eq!(session.state(), SessionState::Saved);

    assert_eq!(
        service.calls(),
        vec![
            "get_devices".to_string(),
            "start_capture:timed:F4241A7D0E3B".to_string(),
            "wait_capture:1".to_string(),
            format!("save_capture:1:{}", out.display()),
            "close_capture:1".to_string(),
        ]
    );
}

#[test]
fn test_missing_configuration_never_reaches_service() {
    let (service, controller, _dir) = controller(Script::default());

    let err = controller.start("cfgX", Some("cap1")).unwrap_err();
    assert!(matches!(err, LogicError::Config(ConfigError::NotFound { kind: "device", .. })));
    let err = controller.start("cfg1", Some("capX")).unwrap_err();
    assert!(matches!(err, LogicError::Config(ConfigError::NotFound { kind: "capture", .. })));
    assert!(service.calls().is_empty());
}

#[test]
fn test_duplicate_config_keeps_original() {
    let (_service, controller, _dir) = controller(Script::default());
    let err = controller
        .create_device_config(DeviceConfiguration::new("cfg1", [5], 10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(
        controller.get_device_config("cfg1").unwrap().digital_channels,
        BTreeSet::from([0, 1])
    );
    assert_eq!(controller.list_device_configs(), vec!["cfg1"]);
}

#[test]
fn test_manual_capture_is_stopped_on_wait() {
    let (service, controller, _dir) = controller(Script::default());

    let mut session = controller.start("cfg1", None).unwrap();
    controller.wait(&mut session).unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(
        service.calls()[1..],
        ["start_capture:manual:F4241A7D0E3B", "stop_capture:1", "wait_capture:1"]
    );
}

#[test]
fn test_wait_timeout_fails_session_and_releases_capture() {
    let (service, controller, _dir) = controller(Script {
        wait_capture: WaitOutcome::Hang,
        ..Script::default()
    });

    let mut session = controller.start("cfg1", Some("cap1")).unwrap();
    let err = controller.wait(&mut session).unwrap_err();
    assert!(matches!(err, LogicError::CaptureTimeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(service.count("stop_capture:1"), 1);
    assert_eq!(service.count("close_capture:1"), 1);

    // A failed session accepts no further lifecycle calls.
    assert!(matches!(
        controller.save(&mut session, std::path::Path::new("x.sal")),
        Err(LogicError::Session(_))
    ));
}

#[test]
fn test_cancel_from_another_thread_ends_wait() {
    let (service, controller, _dir) = controller(Script {
        wait_capture: WaitOutcome::Hang,
        ..Script::default()
    });
    controller
        .create_capture_config(CaptureConfiguration::new("long", 60.0))
        .unwrap();

    let mut session = controller.start("cfg1", Some("long")).unwrap();
    let handle = session.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.cancel();
    });

    let err = controller.wait(&mut session).unwrap_err();
    canceller.join().unwrap();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(service.count("close_capture:1"), 1);
}

#[test]
fn test_cancel_marks_failed_and_releases() {
    let (service, controller, _dir) = controller(Script::default());
    let mut session = controller.start("cfg1", Some("cap1")).unwrap();

    controller.cancel(&mut session);
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.cancel_handle().is_cancelled());
    assert_eq!(service.count("stop_capture:1"), 1);
    assert_eq!(service.count("close_capture:1"), 1);

    // Cancelling again does not talk to the service.
    controller.cancel(&mut session);
    assert_eq!(service.count("close_capture:1"), 1);
}

#[test]
fn test_remote_failure_during_wait_is_reported_as_is() {
    let (service, controller, _dir) = controller(Script {
        wait_capture: WaitOutcome::Fail(ServiceError::ConnectionLost),
        ..Script::default()
    });

    let mut session = controller.start("cfg1", Some("cap1")).unwrap();
    let err = controller.wait(&mut session).unwrap_err();
    assert!(matches!(err, LogicError::ConnectionLost));
    assert_eq!(session.state(), SessionState::Failed);
    // No retry of the wait.
    assert_eq!(service.count("wait_capture"), 1);
}

#[test]
fn test_threshold_checked_against_resolved_hardware() {
    let (service, controller, _dir) = controller(Script {
        devices: vec![DeviceInfo::new("0123456789".into(), DeviceType::Logic8, false)],
        ..Script::default()
    });
    controller
        .create_device_config(DeviceConfiguration::new("thr", [0], 1_000_000).with_digital_threshold(1.8))
        .unwrap();

    let err = controller.start("thr", Some("cap1")).unwrap_err();
    assert!(matches!(
        err,
        LogicError::Config(ConfigError::ThresholdNotSupported {
            device_type: DeviceType::Logic8
        })
    ));
    assert_eq!(service.count("start_capture"), 0);
}

#[test]
fn test_configured_device_type_must_be_present() {
    let (service, controller, _dir) = controller(Script::default());
    controller
        .create_device_config(DeviceConfiguration::new("l8", [0], 1_000_000).for_device(DeviceType::Logic8))
        .unwrap();

    let err = controller.start("l8", None).unwrap_err();
    assert!(matches!(err, LogicError::NoDevice { .. }));
    assert_eq!(service.count("start_capture"), 0);
}

#[test]
fn test_trigger_with_unknown_channel_makes_no_remote_call() {
    let (service, controller, _dir) = controller(Script::default());

    let err = controller
        .start_with_trigger("cfg1", TriggerSpec::new(7, TriggerEdge::Rising, 0.1))
        .unwrap_err();
    assert!(matches!(err, LogicError::InvalidChannel { channel: 7, .. }));
    assert!(service.calls().is_empty());
}

#[test]
fn test_triggered_capture_completes_and_exports() {
    let (service, controller, dir) = controller(Script::default());
    let trigger = TriggerSpec::start_capturing_when()
        .channel(1)
        .falling_edge()
        .then_record_for(0.01);

    let mut session = controller.start_with_trigger("cfg1", trigger).unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(service.count("start_capture:trigger"), 1);
    assert_eq!(service.count("wait_trigger:1"), 1);

    let export_dir = dir.path().join("triggered");
    controller.export(&mut session, &export_dir, ExportFormat::Csv).unwrap();
    assert_eq!(session.state(), SessionState::Exported);
    assert!(export_dir.join("digital.csv").exists());
}

#[test]
fn test_trigger_timeout() {
    let (service, controller, _dir) = controller(Script {
        wait_trigger: WaitOutcome::Hang,
        ..Script::default()
    });

    let err = controller
        .start_with_trigger("cfg1", TriggerSpec::new(0, TriggerEdge::Either, 0.1))
        .unwrap_err();
    assert!(matches!(err, LogicError::TriggerTimeout { .. }));
    assert_eq!(service.count("wait_capture"), 0);
    assert_eq!(service.count("stop_capture:1"), 1);
    assert_eq!(service.count("close_capture:1"), 1);
}

#[test]
fn test_export_failure_is_export_error() {
    let (_service, controller, dir) = controller(Script::default());
    let mut session = controller.start("cfg1", Some("cap1")).unwrap();
    controller.wait(&mut session).unwrap();

    controller.service().update(|s| {
        s.export_error = Some(ServiceError::Remote {
            code: logic_automation::protocol::RemoteCode::Io,
            message: "disk full".into(),
        });
    });
    let err = controller
        .export(&mut session, &dir.path().join("e"), ExportFormat::Binary)
        .unwrap_err();
    assert!(matches!(err, LogicError::Export(_)));
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn test_discard_releases_completed_capture() {
    let (service, controller, _dir) = controller(Script::default());
    let mut session = controller.start("cfg1", Some("cap1")).unwrap();
    controller.wait(&mut session).unwrap();

    controller.discard(&mut session);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(service.count("stop_capture"), 0);
    assert_eq!(service.count("close_capture:1"), 1);
}

#[test]
fn test_capture_and_analyze_digital() {
    let (_service, controller, _dir) = controller(Script::default());

    let result = controller.capture_and_analyze_digital("cfg1", "cap1", 0).unwrap();
    assert!((result.frequency_hz - 1_000.0).abs() < 1.0, "{}", result.frequency_hz);
    assert!((result.duty_cycle - 0.5).abs() < 0.01, "{}", result.duty_cycle);

    // Channel 1 is constantly high.
    let err = controller.capture_and_analyze_digital("cfg1", "cap1", 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Analysis);
}

#[test]
fn test_capture_and_analyze_rejects_disabled_channel() {
    let (service, controller, _dir) = controller(Script::default());
    let err = controller.capture_and_analyze_digital("cfg1", "cap1", 3).unwrap_err();
    assert!(matches!(err, LogicError::InvalidChannel { channel: 3, .. }));
    let err = controller.capture_and_analyze_analog("cfg1", "cap1", 0).unwrap_err();
    assert!(matches!(err, LogicError::InvalidChannel { channel: 0, .. }));
    assert!(service.calls().is_empty());
}

#[test]
fn test_capture_and_analyze_analog() {
    let (_service, controller, _dir) = controller(Script::default());
    controller
        .create_device_config(DeviceConfiguration::new("mixed", [0], 1_000_000).with_analog([2], 10_000))
        .unwrap();

    let result = controller.capture_and_analyze_analog("mixed", "cap1", 2).unwrap();
    assert_eq!(result.min_volts, 0.5);
    assert_eq!(result.max_volts, 3.3);
    assert!((result.mean_volts - 1.75).abs() < 1e-12);
    assert_eq!(result.sample_count, 4);
}

#[test]
fn test_armed_trigger_wait_can_be_cancelled_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(ScriptedService::new(Script {
        wait_trigger: WaitOutcome::Hang,
        ..Script::default()
    }));
    let mut config = fast_config(dir.path().join("exports"));
    config.trigger_timeout_secs = 30.0;
    let controller = LogicController::new(Arc::clone(&service), config);
    controller
        .create_device_config(DeviceConfiguration::new("cfg1", [0, 1], 1_000_000))
        .unwrap();

    let mut session = controller
        .arm_trigger("cfg1", TriggerSpec::new(0, TriggerEdge::Rising, 0.1))
        .unwrap();
    assert_eq!(session.state(), SessionState::Armed);
    assert_eq!(service.count("wait_trigger"), 0);

    let handle = session.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.cancel();
    });
    let err = controller.wait(&mut session).unwrap_err();
    canceller.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(service.count("wait_trigger:1"), 1);
    assert_eq!(service.count("wait_capture"), 0);
    assert_eq!(service.count("stop_capture:1"), 1);
    assert_eq!(service.count("close_capture:1"), 1);
}

#[test]
fn test_wait_on_armed_session_waits_for_trigger_then_capture() {
    let (service, controller, _dir) = controller(Script::default());

    let mut session = controller
        .arm_trigger("cfg1", TriggerSpec::new(1, TriggerEdge::Either, 0.01))
        .unwrap();
    controller.wait(&mut session).unwrap();
    assert_eq!(session.state(), SessionState::Completed);

    let calls = service.calls();
    let trigger = calls.iter().position(|c| c == "wait_trigger:1").unwrap();
    let capture = calls.iter().position(|c| c == "wait_capture:1").unwrap();
    assert!(trigger < capture, "{calls:?}");
}

#[test]
fn test_negative_post_trigger_window_is_rejected_locally() {
    let (service, controller, _dir) = controller(Script::default());
    let err = controller
        .arm_trigger("cfg1", TriggerSpec::new(0, TriggerEdge::Rising, -1.0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(service.calls().is_empty());
}

#[test]
fn test_stale_export_files_are_not_analysed() {
    let (service, controller, dir) = controller(Script {
        export_writes_files: false,
        ..Script::default()
    });
    // Left behind by an earlier capture that was also given id 1.
    let stale = dir.path().join("exports").join("capture-1");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("digital.csv"), square_wave_csv(1_000.0, 0.5, 100_000.0, 10)).unwrap();

    let err = controller.capture_and_analyze_digital("cfg1", "cap1", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Analysis);
    assert!(!stale.join("digital.csv").exists());
    assert_eq!(service.count("export_raw:1:csv"), 1);
}

#[test]
fn test_analysis_steps_run_separately() {
    let (service, controller, _dir) = controller(Script::default());

    let mut session = controller.start("cfg1", Some("cap1")).unwrap();
    let err = controller.analyze_digital_capture(&mut session, 0).unwrap_err();
    assert!(matches!(err, LogicError::Session(_)));

    controller.wait(&mut session).unwrap();
    let err = controller.analyze_digital_capture(&mut session, 4).unwrap_err();
    assert!(matches!(err, LogicError::InvalidChannel { channel: 4, .. }));
    assert_eq!(session.state(), SessionState::Completed);

    let result = controller.analyze_digital_capture(&mut session, 0).unwrap();
    assert!((result.frequency_hz - 1_000.0).abs() < 1.0);
    assert_eq!(session.state(), SessionState::Exported);
    assert_eq!(service.count("close_capture:1"), 1);
}
