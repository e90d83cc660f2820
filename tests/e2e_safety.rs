//! E2E tests for the safety gates
//!
//! Verifies that an over-limit waveform never reaches the AWG, that device
//! faults end the session with the lock released, and that every write is
//! bounded and bracketed by the self-scan pause.

use pulseshaper::device::{
    DeviceError, DeviceLock, PvNames, SafetyGatedWriter, WriteMethod, WriterConfig, WriterError,
};
use pulseshaper::session::config::TimingSettings;
use pulseshaper::session::{
    AlwaysProceed, Backend, Decision, DecisionRequest, FeedbackLoopController, Operator,
    ScriptedOperator, SessionConfig, SessionError, SessionState,
};
use pulseshaper::sim::{ScopeHandle, ScopeSettings, SimulatedAwg, SimulatedScope};
use pulseshaper::trace::{shapes, Trace};

const DAC: f64 = 1000.0;

fn config(pulse: usize) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.awg.pulse_size = pulse;
    config.control.gain = 1.0;
    config.control.max_percent_change = 25.0;
    config.timing = TimingSettings::immediate();
    config
}

fn session(
    mut config: SessionConfig,
    awg: &SimulatedAwg,
    scope: SimulatedScope,
    operator: impl Operator + 'static,
    lock: &DeviceLock,
) -> FeedbackLoopController {
    let (start, length) = scope.pulse_window();
    config.feedback.crop = Some([start, length]);
    let pulse = config.awg.pulse_size;
    FeedbackLoopController::new(
        config,
        Trace::target("square", shapes::square(pulse)),
        Backend::Devices {
            awg: Box::new(awg.clone()),
            background: Some(scope.background()),
            feedback: Box::new(scope),
        },
        Box::new(operator),
        lock.clone(),
    )
    .unwrap()
}

/// Proceeds every time, tripping a scope fault once `iteration` is reached
struct FaultAt {
    iteration: u32,
    scope: ScopeHandle,
    fault: fn(&ScopeHandle),
}

impl Operator for FaultAt {
    fn decide(&mut self, request: &DecisionRequest) -> Decision {
        if request.iteration == self.iteration {
            (self.fault)(&self.scope);
        }
        Decision::Proceed
    }
}

#[test]
fn test_peak_power_over_limit_never_written() {
    let awg = SimulatedAwg::new("AWG", DAC, vec![DAC, 0.2 * DAC, 0.2 * DAC, 0.2 * DAC]);
    let scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(4));
    let mut cfg = config(4);
    cfg.control.max_percent_change = 0.0;
    cfg.safety.peak_power_limit = 2.0;
    let lock = DeviceLock::new("AWG");
    let mut session = session(cfg, &awg, scope, AlwaysProceed, &lock);

    let err = session.execute().unwrap_err();
    assert!(matches!(err, SessionError::PeakPowerExceeded { .. }), "got {}", err);
    assert_eq!(session.state(), SessionState::SafetyStop);
    assert!(awg.writes().is_empty(), "nothing may reach the AWG");
    assert_eq!(awg.samples(), vec![DAC, 0.2 * DAC, 0.2 * DAC, 0.2 * DAC]);
    assert!(!lock.is_held());
    assert_eq!(session.history().outcome, Some(SessionState::SafetyStop));
}

#[test]
fn test_every_sample_step_is_bounded() {
    let initial = vec![0.1 * DAC; 12];
    let awg = SimulatedAwg::new("AWG", DAC, initial.clone());
    let scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(8));
    let mut cfg = config(8);
    cfg.control.max_percent_change = 10.0;
    let lock = DeviceLock::new("AWG");
    let mut session = session(
        cfg,
        &awg,
        scope,
        ScriptedOperator::new([Decision::Proceed, Decision::Abort]),
        &lock,
    );

    assert_eq!(session.execute().unwrap(), SessionState::Aborted);

    let names = awg.names();
    let mut last = initial;
    for write in awg.writes() {
        for (i, before) in last.iter_mut().enumerate().take(8) {
            if write.pv == names.set_sample(i) {
                let step = 100.0 * (write.value - *before).abs() / DAC;
                assert!(step <= 10.0 + 1e-9, "sample {} stepped {}%", i, step);
                *before = write.value;
            }
        }
    }
    // a flat 10% drive normalizes to full scale, so every sample was clamped
    assert!(awg.samples()[..8].iter().all(|&v| (v - 0.2 * DAC).abs() < 1e-9));
}

#[test]
fn test_first_iteration_clears_samples_after_pulse() {
    let mut initial = vec![0.5 * DAC; 8];
    initial.extend([0.3 * DAC, 0.0, 0.1 * DAC]);
    let awg = SimulatedAwg::new("AWG", DAC, initial);
    let scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(8));
    let lock = DeviceLock::new("AWG");
    let mut session = session(
        config(8),
        &awg,
        scope,
        ScriptedOperator::new([Decision::Proceed, Decision::Abort]),
        &lock,
    );

    session.execute().unwrap();
    assert_eq!(&awg.samples()[8..], &[0.0, 0.0, 0.0]);

    let names = awg.names();
    let writes = awg.writes();
    assert_eq!(writes.first().unwrap().pv, names.scan_disable());
    assert_eq!(writes.first().unwrap().value, 1.0);
    assert_eq!(writes.last().unwrap().pv, names.scan_disable());
    assert_eq!(writes.last().unwrap().value, 0.0);
    assert!(
        !writes.iter().any(|w| w.pv == names.set_sample(9)),
        "samples already at zero are left alone"
    );
    assert_eq!(awg.unbracketed_writes(), 0);
}

#[test]
fn test_scope_disconnect_faults_session() {
    let awg = SimulatedAwg::new("AWG", DAC, shapes::ramp(0.2, 0.8, 8).iter().map(|v| v * DAC).collect());
    let scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(8));
    let operator = FaultAt {
        iteration: 1,
        scope: scope.handle(),
        fault: |scope| scope.set_connected(false),
    };
    let lock = DeviceLock::new("AWG");
    let mut session = session(config(8), &awg, scope, operator, &lock);

    let err = session.execute().unwrap_err();
    assert!(matches!(err, SessionError::Acquisition(_)), "got {}", err);
    assert_eq!(session.state(), SessionState::Faulted);
    assert_eq!(session.iteration(), 1, "second waveform was written but never measured");
    assert!(!lock.is_held());
    assert!(!awg.scan_disabled());
}

#[test]
fn test_scope_resolution_change_faults_session() {
    let awg = SimulatedAwg::new("AWG", DAC, shapes::ramp(0.2, 0.8, 8).iter().map(|v| v * DAC).collect());
    let scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(8));
    let operator = FaultAt {
        iteration: 0,
        scope: scope.handle(),
        fault: |scope| scope.set_resolution(2.5e-10),
    };
    let lock = DeviceLock::new("AWG");
    let mut session = session(config(8), &awg, scope, operator, &lock);

    match session.execute() {
        Err(SessionError::Acquisition(e)) => {
            assert!(e.to_string().contains("resolution changed"), "got {}", e)
        }
        other => panic!("expected an acquisition fault, got {:?}", other.map_err(|e| e.to_string())),
    }
    assert_eq!(session.state(), SessionState::Faulted);
    assert_eq!(session.history().outcome, Some(SessionState::Faulted));
    assert!(!lock.is_held());
}

#[test]
fn test_bulk_commit_timeout_faults_and_resumes_scan() {
    let awg = SimulatedAwg::new("AWG", DAC, vec![0.5 * DAC; 8]);
    awg.set_stuck_busy(true);
    let scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(8));
    let mut cfg = config(8);
    cfg.awg.write_method = WriteMethod::Bulk;
    cfg.timing.busy_timeout = 0.05;
    let lock = DeviceLock::new("AWG");
    let mut session = session(cfg, &awg, scope, AlwaysProceed, &lock);

    let err = session.execute().unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Writer(WriterError::Device(DeviceError::BusyTimeout { .. }))
        ),
        "got {}",
        err
    );
    assert_eq!(session.state(), SessionState::Faulted);
    assert!(!awg.scan_disabled(), "self-scan must be resumed after a failed write");
    assert!(!lock.is_held());
}

#[test]
fn test_mismatched_waveform_rejected_before_any_write() {
    let awg = SimulatedAwg::new("AWG", DAC, vec![0.0; 100]);
    let mut writer = SafetyGatedWriter::connect(
        Box::new(awg.clone()),
        PvNames::new("AWG", false),
        WriterConfig::new(82, 25.0),
    )
    .unwrap();

    let err = writer.write(&[0.5; 80], true).unwrap_err();
    assert_eq!(
        err,
        WriterError::ShapeMismatch {
            expected: 82,
            actual: 80
        }
    );
    assert!(awg.writes().is_empty());
}

#[test]
fn test_second_session_on_busy_device_refused() {
    let awg = SimulatedAwg::new("AWG", DAC, vec![0.5 * DAC; 8]);
    let lock = DeviceLock::new("AWG");
    let mut first = session(
        config(8),
        &awg,
        SimulatedScope::new(awg.clone(), ScopeSettings::centered(8)),
        AlwaysProceed,
        &lock,
    );
    let mut second = session(
        config(8),
        &awg,
        SimulatedScope::new(awg.clone(), ScopeSettings::centered(8)),
        AlwaysProceed,
        &lock,
    );

    first.start().unwrap();
    assert!(matches!(second.start(), Err(SessionError::AlreadyActive(name)) if name == "AWG"));
    assert!(awg.writes().is_empty());
}
