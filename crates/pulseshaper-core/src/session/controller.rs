//! Feedback loop controller
//!
//! Drives one session through its states:
//!
//! ```text
//! Idle -> Running -> AwaitingDecision -> Running -> ...
//!                          |                 |
//!                          |                 +-> Converged | IterationLimit   (automatic mode)
//!                          +-> Paused -> Running (resume)
//!                          +-> Aborted
//!            Running -> SafetyStop   (peak power over limit, nothing applied)
//!            Running -> Faulted      (device or trace error)
//! ```
//!
//! Each iteration reads the AWG, computes the next waveform, waits for a
//! decision, checks the peak-power ceiling, writes, and re-measures. The
//! abort flag is polled only between those steps.

use super::config::SessionConfig;
use super::diagnostics::{DiagnosticWriter, IterationFiles};
use super::history::{IterationRecord, SessionHistory};
use super::operator::{AbortHandle, Decision, DecisionRequest, Operator};
use super::{SessionError, SessionState};
use crate::correction::{
    rms_error, CorrectionEngine, FilterRegistry, IterationPlan, PlanInputs, PluginError,
    StrategyRegistry, NO_FILTER,
};
use crate::device::{
    DeviceLock, DeviceLockGuard, FeedbackAcquisition, FeedbackSource, ProcessVariables, PvNames,
    SafetyGatedWriter,
};
use crate::trace::{ProcessRequest, Trace};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Abort polling interval during the automatic countdown
const COUNTDOWN_TICK: Duration = Duration::from_millis(50);

/// What the session talks to
pub enum Backend {
    /// AWG process variables and a feedback source
    Devices {
        awg: Box<dyn ProcessVariables>,
        feedback: Box<dyn FeedbackSource>,
        /// Record taken with no pulse present, subtracted when given
        background: Option<Trace>,
    },
    /// No device I/O: each applied waveform becomes the next measurement
    Loopback {
        /// Output assumed before the first iteration
        initial_output: Vec<f64>,
    },
}

enum Link {
    Devices {
        writer: SafetyGatedWriter,
        acquisition: FeedbackAcquisition,
    },
    Loopback {
        initial_output: Vec<f64>,
    },
}

pub struct FeedbackLoopController {
    config: SessionConfig,
    /// Normalized, `pulse_size` points
    target: Vec<f64>,
    engine: CorrectionEngine,
    link: Link,
    lock: DeviceLock,
    guard: Option<DeviceLockGuard>,
    operator: Box<dyn Operator>,
    abort: AbortHandle,
    diagnostics: Option<DiagnosticWriter>,
    state: SessionState,
    iteration: u32,
    gain: f64,
    awg_now: Vec<f64>,
    current_output: Vec<f64>,
    last_plan: Option<IterationPlan>,
    plugin_errors: Vec<PluginError>,
    history: SessionHistory,
}

impl FeedbackLoopController {
    /// Build a session with the built-in strategies and filters
    pub fn new(
        config: SessionConfig,
        target: Trace,
        backend: Backend,
        operator: Box<dyn Operator>,
        lock: DeviceLock,
    ) -> Result<Self, SessionError> {
        Self::with_plugins(
            config,
            target,
            backend,
            operator,
            lock,
            &StrategyRegistry::new(),
            &FilterRegistry::new(),
        )
    }

    /// Build a session, resolving the configured strategy and filter by name
    ///
    /// Unknown names fall back to the default strategy or no filter; the
    /// lookup errors are kept in [`plugin_errors`](Self::plugin_errors).
    pub fn with_plugins(
        config: SessionConfig,
        mut target: Trace,
        backend: Backend,
        operator: Box<dyn Operator>,
        lock: DeviceLock,
        strategies: &StrategyRegistry,
        filters: &FilterRegistry,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let pulse_size = config.awg.pulse_size;

        let target = target
            .process(&ProcessRequest {
                resample_to: Some(pulse_size),
                normalize: true,
                ..Default::default()
            })?
            .to_vec();

        let mut plugin_errors = Vec::new();
        let (strategy, strategy_err) = strategies.resolve(&config.plugins.strategy);
        plugin_errors.extend(strategy_err);
        let filter = if config.plugins.filter == NO_FILTER {
            None
        } else {
            match filters.resolve(&config.plugins.filter) {
                (filter, None) => Some(filter),
                (_, Some(e)) => {
                    plugin_errors.push(e);
                    None
                }
            }
        };
        let engine = CorrectionEngine::new(strategy, filter, config.step_limits());

        let link = match backend {
            Backend::Devices {
                awg,
                feedback,
                background,
            } => {
                let names = PvNames::new(config.awg.prefix.clone(), config.awg.ascii_readback);
                let writer = SafetyGatedWriter::connect(awg, names, config.writer_config())?;
                let acquisition =
                    FeedbackAcquisition::new(feedback, background, config.acquisition_settings())?;
                Link::Devices {
                    writer,
                    acquisition,
                }
            }
            Backend::Loopback { initial_output } => Link::Loopback { initial_output },
        };

        let diagnostics = if config.diagnostics.enabled {
            Some(DiagnosticWriter::new(&config.diagnostics.directory)?)
        } else {
            None
        };

        let history = SessionHistory::new(engine.strategy_name(), engine.filter_name());
        let gain = config.control.gain;

        Ok(Self {
            config,
            target,
            engine,
            link,
            lock,
            guard: None,
            operator,
            abort: AbortHandle::new(),
            diagnostics,
            state: SessionState::Idle,
            iteration: 0,
            gain,
            awg_now: Vec::new(),
            current_output: Vec::new(),
            last_plan: None,
            plugin_errors,
            history,
        })
    }

    /// Take the device lock and the first measurement
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "start",
            });
        }
        self.acquire_lock()?;
        info!(
            device = self.lock.name(),
            strategy = self.engine.strategy_name(),
            gain = self.gain,
            auto = self.config.safety.auto_loop,
            "Session started"
        );

        match self.initial_output() {
            Ok(output) => {
                self.current_output = output;
                self.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Initial measurement failed");
                self.finish(SessionState::Faulted);
                Err(e)
            }
        }
    }

    /// Continue a paused session from the same iteration
    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Paused {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "resume",
            });
        }
        self.acquire_lock()?;

        if let Link::Devices { acquisition, .. } = &mut self.link {
            match acquisition.measure() {
                Ok(trace) => self.current_output = trace.processed().to_vec(),
                Err(e) => {
                    let e = SessionError::from(e);
                    error!(error = %e, "Measurement on resume failed");
                    self.finish(SessionState::Faulted);
                    return Err(e);
                }
            }
        }

        self.state = SessionState::Running;
        info!(iteration = self.iteration, gain = self.gain, "Session resumed");
        Ok(())
    }

    /// Iterate until the session pauses or ends
    ///
    /// Returns the state reached. A safety stop or a device fault is
    /// returned as an error, with [`state`](Self::state) set to
    /// `SafetyStop` or `Faulted`.
    pub fn run(&mut self) -> Result<SessionState, SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "run",
            });
        }

        loop {
            match self.iterate() {
                Ok(None) => {}
                Ok(Some(state)) => {
                    self.finish(state);
                    return Ok(state);
                }
                Err(e) => {
                    let state = match e {
                        SessionError::PeakPowerExceeded { .. } => SessionState::SafetyStop,
                        _ => SessionState::Faulted,
                    };
                    error!(error = %e, %state, iteration = self.iteration, "Session stopped");
                    self.finish(state);
                    return Err(e);
                }
            }
        }
    }

    /// [`start`](Self::start) followed by [`run`](Self::run)
    pub fn execute(&mut self) -> Result<SessionState, SessionError> {
        self.start()?;
        self.run()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Completed (applied) iterations
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Gain used for the next plan
    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Processed target shape
    pub fn target(&self) -> &[f64] {
        &self.target
    }

    /// Latest normalized feedback measurement
    pub fn current_output(&self) -> &[f64] {
        &self.current_output
    }

    /// AWG output read at the start of the latest iteration
    pub fn awg_now(&self) -> &[f64] {
        &self.awg_now
    }

    /// Plan computed for the current iteration
    pub fn last_plan(&self) -> Option<&IterationPlan> {
        self.last_plan.as_ref()
    }

    /// RMS error of the latest measurement
    pub fn rms_error(&self) -> f64 {
        rms_error(&self.target, &self.current_output)
    }

    /// Per-iteration records so far
    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    /// Strategy and filter failures recovered so far
    pub fn plugin_errors(&self) -> &[PluginError] {
        &self.plugin_errors
    }

    /// Active correction strategy, after any fallback
    pub fn strategy_name(&self) -> &str {
        self.engine.strategy_name()
    }

    /// Flag another thread can set to stop the session
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// One pass; `Some` when the session should leave `Running`
    fn iterate(&mut self) -> Result<Option<SessionState>, SessionError> {
        if self.abort.is_requested() {
            info!(iteration = self.iteration, "Abort requested");
            return Ok(Some(SessionState::Aborted));
        }

        let rms = self.rms_error();
        if self.config.safety.auto_loop {
            if rms < self.config.control.tolerance {
                info!(iteration = self.iteration, rms, "Converged");
                return Ok(Some(SessionState::Converged));
            }
            if self.iteration >= self.config.control.max_iterations {
                info!(iteration = self.iteration, rms, "Iteration limit reached");
                return Ok(Some(SessionState::IterationLimit));
            }
        }

        self.awg_now = self.read_awg_now()?;
        let mut plan = self.plan()?;

        self.state = SessionState::AwaitingDecision;
        loop {
            let decision = if self.config.safety.auto_loop {
                self.countdown()
            } else {
                let request = self.request(&plan, rms);
                self.operator.decide(&request)
            };
            match decision {
                Decision::Proceed => break,
                Decision::Recalc(gain) => {
                    if gain > 0.0 {
                        self.gain = gain.min(1.0);
                    } else {
                        warn!(requested = gain, gain = self.gain, "Gain must be in (0, 1], keeping previous");
                    }
                    info!(iteration = self.iteration, gain = self.gain, "Recalculating");
                    plan = self.plan()?;
                }
                Decision::Pause => return Ok(Some(SessionState::Paused)),
                Decision::Abort => {
                    info!(iteration = self.iteration, "Operator aborted, waveform not applied");
                    return Ok(Some(SessionState::Aborted));
                }
            }
        }
        self.state = SessionState::Running;

        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.write_iteration(&IterationFiles {
                iteration: self.iteration,
                gain: self.gain,
                target: &self.target,
                background: self.background(),
                awg_now: &self.awg_now,
                factor: &plan.factor,
                scope_trace: &self.current_output,
            })?;
        }

        let limit = self.config.safety.peak_power_limit;
        if plan.peak_power > limit {
            let peak_power = plan.peak_power;
            self.history.push(IterationRecord::new(
                self.iteration,
                self.gain,
                rms,
                peak_power,
                false,
            ));
            self.last_plan = Some(plan);
            return Err(SessionError::PeakPowerExceeded { peak_power, limit });
        }

        if self.abort.is_requested() {
            info!(iteration = self.iteration, "Abort requested, waveform not applied");
            return Ok(Some(SessionState::Aborted));
        }

        self.apply(&plan.next)?;

        let rms_after = self.rms_error();
        self.history.push(IterationRecord::new(
            self.iteration,
            self.gain,
            rms_after,
            plan.peak_power,
            true,
        ));
        info!(
            iteration = self.iteration,
            rms = rms_after,
            peak_power = plan.peak_power,
            gain = self.gain,
            "Iteration applied"
        );
        self.last_plan = Some(plan);
        self.iteration += 1;
        Ok(None)
    }

    fn plan(&mut self) -> Result<IterationPlan, SessionError> {
        let plan = self.engine.plan(PlanInputs {
            target: &self.target,
            awg_now: &self.awg_now,
            current_output: &self.current_output,
            gain: self.gain,
            iteration: self.iteration,
        })?;
        self.plugin_errors.extend(plan.plugin_errors.iter().cloned());
        debug!(
            iteration = self.iteration,
            peak_power = plan.peak_power,
            "Next waveform computed"
        );
        Ok(plan)
    }

    fn read_awg_now(&mut self) -> Result<Vec<f64>, SessionError> {
        match &mut self.link {
            Link::Devices { writer, .. } => {
                let sample = writer.read_current()?;
                Ok(sample.pulse(self.config.awg.pulse_size).to_vec())
            }
            Link::Loopback { .. } => Ok(self.current_output.clone()),
        }
    }

    /// Write `next` and measure the result
    fn apply(&mut self, next: &[f64]) -> Result<(), SessionError> {
        let zero_to_end = self.iteration == 0;
        match &mut self.link {
            Link::Devices {
                writer,
                acquisition,
            } => {
                let report = writer.write(next, zero_to_end)?;
                if !report.skipped.is_empty() {
                    warn!(skipped = ?report.skipped, "Samples above full scale were not written");
                }
                debug!(
                    written = report.written,
                    clamped = report.clamped,
                    zeroed = report.zeroed,
                    "Waveform written"
                );
                self.current_output = acquisition.measure()?.processed().to_vec();
            }
            Link::Loopback { .. } => self.current_output = next.to_vec(),
        }
        Ok(())
    }

    fn initial_output(&mut self) -> Result<Vec<f64>, SessionError> {
        match &mut self.link {
            Link::Devices { acquisition, .. } => Ok(acquisition.measure()?.processed().to_vec()),
            Link::Loopback { initial_output } => {
                let mut trace = Trace::measurement("Initial", initial_output.clone());
                let processed = trace.process(&ProcessRequest {
                    resample_to: Some(self.config.awg.pulse_size),
                    clip: true,
                    normalize: true,
                    ..Default::default()
                })?;
                Ok(processed.to_vec())
            }
        }
    }

    fn background(&self) -> Option<&[f64]> {
        match &self.link {
            Link::Devices { acquisition, .. } => acquisition.background().map(Trace::raw),
            Link::Loopback { .. } => None,
        }
    }

    /// Wait `auto_loop_wait`, returning early with `Abort` if requested
    fn countdown(&self) -> Decision {
        let deadline = Instant::now() + self.config.auto_loop_wait();
        loop {
            if self.abort.is_requested() {
                return Decision::Abort;
            }
            let now = Instant::now();
            if now >= deadline {
                return Decision::Proceed;
            }
            std::thread::sleep((deadline - now).min(COUNTDOWN_TICK));
        }
    }

    fn request(&self, plan: &IterationPlan, rms: f64) -> DecisionRequest {
        DecisionRequest {
            iteration: self.iteration,
            gain: self.gain,
            rms_error: rms,
            peak_power: plan.peak_power,
            peak_power_limit: self.config.safety.peak_power_limit,
            factor: plan.factor.clone(),
            next: plan.next.clone(),
        }
    }

    fn acquire_lock(&mut self) -> Result<(), SessionError> {
        let guard = self
            .lock
            .try_acquire()
            .ok_or_else(|| SessionError::AlreadyActive(self.lock.name().to_string()))?;
        self.guard = Some(guard);
        Ok(())
    }

    /// Leave `Running`, releasing the device lock
    fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.guard = None;

        if !state.is_terminal() {
            info!(iteration = self.iteration, "Session paused");
            return;
        }
        self.history.outcome = Some(state);
        if let Some(diagnostics) = &self.diagnostics {
            if let Err(e) = diagnostics.write_history(&self.history) {
                warn!(error = %e, "Failed to save session history");
            }
        }
        info!(%state, iterations = self.iteration, "Session ended");
    }
}
