//! Operator decision points
//!
//! Between computing a waveform and applying it, a manual session asks an
//! [`Operator`] what to do. The answer is a [`Decision`]; the controller
//! polls for it synchronously.

use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operator answer at a decision point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Apply the proposed waveform
    Proceed,
    /// Recompute with a new gain, same iteration
    Recalc(f64),
    /// Stop for now; the session can be resumed
    Pause,
    /// End the session without applying
    Abort,
}

/// What the operator is shown at a decision point
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub iteration: u32,
    pub gain: f64,
    /// RMS error of the latest measurement
    pub rms_error: f64,
    /// Peak power of the proposed waveform
    pub peak_power: f64,
    pub peak_power_limit: f64,
    /// Clamped correction factor
    pub factor: Vec<f64>,
    /// Proposed normalized waveform
    pub next: Vec<f64>,
}

/// Source of decisions for a manual session
pub trait Operator: Send {
    fn decide(&mut self, request: &DecisionRequest) -> Decision;
}

/// Replays a fixed list of decisions, then aborts
#[derive(Debug, Clone, Default)]
pub struct ScriptedOperator {
    script: VecDeque<Decision>,
    seen: Vec<DecisionRequest>,
}

impl ScriptedOperator {
    pub fn new(script: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            script: script.into_iter().collect(),
            seen: Vec::new(),
        }
    }

    /// Requests received so far
    pub fn seen(&self) -> &[DecisionRequest] {
        &self.seen
    }
}

impl Operator for ScriptedOperator {
    fn decide(&mut self, request: &DecisionRequest) -> Decision {
        self.seen.push(request.clone());
        self.script.pop_front().unwrap_or(Decision::Abort)
    }
}

/// Operator that accepts every proposal
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysProceed;

impl Operator for AlwaysProceed {
    fn decide(&mut self, _request: &DecisionRequest) -> Decision {
        Decision::Proceed
    }
}

/// Operator on another thread, connected through channels
///
/// Each request is sent out and the reply awaited. A closed channel counts
/// as an abort.
pub struct ChannelOperator {
    requests: Sender<DecisionRequest>,
    decisions: Receiver<Decision>,
}

/// The far end of a [`ChannelOperator`]
pub struct OperatorLink {
    pub requests: Receiver<DecisionRequest>,
    pub decisions: Sender<Decision>,
}

impl ChannelOperator {
    pub fn new() -> (Self, OperatorLink) {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (dec_tx, dec_rx) = crossbeam_channel::unbounded();
        (
            Self {
                requests: req_tx,
                decisions: dec_rx,
            },
            OperatorLink {
                requests: req_rx,
                decisions: dec_tx,
            },
        )
    }
}

impl Operator for ChannelOperator {
    fn decide(&mut self, request: &DecisionRequest) -> Decision {
        if self.requests.send(request.clone()).is_err() {
            tracing::warn!("Operator gone, aborting");
            return Decision::Abort;
        }
        match self.decisions.recv() {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!("Operator gone, aborting");
                Decision::Abort
            }
        }
    }
}

/// Cooperative abort flag
///
/// Clones share the flag. The controller checks it only at loop-safe
/// points, never in the middle of a write.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    requested: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop at the next safe point
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Reset before resuming
    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(iteration: u32) -> DecisionRequest {
        DecisionRequest {
            iteration,
            gain: 0.5,
            rms_error: 0.1,
            peak_power: 1.2,
            peak_power_limit: 4.0,
            factor: vec![1.0],
            next: vec![1.0],
        }
    }

    #[test]
    fn test_scripted_operator_replays_then_aborts() {
        let mut op = ScriptedOperator::new([Decision::Recalc(0.2), Decision::Proceed]);
        assert_eq!(op.decide(&request(0)), Decision::Recalc(0.2));
        assert_eq!(op.decide(&request(0)), Decision::Proceed);
        assert_eq!(op.decide(&request(1)), Decision::Abort);
        assert_eq!(op.seen().len(), 3);
        assert_eq!(op.seen()[2].iteration, 1);
    }

    #[test]
    fn test_channel_operator_round_trip() {
        let (mut op, link) = ChannelOperator::new();
        let remote = std::thread::spawn(move || {
            let req = link.requests.recv().unwrap();
            link.decisions.send(Decision::Recalc(req.gain / 2.0)).unwrap();
        });
        assert_eq!(op.decide(&request(3)), Decision::Recalc(0.25));
        remote.join().unwrap();
    }

    #[test]
    fn test_channel_operator_closed_is_abort() {
        let (mut op, link) = ChannelOperator::new();
        drop(link);
        assert_eq!(op.decide(&request(0)), Decision::Abort);
    }

    #[test]
    fn test_abort_handle_shared() {
        let handle = AbortHandle::new();
        let other = handle.clone();
        assert!(!handle.is_requested());
        other.request();
        assert!(handle.is_requested());
        handle.clear();
        assert!(!other.is_requested());
    }
}
