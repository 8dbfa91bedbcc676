//! Canary rollout state machine.
//!
//! Pure over `(phase, step, timers, history, now)`: the reconciler feeds in
//! status fields plus the clock and gets back a decision, never consulting
//! workqueue recurrence. Re-entering a state for the same step is therefore
//! idempotent by construction.

use crate::api::deployment::{AnalysisResult, CanaryStep, Phase};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid phase transition from {from} to {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Validate a phase transition against the rollout transition table.
///
/// Allowed:
/// - Pending → Progressing | Failed
/// - Progressing → Analyzing | Failed | RollingBack
/// - Analyzing → Promoting | Failed | RollingBack
/// - Promoting → Progressing | Succeeded | Failed
/// - RollingBack → Failed
///
/// Everything else, including any transition out of a terminal phase, is
/// rejected.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), TransitionError> {
    use Phase::*;
    let allowed = matches!(
        (from, to),
        (Pending, Progressing)
            | (Pending, Failed)
            | (Progressing, Analyzing)
            | (Progressing, Failed)
            | (Progressing, RollingBack)
            | (Analyzing, Promoting)
            | (Analyzing, Failed)
            | (Analyzing, RollingBack)
            | (Promoting, Progressing)
            | (Promoting, Succeeded)
            | (Promoting, Failed)
            | (RollingBack, Failed)
    );
    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Why a rollout is being torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackReason {
    ProgressDeadlineExceeded { elapsed_secs: i64 },
    ConsistentAnalysisFailures { failed: usize, total: usize },
    PlatformUnhealthy,
}

impl RollbackReason {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RollbackReason::ProgressDeadlineExceeded { .. } => "ProgressDeadlineExceeded",
            RollbackReason::ConsistentAnalysisFailures { .. } => "ConsistentAnalysisFailures",
            RollbackReason::PlatformUnhealthy => "PlatformUnhealthy",
        }
    }
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackReason::ProgressDeadlineExceeded { elapsed_secs } => {
                write!(f, "progress deadline exceeded after {}s", elapsed_secs)
            }
            RollbackReason::ConsistentAnalysisFailures { failed, total } => {
                write!(f, "{} of {} recorded analysis results failed", failed, total)
            }
            RollbackReason::PlatformUnhealthy => f.write_str("platform reported workload unhealthy"),
        }
    }
}

/// Everything the machine needs to decide the next move. All values come
/// from the object's status, spec, and external reads; none from the queue.
#[derive(Clone, Debug)]
pub struct MachineInput<'a> {
    pub phase: Phase,
    pub step_index: usize,
    pub step_start: Option<DateTime<Utc>>,
    pub creation: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub step_duration: Duration,
    pub progress_deadline: Duration,
    pub history: &'a [AnalysisResult],
    pub steps: &'a [CanaryStep],
    pub platform_healthy: bool,
}

/// Where a completed step leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepCompletion {
    /// Advance to the given step index
    NextStep(usize),
    /// The final (weight 100) step passed; the rollout succeeds
    FinalStep,
}

/// The machine's verdict for one reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Pending: begin step 0
    Start,
    /// Progressing: step timer still running
    Hold { remaining: Duration },
    /// Progressing: step duration elapsed, move to analysis
    BeginAnalysis,
    /// Analyzing: observe metrics and apply the gate
    RunAnalysisGate,
    /// Promoting: finish the current step
    CompleteStep(StepCompletion),
    /// A rollback trigger fired
    Rollback(RollbackReason),
    /// RollingBack: perform cleanup and finish as Failed
    ExecuteRollback,
    /// Terminal phase; nothing to do
    Finished,
}

/// Evaluate the rollback triggers, in order: progress deadline, consistent
/// analysis failures, platform unhealth. Platform health only matters once
/// the rollout has realized anything (past Pending).
pub fn rollback_trigger(input: &MachineInput) -> Option<RollbackReason> {
    if let Some(creation) = input.creation {
        let elapsed = input.now.signed_duration_since(creation);
        if elapsed.num_seconds() > input.progress_deadline.as_secs() as i64 {
            return Some(RollbackReason::ProgressDeadlineExceeded {
                elapsed_secs: elapsed.num_seconds(),
            });
        }
    }

    if !input.history.is_empty() {
        let total = input.history.len();
        let failed = input.history.iter().filter(|r| !r.passed).count();
        // Strictly more than 75% failed
        if failed * 4 > total * 3 {
            return Some(RollbackReason::ConsistentAnalysisFailures { failed, total });
        }
    }

    if input.phase != Phase::Pending && !input.platform_healthy {
        return Some(RollbackReason::PlatformUnhealthy);
    }

    None
}

/// Decide the next move. Triggers are evaluated before any state-specific
/// logic; terminal phases and an in-flight rollback are exempt.
pub fn decide(input: &MachineInput) -> Decision {
    if !input.phase.is_terminal() && input.phase != Phase::RollingBack {
        if let Some(reason) = rollback_trigger(input) {
            return Decision::Rollback(reason);
        }
    }

    match input.phase {
        Phase::Pending => Decision::Start,
        Phase::Progressing => match input.step_start {
            Some(started) => {
                let elapsed = input.now.signed_duration_since(started);
                let duration_secs = input.step_duration.as_secs() as i64;
                if elapsed.num_seconds() >= duration_secs {
                    Decision::BeginAnalysis
                } else {
                    let remaining = (duration_secs - elapsed.num_seconds()).max(0) as u64;
                    Decision::Hold {
                        remaining: Duration::from_secs(remaining),
                    }
                }
            }
            // A Progressing status without a step start is self-healing:
            // treat the timer as elapsed so the rollout cannot wedge
            None => Decision::BeginAnalysis,
        },
        Phase::Analyzing => Decision::RunAnalysisGate,
        Phase::Promoting => Decision::CompleteStep(step_completion(input.steps, input.step_index)),
        Phase::RollingBack => Decision::ExecuteRollback,
        Phase::Succeeded | Phase::Failed => Decision::Finished,
    }
}

/// Whether the current step was the last one.
pub fn step_completion(steps: &[CanaryStep], step_index: usize) -> StepCompletion {
    let final_reached = steps
        .get(step_index)
        .map(|s| s.weight >= 100)
        .unwrap_or(true)
        || step_index + 1 >= steps.len();
    if final_reached {
        StepCompletion::FinalStep
    } else {
        StepCompletion::NextStep(step_index + 1)
    }
}

/// Outcome of the analysis gate for one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateOutcome {
    pub score: u32,
    pub passed: bool,
}

/// Apply the gate: weighted success score against the configured
/// threshold. The machine never loops back on a failed gate; the caller
/// terminates the rollout.
pub fn gate(results: &[AnalysisResult], threshold: u32) -> GateOutcome {
    let score = crate::analysis::gate_score(results);
    GateOutcome {
        score,
        passed: score >= threshold,
    }
}

/// Validate the step list of a canary strategy: non-empty, weights
/// monotone non-decreasing within 0..=100, final step exactly 100.
///
/// # Returns
/// `Err(message)` naming the first violated constraint.
pub fn validate_steps(steps: &[CanaryStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("canary strategy requires at least one step".to_string());
    }
    let mut previous = 0;
    for (i, step) in steps.iter().enumerate() {
        if !(0..=100).contains(&step.weight) {
            return Err(format!(
                "steps[{}].weight must be 0-100, got {}",
                i, step.weight
            ));
        }
        if step.weight < previous {
            return Err(format!(
                "step weights must be non-decreasing: steps[{}] ({}) < steps[{}] ({})",
                i,
                step.weight,
                i.saturating_sub(1),
                previous
            ));
        }
        previous = step.weight;
    }
    let last = steps[steps.len() - 1].weight;
    if last != 100 {
        return Err(format!("final step weight must be 100, got {}", last));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "machine_test.rs"]
mod tests;
