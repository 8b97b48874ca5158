//! Escalation state machine
//!
//! Pure data: the runner performs the I/O for a stage, reduces it to a
//! [`StepOutcome`] and asks [`transition`] where to go next.

use serde::Serialize;
use uuid::Uuid;

/// Stage names as reported in logs and traces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Drafting,
    Linting,
    SandboxTesting,
    Validating,
    Committed,
    Executing,
    BlockedNeedsApproval,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafting => "DRAFTING",
            Self::Linting => "LINTING",
            Self::SandboxTesting => "SANDBOX_TESTING",
            Self::Validating => "VALIDATING",
            Self::Committed => "COMMITTED",
            Self::Executing => "EXECUTING",
            Self::BlockedNeedsApproval => "BLOCKED_NEEDS_APPROVAL",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an escalation currently is. `attempt` counts drafts, from 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationState {
    Drafting { attempt: u32 },
    Linting { attempt: u32 },
    SandboxTesting { attempt: u32 },
    Validating { attempt: u32 },
    Committed,
    Executing,
    BlockedNeedsApproval { request_id: Uuid, attempt: u32 },
    Failed { reason: String },
}

impl EscalationState {
    pub fn start() -> Self {
        Self::Drafting { attempt: 0 }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Drafting { .. } => Stage::Drafting,
            Self::Linting { .. } => Stage::Linting,
            Self::SandboxTesting { .. } => Stage::SandboxTesting,
            Self::Validating { .. } => Stage::Validating,
            Self::Committed => Stage::Committed,
            Self::Executing => Stage::Executing,
            Self::BlockedNeedsApproval { .. } => Stage::BlockedNeedsApproval,
            Self::Failed { .. } => Stage::Failed,
        }
    }

    /// No further transitions happen from here
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executing | Self::Failed { .. })
    }
}

/// What the I/O of one stage came down to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stage succeeded
    Passed,
    /// Stage succeeded and the next stage has nothing to check
    /// (generation-wrapped drafts carry no script to lint or test)
    Skip,
    /// The draft was not good enough; another draft may fix it
    Rejected(String),
    /// Drafting needs a human first
    NeedsApproval(Uuid),
    /// The operator answered the pending approval
    Approved,
    /// Stop this attempt for good
    Abandoned(String),
}

/// Next state. Total: events that make no sense for a state fail the attempt.
pub fn transition(state: EscalationState, outcome: StepOutcome, max_drafts: u32) -> EscalationState {
    use EscalationState as S;
    use StepOutcome as O;

    match (state, outcome) {
        (state, _) if state.is_terminal() => state,
        (_, O::Abandoned(reason)) => S::Failed { reason },

        (S::Drafting { attempt }, O::Passed) => S::Linting { attempt },
        (S::Drafting { attempt }, O::Skip) => S::Validating { attempt },
        (S::Drafting { attempt }, O::NeedsApproval(request_id)) => S::BlockedNeedsApproval { request_id, attempt },
        (S::Linting { attempt }, O::Passed) => S::SandboxTesting { attempt },
        (S::SandboxTesting { attempt }, O::Passed) => S::Validating { attempt },
        (S::Validating { .. }, O::Passed) => S::Committed,
        (S::Committed, O::Passed) => S::Executing,

        (S::BlockedNeedsApproval { attempt, .. }, O::Approved) => S::Drafting { attempt },

        (
            S::Drafting { attempt }
            | S::Linting { attempt }
            | S::SandboxTesting { attempt }
            | S::Validating { attempt },
            O::Rejected(reason),
        ) => {
            if attempt + 1 < max_drafts {
                S::Drafting { attempt: attempt + 1 }
            } else {
                S::Failed { reason }
            }
        }

        (state, outcome) => S::Failed {
            reason: format!("unexpected {:?} in {}", outcome, state.stage()),
        },
    }
}
