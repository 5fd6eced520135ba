/// Execution ledger: the append-only record of phase attempts.
use crate::plan::{PhaseId, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        })
    }
}

/// One execution of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRun {
    /// Identifies the invocation that produced this record
    pub run_id: Uuid,
    pub phase: PhaseId,
    /// Node names selected as targets
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_hosts: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseRun {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    runs: Vec<PhaseRun>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_runs(runs: Vec<PhaseRun>) -> Self {
        Self { runs }
    }

    pub fn runs(&self) -> &[PhaseRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub(crate) fn push(&mut self, run: PhaseRun) {
        self.runs.push(run);
    }

    /// Latest attempt of a phase, skips excluded.
    pub fn last_attempt(&self, phase: &PhaseId) -> Option<&PhaseRun> {
        self.runs
            .iter()
            .rev()
            .find(|r| &r.phase == phase && r.outcome != Outcome::Skipped)
    }

    pub fn has_succeeded(&self, phase: &PhaseId) -> bool {
        self.last_attempt(phase)
            .is_some_and(|r| r.outcome == Outcome::Succeeded)
    }

    /// First plan phase without a succeeded attempt; where a resumed run starts.
    pub fn resume_point<'p>(&self, plan: &'p Plan) -> Option<&'p PhaseId> {
        plan.phases()
            .iter()
            .map(|p| &p.id)
            .find(|id| !self.has_succeeded(id))
    }

    pub fn is_complete(&self, plan: &Plan) -> bool {
        self.resume_point(plan).is_none()
    }
}
