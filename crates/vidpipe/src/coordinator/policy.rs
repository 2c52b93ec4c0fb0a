//! Per-stage failure policy, built from configuration.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::config::{OrchestratorConfig, StageSettings};
use crate::stage::Stage;
use crate::worker::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Re-enqueue as attempt `next_attempt` after `delay`.
    Retry { next_attempt: u32, delay: Duration },
    /// Essential stage out of options: the run fails.
    FailRun,
    /// Optional stage out of options: continue without it.
    Skip,
}

#[derive(Debug, Clone)]
pub struct StagePolicy {
    settings: BTreeMap<Stage, StageSettings>,
}

impl StagePolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            settings: Stage::ALL.into_iter().map(|s| (s, config.stage(s))).collect(),
        }
    }

    pub fn settings(&self, stage: Stage) -> StageSettings {
        self.settings
            .get(&stage)
            .copied()
            .unwrap_or_else(|| StageSettings::default_for(stage))
    }

    pub fn is_essential(&self, stage: Stage) -> bool {
        self.settings(stage).essential
    }

    pub fn timeouts(&self) -> HashMap<Stage, Duration> {
        Stage::ALL
            .into_iter()
            .map(|s| (s, self.settings(s).timeout()))
            .collect()
    }

    /// Classifies a failed `attempt` of `stage`.
    pub fn decide(&self, stage: Stage, kind: FailureKind, attempt: u32) -> FailureDecision {
        let settings = self.settings(stage);
        if kind == FailureKind::Retryable && attempt < settings.max_attempts {
            return FailureDecision::Retry {
                next_attempt: attempt + 1,
                delay: settings.backoff(attempt),
            };
        }
        if settings.essential {
            FailureDecision::FailRun
        } else {
            FailureDecision::Skip
        }
    }
}
