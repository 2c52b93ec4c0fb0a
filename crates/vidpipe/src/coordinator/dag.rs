//! Stage dependency graph.
//!
//! Pure functions over a record snapshot: which stages may be enqueued, which
//! can never run, what the record's status and sub-status should be, and
//! whether the run is complete.

use crate::record::{JobState, ProcessRecord, ProcessingDetails, RecordStatus};
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prereq {
    /// The stage must have completed successfully.
    Completed(Stage),
    /// The stage must have completed or been skipped.
    Resolved(Stage),
}

impl Prereq {
    pub fn stage(self) -> Stage {
        match self {
            Prereq::Completed(s) | Prereq::Resolved(s) => s,
        }
    }
}

/// Prerequisites of each stage. Stages with none start on upload acceptance.
pub fn prerequisites(stage: Stage) -> &'static [Prereq] {
    use Prereq::*;
    match stage {
        Stage::Compression | Stage::AudioExtraction => &[],
        // The AI fork waits for both media stages, so a failed compression
        // never leaves analysis jobs behind.
        Stage::Transcription => &[
            Completed(Stage::Compression),
            Completed(Stage::AudioExtraction),
        ],
        Stage::Tags | Stage::Todo | Stage::Title => &[Completed(Stage::Transcription)],
        Stage::Embedding => &[Completed(Stage::Tags), Completed(Stage::Title)],
        Stage::ArchivalUpload => &[Completed(Stage::Compression), Resolved(Stage::Embedding)],
        Stage::Cleanup => &[Completed(Stage::ArchivalUpload)],
    }
}

/// Stages other than compression that read `files.original` while running.
/// The compression result stays pending until all of them are resolved.
pub const ORIGINAL_READERS: &[Stage] = &[Stage::AudioExtraction];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    /// A `Completed` prerequisite was skipped; the stage can never run.
    Blocked { on: Stage },
}

pub fn readiness(record: &ProcessRecord, stage: Stage) -> Readiness {
    if record.processing_started_at.is_none() {
        return Readiness::Waiting;
    }

    let mut waiting = false;
    for prereq in prerequisites(stage) {
        let state = record.stage_state(prereq.stage());
        match (prereq, state) {
            (Prereq::Completed(_), Some(JobState::Completed)) => {}
            (Prereq::Completed(on), Some(JobState::Skipped)) => {
                return Readiness::Blocked { on: *on };
            }
            (Prereq::Resolved(_), Some(s)) if s.is_resolved() => {}
            _ => waiting = true,
        }
    }

    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagAction {
    Enqueue(Stage),
    /// Optional stage that can never run.
    Skip { stage: Stage, blocked_on: Stage },
    /// Essential stage that can never run.
    FailRun { stage: Stage, blocked_on: Stage },
}

/// Actions for every stage that has no job entry yet. Stages with an entry
/// are never re-enqueued from here; retries go through the failure path.
pub fn evaluate(record: &ProcessRecord, is_essential: impl Fn(Stage) -> bool) -> Vec<DagAction> {
    if record.is_cancelled() || record.is_terminal() {
        return Vec::new();
    }

    Stage::ALL
        .into_iter()
        .filter(|stage| record.job(*stage).is_none())
        .filter_map(|stage| match readiness(record, stage) {
            Readiness::Ready => Some(DagAction::Enqueue(stage)),
            Readiness::Waiting => None,
            Readiness::Blocked { on } if is_essential(stage) => Some(DagAction::FailRun {
                stage,
                blocked_on: on,
            }),
            Readiness::Blocked { on } => Some(DagAction::Skip {
                stage,
                blocked_on: on,
            }),
        })
        .collect()
}

/// True when the parked compression result may move into `files.processed`.
pub fn can_promote_pending(record: &ProcessRecord) -> bool {
    record.pending_result.is_some()
        && record.stage_state(Stage::Compression) == Some(JobState::PendingMerge)
        && ORIGINAL_READERS
            .iter()
            .all(|stage| record.is_stage_resolved(*stage))
}

/// Every stage resolved and nothing left pending.
pub fn is_complete(record: &ProcessRecord) -> bool {
    record.pending_result.is_none() && Stage::ALL.iter().all(|s| record.is_stage_resolved(*s))
}

/// Status implied by the furthest stage that has been enqueued.
pub fn target_status(record: &ProcessRecord) -> RecordStatus {
    let reached = |stages: &[Stage]| stages.iter().any(|s| record.job(*s).is_some());

    if reached(&[Stage::ArchivalUpload, Stage::Cleanup]) {
        RecordStatus::Finalizing
    } else if reached(&[Stage::Tags, Stage::Todo, Stage::Title, Stage::Embedding]) {
        RecordStatus::Analyzing
    } else if reached(&[Stage::Transcription]) {
        RecordStatus::Transcribing
    } else {
        RecordStatus::ProcessingMedia
    }
}

/// Sub-status for the most downstream active stage.
pub fn active_details(record: &ProcessRecord) -> Option<ProcessingDetails> {
    record
        .active_stages()
        .max()
        .map(ProcessingDetails::for_stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileRef, JobId, JobRef, PendingResult};
    use chrono::Utc;

    fn accepted_record() -> ProcessRecord {
        let mut record = ProcessRecord::new("t", "o");
        record.files.original = Some(FileRef::local("/in.mov", 1, "mov"));
        record.processing_started_at = Some(Utc::now());
        record.status = RecordStatus::Uploaded;
        record
    }

    fn set(record: &mut ProcessRecord, stage: Stage, state: JobState) {
        record
            .jobs
            .insert(stage, JobRef::queued(JobId::new(), 1).with_state(state));
    }

    fn default_essential(stage: Stage) -> bool {
        !matches!(stage, Stage::Todo | Stage::Embedding | Stage::Cleanup)
    }

    fn enqueued(actions: &[DagAction]) -> Vec<Stage> {
        actions
            .iter()
            .filter_map(|a| match a {
                DagAction::Enqueue(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_prerequisites_point_upstream() {
        for stage in Stage::ALL {
            for prereq in prerequisites(stage) {
                assert!(prereq.stage() < stage, "{} depends on {}", stage, prereq.stage());
            }
        }
    }

    #[test]
    fn test_nothing_before_upload_accepted() {
        let mut record = accepted_record();
        record.processing_started_at = None;
        assert!(evaluate(&record, default_essential).is_empty());
    }

    #[test]
    fn test_fork_on_upload() {
        let record = accepted_record();
        assert_eq!(
            enqueued(&evaluate(&record, default_essential)),
            vec![Stage::Compression, Stage::AudioExtraction]
        );
    }

    #[test]
    fn test_ai_fork_after_transcription() {
        let mut record = accepted_record();
        set(&mut record, Stage::Compression, JobState::Completed);
        set(&mut record, Stage::AudioExtraction, JobState::Completed);
        set(&mut record, Stage::Transcription, JobState::Completed);
        assert_eq!(
            enqueued(&evaluate(&record, default_essential)),
            vec![Stage::Tags, Stage::Todo, Stage::Title]
        );
    }

    #[test]
    fn test_transcription_joins_both_media_stages() {
        let mut record = accepted_record();
        set(&mut record, Stage::Compression, JobState::Running);
        set(&mut record, Stage::AudioExtraction, JobState::Completed);
        assert!(enqueued(&evaluate(&record, default_essential)).is_empty());

        // Parked compression output is not enough either.
        set(&mut record, Stage::Compression, JobState::PendingMerge);
        assert!(enqueued(&evaluate(&record, default_essential)).is_empty());

        set(&mut record, Stage::Compression, JobState::Completed);
        assert_eq!(
            enqueued(&evaluate(&record, default_essential)),
            vec![Stage::Transcription]
        );
    }

    #[test]
    fn test_skipped_compression_fails_transcription() {
        let mut record = accepted_record();
        set(&mut record, Stage::Compression, JobState::Skipped);
        set(&mut record, Stage::AudioExtraction, JobState::Completed);
        let actions = evaluate(&record, default_essential);
        assert_eq!(
            actions[0],
            DagAction::FailRun {
                stage: Stage::Transcription,
                blocked_on: Stage::Compression
            }
        );
        assert!(enqueued(&actions).is_empty());
    }

    #[test]
    fn test_embedding_join_needs_tags_and_title() {
        let mut record = accepted_record();
        for stage in [Stage::Compression, Stage::AudioExtraction, Stage::Transcription] {
            set(&mut record, stage, JobState::Completed);
        }
        set(&mut record, Stage::Tags, JobState::Completed);
        set(&mut record, Stage::Todo, JobState::Running);
        set(&mut record, Stage::Title, JobState::Running);
        assert!(enqueued(&evaluate(&record, default_essential)).is_empty());

        set(&mut record, Stage::Title, JobState::Completed);
        assert_eq!(
            enqueued(&evaluate(&record, default_essential)),
            vec![Stage::Embedding]
        );
    }

    #[test]
    fn test_archival_waits_for_promoted_compression() {
        let mut record = accepted_record();
        for stage in [
            Stage::AudioExtraction,
            Stage::Transcription,
            Stage::Tags,
            Stage::Todo,
            Stage::Title,
        ] {
            set(&mut record, stage, JobState::Completed);
        }
        set(&mut record, Stage::Embedding, JobState::Skipped);
        set(&mut record, Stage::Compression, JobState::PendingMerge);
        assert!(enqueued(&evaluate(&record, default_essential)).is_empty());

        set(&mut record, Stage::Compression, JobState::Completed);
        assert_eq!(
            enqueued(&evaluate(&record, default_essential)),
            vec![Stage::ArchivalUpload]
        );
    }

    #[test]
    fn test_skipped_prereq_blocks_dependents() {
        let mut record = accepted_record();
        for stage in [Stage::Compression, Stage::AudioExtraction, Stage::Transcription] {
            set(&mut record, stage, JobState::Completed);
        }
        set(&mut record, Stage::Tags, JobState::Skipped);
        set(&mut record, Stage::Todo, JobState::Completed);
        set(&mut record, Stage::Title, JobState::Completed);

        let actions = evaluate(&record, default_essential);
        assert_eq!(
            actions,
            vec![DagAction::Skip {
                stage: Stage::Embedding,
                blocked_on: Stage::Tags
            }]
        );

        let actions = evaluate(&record, |_| true);
        assert_eq!(
            actions,
            vec![DagAction::FailRun {
                stage: Stage::Embedding,
                blocked_on: Stage::Tags
            }]
        );
    }

    #[test]
    fn test_existing_entries_are_never_reenqueued() {
        let mut record = accepted_record();
        set(&mut record, Stage::Compression, JobState::Failed);
        set(&mut record, Stage::AudioExtraction, JobState::Queued);
        assert!(evaluate(&record, default_essential).is_empty());
    }

    #[test]
    fn test_cancelled_record_has_no_actions() {
        let mut record = accepted_record();
        record.cancelled = true;
        assert!(evaluate(&record, default_essential).is_empty());
    }

    #[test]
    fn test_promotion_waits_for_original_readers() {
        let mut record = accepted_record();
        record.pending_result = Some(PendingResult::Compression(FileRef::local(
            "/w/c.mp4", 1, "mp4",
        )));
        set(&mut record, Stage::Compression, JobState::PendingMerge);
        set(&mut record, Stage::AudioExtraction, JobState::Running);
        assert!(!can_promote_pending(&record));

        set(&mut record, Stage::AudioExtraction, JobState::Completed);
        assert!(can_promote_pending(&record));
    }

    #[test]
    fn test_complete_requires_no_pending() {
        let mut record = accepted_record();
        for stage in Stage::ALL {
            set(&mut record, stage, JobState::Completed);
        }
        assert!(is_complete(&record));

        record.pending_result = Some(PendingResult::Compression(FileRef::local(
            "/w/c.mp4", 1, "mp4",
        )));
        assert!(!is_complete(&record));
    }

    #[test]
    fn test_target_status_and_details() {
        let mut record = accepted_record();
        set(&mut record, Stage::Compression, JobState::Running);
        set(&mut record, Stage::AudioExtraction, JobState::Queued);
        assert_eq!(target_status(&record), RecordStatus::ProcessingMedia);
        assert_eq!(
            active_details(&record),
            Some(ProcessingDetails::ExtractingAudio)
        );

        set(&mut record, Stage::AudioExtraction, JobState::Completed);
        set(&mut record, Stage::Transcription, JobState::Queued);
        assert_eq!(target_status(&record), RecordStatus::Transcribing);
        assert_eq!(
            active_details(&record),
            Some(ProcessingDetails::TranscribingAudio)
        );

        set(&mut record, Stage::Title, JobState::Queued);
        assert_eq!(target_status(&record), RecordStatus::Analyzing);

        set(&mut record, Stage::ArchivalUpload, JobState::Queued);
        assert_eq!(target_status(&record), RecordStatus::Finalizing);
    }
}
