//! Ordering properties checked over every completion order of the stage graph.

mod common;

use std::sync::Arc;
use std::thread;

use common::TestHarness;
use vidpipe::record::{JobState, RecordId};
use vidpipe::worker::{StageFailure, StageJob};
use vidpipe::{RecordStatus, Stage};

/// How a job chosen during exploration is reported.
#[derive(Clone, Copy)]
enum Plan {
    AllSucceed,
    /// The given stage fails fatally on its first attempt.
    Fatal(Stage),
}

fn report(h: &TestHarness, job: &StageJob, plan: Plan) {
    match plan {
        Plan::Fatal(stage) if stage == job.stage => {
            h.fail(job, StageFailure::fatal("scripted fatal failure"))
        }
        _ => h.succeed(job),
    }
}

/// Replays `order` on a fresh harness, returning the harness, the record and
/// the progress observed after each step.
fn replay(order: &[Stage], plan: Plan) -> (TestHarness, RecordId, Vec<u8>) {
    let h = TestHarness::new();
    let id = h.submit();
    let mut progress = vec![h.record(id).progress.percentage];
    for stage in order {
        let job = h.expect_job(id, *stage);
        report(&h, &job, plan);
        h.check_invariants(id);
        progress.push(h.record(id).progress.percentage);
    }
    (h, id, progress)
}

/// Depth-first enumeration of every order in which waiting jobs can finish.
/// Calls `leaf` once per complete order.
fn explore(prefix: &mut Vec<Stage>, plan: Plan, leaf: &mut dyn FnMut(&TestHarness, RecordId, &[u8])) {
    let (h, id, progress) = replay(prefix, plan);
    let waiting = h.waiting(id);
    if waiting.is_empty() {
        leaf(&h, id, &progress);
        return;
    }
    for stage in waiting {
        prefix.push(stage);
        explore(prefix, plan, leaf);
        prefix.pop();
    }
}

#[test]
fn test_every_success_order_completes_with_monotonic_progress() {
    let mut leaves = 0;
    explore(&mut Vec::new(), Plan::AllSucceed, &mut |h, id, progress| {
        leaves += 1;
        assert!(
            progress.windows(2).all(|w| w[0] <= w[1]),
            "progress regressed: {:?}",
            progress
        );

        let record = h.record(id);
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.progress.percentage, 100);
        assert!(record.pending_result.is_none());
        for stage in Stage::ALL {
            assert_eq!(h.enqueue_count(id, stage), 1, "{} enqueued more than once", stage);
            assert_eq!(record.stage_state(stage), Some(JobState::Completed));
        }
    });
    // Two media orders, times todo placed anywhere around the
    // tags/title -> embedding -> archival -> cleanup chain.
    assert_eq!(leaves, 24);
}

#[test]
fn test_every_order_with_fatal_title_fails_without_embedding() {
    explore(&mut Vec::new(), Plan::Fatal(Stage::Title), &mut |h, id, progress| {
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let record = h.record(id);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(h.enqueue_count(id, Stage::Embedding), 0);
        assert_eq!(h.enqueue_count(id, Stage::ArchivalUpload), 0);
        assert!(record.files.original.as_ref().is_some_and(|f| {
            f.storage_type != vidpipe::record::StorageType::Deleted
        }));
    });
}

#[test]
fn test_every_order_with_fatal_compression_skips_ai_analysis() {
    explore(
        &mut Vec::new(),
        Plan::Fatal(Stage::Compression),
        &mut |h, id, _| {
            let record = h.record(id);
            assert_eq!(record.status, RecordStatus::Failed);
            for stage in [Stage::Tags, Stage::Todo, Stage::Title, Stage::Embedding] {
                assert_eq!(h.enqueue_count(id, stage), 0);
            }
        },
    );
}

#[test]
fn test_every_order_with_failed_todo_completes() {
    explore(&mut Vec::new(), Plan::Fatal(Stage::Todo), &mut |h, id, progress| {
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        let record = h.record(id);
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.stage_state(Stage::Todo), Some(JobState::Skipped));
        assert!(record.todo_list.is_none());
    });
}

#[test]
fn test_inner_progress_never_regresses() {
    let h = TestHarness::new();
    let id = h.submit();
    let compression = h.expect_job(id, Stage::Compression);
    let audio = h.expect_job(id, Stage::AudioExtraction);

    let mut last = 0;
    for (job, fraction) in [
        (&compression, 0.2),
        (&audio, 0.9),
        (&compression, 0.1),
        (&compression, 0.6),
        (&audio, 0.3),
    ] {
        h.coordinator
            .on_stage_progress(id, job.stage, job.job_id, fraction)
            .unwrap();
        let now = h.record(id).progress.percentage;
        assert!(now >= last, "{} < {}", now, last);
        last = now;
    }

    h.succeed(&audio);
    assert!(h.record(id).progress.percentage >= last);
}

#[test]
fn test_concurrent_ai_reports_enqueue_embedding_once() {
    for _ in 0..25 {
        let h = Arc::new(TestHarness::new());
        let id = h.submit();
        h.succeed(&h.expect_job(id, Stage::Compression));
        h.succeed(&h.expect_job(id, Stage::AudioExtraction));
        h.succeed(&h.expect_job(id, Stage::Transcription));

        let jobs: Vec<StageJob> = [Stage::Tags, Stage::Todo, Stage::Title]
            .into_iter()
            .map(|s| h.expect_job(id, s))
            .collect();

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let h = Arc::clone(&h);
                thread::spawn(move || h.succeed(&job))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(h.enqueue_count(id, Stage::Embedding), 1);
        let record = h.record(id);
        assert!(record.tags.is_some() && record.title.is_some() && record.todo_list.is_some());
        assert_eq!(record.status, RecordStatus::Analyzing);
        h.check_invariants(id);
    }
}

#[test]
fn test_concurrent_duplicate_completions_merge_once() {
    let h = Arc::new(TestHarness::new());
    let id = h.submit();
    h.succeed(&h.expect_job(id, Stage::Compression));
    let audio = h.expect_job(id, Stage::AudioExtraction);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let h = Arc::clone(&h);
            let job = audio.clone();
            thread::spawn(move || h.succeed(&job))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(h.enqueue_count(id, Stage::Transcription), 1);
    let discarded = h
        .events()
        .iter()
        .filter(|e| matches!(e, vidpipe::PipelineEvent::ResultDiscarded { .. }))
        .count();
    assert_eq!(discarded, 3);
}
