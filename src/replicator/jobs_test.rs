use super::{FinishedJob, Job, JobHistory, JobKind, JobState};
use crate::models::{ChunkId, ChunkReplica, NodeId};

fn finished(chunk: ChunkId) -> FinishedJob {
    FinishedJob {
        job: Job::new(chunk, NodeId(1), JobKind::Remove { part_index: None }),
        state: JobState::Completed,
    }
}

#[test]
fn history_bound_is_global_across_chunks() {
    let mut history = JobHistory::default();
    let capacity = 4;
    let chunks: Vec<_> = (0..=capacity).map(|_| ChunkId::generate()).collect();

    for chunk in chunks.iter() {
        history.record(finished(*chunk), capacity);
    }
    assert_eq!(history.len(), capacity, "expected history to be bounded by its capacity");
    assert!(history.jobs_of(chunks[0]).is_empty(), "expected the oldest chunk's job to be evicted");
    for chunk in chunks.iter().skip(1) {
        assert_eq!(history.jobs_of(*chunk).len(), 1, "expected newer jobs to be retained");
    }
}

#[test]
fn history_of_size_zero_retains_nothing() {
    let mut history = JobHistory::default();
    let chunk = ChunkId::generate();
    history.record(finished(chunk), 0);
    assert!(history.is_empty(), "expected no jobs to be retained");
    assert!(history.jobs_of(chunk).is_empty());
}

#[test]
fn shrinking_history_evicts_oldest_first() {
    let mut history = JobHistory::default();
    let chunk = ChunkId::generate();
    let jobs: Vec<_> = (0..3).map(|_| finished(chunk)).collect();
    for job in jobs.iter() {
        history.record(job.clone(), 10);
    }

    history.truncate(1);
    let retained = history.jobs_of(chunk);
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].job.id, jobs[2].job.id, "expected the newest job to be retained");
}

#[test]
fn executor_depends_on_job_kind() {
    let (chunk, source, target) = (ChunkId::generate(), NodeId(1), NodeId(2));
    let cases = vec![
        (JobKind::Replicate { source, part_index: None, pull: false }, source),
        (JobKind::Replicate { source, part_index: None, pull: true }, target),
        (JobKind::Balance { source, part_index: Some(0) }, source),
        (JobKind::Remove { part_index: None }, target),
        (
            JobKind::Repair {
                sources: vec![ChunkReplica::new(source, Some(1))],
                parts: vec![0],
            },
            target,
        ),
    ];
    for (kind, expected) in cases {
        let job = Job::new(chunk, target, kind);
        assert_eq!(job.executor(), expected, "unexpected executor for {} job", job.kind_label());
    }
}
