//! Single-admission job slot.
//!
//! At most one job occupies the slot. Admission mints the job's cancel
//! signal, so the signal is lowered for every newly admitted job. Status is
//! published through a watch channel; the first terminal transition wins
//! and later ones are ignored.

use log::{debug, info};
use shared::{CancelReason, JobStatus, JobSummary, Segment};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::cancel::CancelSignal;

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed(Vec<Segment>),
    Cancelled {
        reason: CancelReason,
        partial: Vec<Segment>,
    },
    Failed(String),
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running,
            JobState::Completed(_) => JobStatus::Completed,
            JobState::Cancelled { .. } => JobStatus::Cancelled,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

struct JobInner {
    id: Uuid,
    source: PathBuf,
    created_at: SystemTime,
    cancel: CancelSignal,
    produced: AtomicUsize,
    segments: Mutex<Vec<Segment>>,
    state: watch::Sender<JobState>,
}

/// Shared reference to one job. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl JobHandle {
    fn new(source: PathBuf) -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                source,
                created_at: SystemTime::now(),
                cancel: CancelSignal::new(),
                produced: AtomicUsize::new(0),
                segments: Mutex::new(Vec::new()),
                state,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn source(&self) -> &Path {
        &self.inner.source
    }

    pub fn cancel(&self) -> &CancelSignal {
        &self.inner.cancel
    }

    pub fn status(&self) -> JobStatus {
        self.inner.state.borrow().status()
    }

    pub fn segments_produced(&self) -> usize {
        self.inner.produced.load(Ordering::SeqCst)
    }

    pub fn same_job(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pending -> Running. Returns false from any other state.
    pub fn mark_running(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, JobState::Pending) {
                *state = JobState::Running;
                true
            } else {
                false
            }
        })
    }

    pub async fn push_segment(&self, segment: Segment) {
        self.inner.segments.lock().await.push(segment);
        self.inner.produced.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn take_segments(&self) -> Vec<Segment> {
        std::mem::take(&mut *self.inner.segments.lock().await)
    }

    pub async fn snapshot_segments(&self) -> Vec<Segment> {
        self.inner.segments.lock().await.clone()
    }

    /// Moves the job into a terminal state unless it already reached one.
    /// Returns whether this call made the transition.
    pub fn finish(&self, terminal: JobState) -> bool {
        debug_assert!(terminal.is_terminal());
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        })
    }

    /// Waits for the terminal state.
    pub async fn terminal(&self) -> JobState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`.
            Err(_) => JobState::Failed("job state channel closed".to_string()),
        };
        state
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.inner.id,
            source: self.inner.source.clone(),
            status: self.status(),
            segments: self.segments_produced(),
            created_at: self.inner.created_at,
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(JobHandle),
    /// The slot is occupied by this job.
    Busy(JobHandle),
}

#[derive(Default)]
pub struct JobSlot {
    current: Mutex<Option<JobHandle>>,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The only admission point. Rejects while the slot is occupied.
    pub async fn try_submit(&self, source: PathBuf) -> Admission {
        let mut current = self.current.lock().await;
        if let Some(occupant) = current.as_ref() {
            return Admission::Busy(occupant.clone());
        }

        let handle = JobHandle::new(source);
        info!("Admitted job {} for {:?}", handle.id(), handle.source());
        *current = Some(handle.clone());
        Admission::Admitted(handle)
    }

    pub async fn current(&self) -> Option<JobHandle> {
        self.current.lock().await.clone()
    }

    /// Empties the slot if `handle` still occupies it. Returns whether this
    /// call cleared it; repeated or stale calls are no-ops.
    pub async fn clear(&self, handle: &JobHandle) -> bool {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(occupant) if occupant.same_job(handle) => {
                *current = None;
                debug!("Cleared job {} from slot", handle.id());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn admit(slot: &JobSlot, name: &str) -> JobHandle {
        match slot.try_submit(PathBuf::from(name)).await {
            Admission::Admitted(handle) => handle,
            Admission::Busy(occupant) => panic!("slot busy with {}", occupant.id()),
        }
    }

    #[tokio::test]
    async fn second_submit_is_busy_and_leaves_occupant_untouched() {
        let slot = JobSlot::new();
        let first = admit(&slot, "a.wav").await;

        match slot.try_submit(PathBuf::from("b.wav")).await {
            Admission::Busy(occupant) => assert!(occupant.same_job(&first)),
            Admission::Admitted(_) => panic!("second job admitted"),
        }

        assert!(!first.cancel().observe());
        assert!(slot.current().await.unwrap().same_job(&first));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let slot = JobSlot::new();
        let job = admit(&slot, "a.wav").await;

        assert!(slot.clear(&job).await);
        assert!(!slot.clear(&job).await);
        assert!(slot.current().await.is_none());
    }

    #[tokio::test]
    async fn stale_clear_does_not_evict_newer_job() {
        let slot = JobSlot::new();
        let old = admit(&slot, "a.wav").await;
        slot.clear(&old).await;
        let new = admit(&slot, "b.wav").await;

        assert!(!slot.clear(&old).await);
        assert!(slot.current().await.unwrap().same_job(&new));
    }

    #[tokio::test]
    async fn new_job_gets_a_lowered_signal_after_previous_was_raised() {
        let slot = JobSlot::new();
        let old = admit(&slot, "a.wav").await;
        old.cancel().raise();
        slot.clear(&old).await;

        let new = admit(&slot, "b.wav").await;
        assert!(new.mark_running());
        assert_eq!(new.status(), JobStatus::Running);
        assert!(!new.cancel().observe());
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let slot = JobSlot::new();
        let job = admit(&slot, "a.wav").await;
        job.mark_running();

        assert!(job.finish(JobState::Cancelled {
            reason: CancelReason::StopGraceElapsed,
            partial: Vec::new(),
        }));
        assert!(!job.finish(JobState::Completed(vec![Segment::new(0.0, 1.0, "late")])));
        assert!(!job.mark_running());

        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(matches!(
            job.terminal().await,
            JobState::Cancelled {
                reason: CancelReason::StopGraceElapsed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn summary_tracks_produced_segments() {
        let slot = JobSlot::new();
        let job = admit(&slot, "a.wav").await;
        job.push_segment(Segment::new(0.0, 1.0, "one")).await;
        job.push_segment(Segment::new(1.0, 2.0, "two")).await;

        let summary = job.summary();
        assert_eq!(summary.id, job.id());
        assert_eq!(summary.segments, 2);
        assert_eq!(summary.status, JobStatus::Pending);
        assert_eq!(job.snapshot_segments().await.len(), 2);
        assert_eq!(job.take_segments().await.len(), 2);
        assert!(job.snapshot_segments().await.is_empty());
    }
}
