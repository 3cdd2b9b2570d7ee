//! Job controller: admits transcription jobs into the slot, runs them on a
//! spawned task and stops them on request.
//!
//! A job moves `Pending -> Running -> {Completed | Cancelled | Failed}`. The
//! runner checks the job's cancel signal at every segment boundary, racing
//! the next segment against the signal with cancellation polled first.

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use shared::{CancelReason, DaemonStatus, Segment};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::decoder::TranscriptionDecoder;
use crate::slot::{Admission, JobHandle, JobSlot, JobState};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a transcription job is already running ({0})")]
    Busy(Uuid),

    #[error("{0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cancellation {
    pub reason: CancelReason,
    /// Segments produced strictly before the checkpoint that observed the stop.
    pub partial: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Vec<Segment>),
    Cancelled(Cancellation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    /// No job was running.
    Idle,
    Cancelled(Uuid),
    /// The job reached another terminal state before it saw the stop.
    AlreadyFinished(Uuid),
    /// The job ignored the stop for the whole grace period and was removed
    /// from the slot; its decoder may still be running.
    Detached(Uuid),
}

pub struct JobController {
    transcriber: Arc<dyn TranscriptionDecoder>,
    slot: Arc<JobSlot>,
    stop_grace: Duration,
    start_time: Instant,
}

impl JobController {
    pub fn new(transcriber: Arc<dyn TranscriptionDecoder>, stop_grace: Duration) -> Self {
        Self {
            transcriber,
            slot: Arc::new(JobSlot::new()),
            stop_grace,
            start_time: Instant::now(),
        }
    }

    /// Runs `source` to a terminal state.
    pub async fn submit(&self, source: PathBuf) -> Result<JobOutcome, JobError> {
        let handle = self.admit(source).await?;
        self.await_result(&handle).await
    }

    /// Admits `source` and starts decoding it in the background.
    pub async fn admit(&self, source: PathBuf) -> Result<JobHandle, JobError> {
        let handle = match self.slot.try_submit(source).await {
            Admission::Admitted(handle) => handle,
            Admission::Busy(occupant) => {
                warn!("Rejected job: job {} is still running", occupant.id());
                return Err(JobError::Busy(occupant.id()));
            }
        };

        let transcriber = Arc::clone(&self.transcriber);
        let slot = Arc::clone(&self.slot);
        let job = handle.clone();
        tokio::spawn(async move {
            let state = run(transcriber.as_ref(), &job).await;
            slot.clear(&job).await;
            let status = state.status();
            if job.finish(state) {
                info!("Job {} finished: {:?}", job.id(), status);
            } else {
                debug!("Job {} finished after it was detached", job.id());
            }
        });

        Ok(handle)
    }

    pub async fn await_result(&self, handle: &JobHandle) -> Result<JobOutcome, JobError> {
        match handle.terminal().await {
            JobState::Completed(segments) => Ok(JobOutcome::Completed(segments)),
            JobState::Cancelled { reason, partial } => {
                Ok(JobOutcome::Cancelled(Cancellation { reason, partial }))
            }
            JobState::Failed(cause) => Err(JobError::Decode(cause)),
            other => Err(JobError::Decode(format!(
                "job ended in non-terminal state {:?}",
                other.status()
            ))),
        }
    }

    /// Asks the current job to stop and waits up to the grace period for it.
    pub async fn stop(&self) -> StopReport {
        let Some(handle) = self.slot.current().await else {
            debug!("Stop requested with no job running");
            return StopReport::Idle;
        };
        let id = handle.id();
        info!("Stop requested for job {}", id);
        handle.cancel().raise();

        let state = match tokio::time::timeout(self.stop_grace, handle.terminal()).await {
            Ok(state) => state,
            Err(_) => {
                let partial = handle.snapshot_segments().await;
                // The slot is empty before any waiter wakes.
                self.slot.clear(&handle).await;
                let detached = handle.finish(JobState::Cancelled {
                    reason: CancelReason::StopGraceElapsed,
                    partial,
                });
                if detached {
                    warn!(
                        "Job {} did not stop within {:?}; detached it, its decoder may keep running",
                        id, self.stop_grace
                    );
                    return StopReport::Detached(id);
                }
                handle.terminal().await
            }
        };

        match state {
            JobState::Cancelled { .. } => StopReport::Cancelled(id),
            _ => StopReport::AlreadyFinished(id),
        }
    }

    pub async fn status(&self, chat_backend: &str) -> DaemonStatus {
        DaemonStatus {
            transcription_backend: self.transcriber.name().to_string(),
            chat_backend: chat_backend.to_string(),
            model_loaded: self.transcriber.is_loaded(),
            current_job: self.slot.current().await.map(|handle| handle.summary()),
            uptime: self.start_time.elapsed(),
        }
    }

    /// Lets the backend drop idle resources while no job is running.
    pub async fn release_idle(&self) {
        if self.slot.current().await.is_none() {
            self.transcriber.release_idle().await;
        }
    }
}

async fn run(transcriber: &dyn TranscriptionDecoder, job: &JobHandle) -> JobState {
    job.mark_running();
    let cancel = job.cancel().clone();
    debug!("Job {} running on {}", job.id(), transcriber.name());

    let decoded = tokio::select! {
        biased;
        _ = cancel.raised() => return cancelled(job).await,
        decoded = transcriber.decode(job.source(), cancel.clone()) => decoded,
    };
    let mut segments = match decoded {
        Ok(segments) => segments,
        Err(e) => {
            error!("Job {} failed to start decoding: {}", job.id(), e);
            return JobState::Failed(e.to_string());
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.raised() => return cancelled(job).await,
            item = segments.next() => match item {
                Some(Ok(segment)) => {
                    // A segment that arrives after the stop is not kept.
                    if cancel.observe() {
                        return cancelled(job).await;
                    }
                    job.push_segment(segment).await;
                    tokio::task::yield_now().await;
                }
                Some(Err(e)) => {
                    error!(
                        "Job {} failed after {} segments: {}",
                        job.id(),
                        job.segments_produced(),
                        e
                    );
                    return JobState::Failed(e.to_string());
                }
                None => return JobState::Completed(job.take_segments().await),
            },
        }
    }
}

async fn cancelled(job: &JobHandle) -> JobState {
    info!(
        "Job {} cancelled after {} segments",
        job.id(),
        job.segments_produced()
    );
    JobState::Cancelled {
        reason: CancelReason::StopRequested,
        partial: job.take_segments().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::decoder::testing::ScriptedTranscriber;
    use crate::decoder::{DecodeError, SegmentStream};
    use async_trait::async_trait;
    use futures_util::stream;
    use shared::JobStatus;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const GRACE: Duration = Duration::from_secs(2);

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn controller(transcriber: ScriptedTranscriber) -> JobController {
        JobController::new(Arc::new(transcriber), GRACE)
    }

    #[tokio::test]
    async fn stop_after_third_segment_keeps_exactly_three() {
        let controller = controller(ScriptedTranscriber::new(10).gated_after(3));
        let job = controller.admit(PathBuf::from("talk.wav")).await.unwrap();
        wait_until(|| job.segments_produced() == 3).await;

        assert_eq!(controller.stop().await, StopReport::Cancelled(job.id()));

        match controller.await_result(&job).await.unwrap() {
            JobOutcome::Cancelled(cancellation) => {
                assert_eq!(cancellation.reason, CancelReason::StopRequested);
                let texts: Vec<_> = cancellation.partial.iter().map(|s| s.text.as_str()).collect();
                assert_eq!(texts, vec!["segment 0", "segment 1", "segment 2"]);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(controller.slot.current().await.is_none());
    }

    #[tokio::test]
    async fn completed_job_then_stop_is_idle() {
        let controller = controller(ScriptedTranscriber::new(4));

        match controller.submit(PathBuf::from("talk.wav")).await.unwrap() {
            JobOutcome::Completed(segments) => assert_eq!(segments.len(), 4),
            other => panic!("expected completion, got {other:?}"),
        }

        assert!(controller.slot.current().await.is_none());
        assert_eq!(controller.stop().await, StopReport::Idle);
        assert!(controller.slot.current().await.is_none());
    }

    #[tokio::test]
    async fn stop_without_job_is_a_noop() {
        let controller = controller(ScriptedTranscriber::new(1));
        assert_eq!(controller.stop().await, StopReport::Idle);
        assert_eq!(controller.stop().await, StopReport::Idle);
    }

    #[tokio::test]
    async fn second_submit_is_busy_and_first_stays_cancellable() {
        let controller = controller(ScriptedTranscriber::new(5).gated_after(1));
        let first = controller.admit(PathBuf::from("a.wav")).await.unwrap();
        wait_until(|| first.segments_produced() == 1).await;

        match controller.submit(PathBuf::from("b.wav")).await {
            Err(JobError::Busy(id)) => assert_eq!(id, first.id()),
            other => panic!("expected busy, got {other:?}"),
        }
        assert!(!first.cancel().observe());
        assert_eq!(first.status(), JobStatus::Running);

        assert_eq!(controller.stop().await, StopReport::Cancelled(first.id()));
        assert!(matches!(
            controller.await_result(&first).await,
            Ok(JobOutcome::Cancelled(Cancellation { ref partial, .. })) if partial.len() == 1
        ));
    }

    #[tokio::test]
    async fn signal_is_lowered_when_next_job_runs() {
        let transcriber = ScriptedTranscriber::new(3).gated_after(0);
        let gate = transcriber.gate.clone();
        let controller = controller(transcriber);

        let first = controller.admit(PathBuf::from("a.wav")).await.unwrap();
        wait_until(|| first.status() == JobStatus::Running).await;
        assert_eq!(controller.stop().await, StopReport::Cancelled(first.id()));
        assert!(first.cancel().observe());

        let second = controller.admit(PathBuf::from("b.wav")).await.unwrap();
        wait_until(|| second.status() == JobStatus::Running).await;
        assert!(!second.cancel().observe());

        gate.notify_one();
        assert!(matches!(
            controller.await_result(&second).await,
            Ok(JobOutcome::Completed(ref segments)) if segments.len() == 3
        ));
    }

    #[tokio::test]
    async fn decoder_receives_the_job_signal() {
        let transcriber = ScriptedTranscriber::new(3).gated_after(0);
        let signals = transcriber.signals.clone();
        let controller = controller(transcriber);

        let first = controller.admit(PathBuf::from("a.wav")).await.unwrap();
        wait_until(|| signals.lock().unwrap().len() == 1).await;
        assert!(!signals.lock().unwrap()[0].observe());
        assert_eq!(controller.stop().await, StopReport::Cancelled(first.id()));
        assert!(signals.lock().unwrap()[0].observe());

        let second = controller.admit(PathBuf::from("b.wav")).await.unwrap();
        wait_until(|| signals.lock().unwrap().len() == 2).await;
        assert!(!signals.lock().unwrap()[1].observe());
        assert_eq!(controller.stop().await, StopReport::Cancelled(second.id()));
        assert!(signals.lock().unwrap()[1].observe());
    }

    #[tokio::test]
    async fn decoder_failure_is_a_decode_error() {
        let controller = controller(ScriptedTranscriber::new(5).failing_at(2));
        match controller.submit(PathBuf::from("talk.wav")).await {
            Err(JobError::Decode(cause)) => assert_eq!(cause, "model error: failed at segment 2"),
            other => panic!("expected decode error, got {other:?}"),
        }
        assert!(controller.slot.current().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_submits_never_run_two_jobs() {
        let transcriber = ScriptedTranscriber::new(20);
        let max_running = transcriber.max_running.clone();
        let controller = Arc::new(controller(transcriber));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller.submit(PathBuf::from(format!("{i}.wav"))).await
                })
            })
            .collect();

        let mut completed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(JobOutcome::Completed(_)) => completed += 1,
                Err(JobError::Busy(_)) => {}
                other => panic!("unexpected result {other:?}"),
            }
        }
        assert!(completed >= 1);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_submits_and_stops_never_run_two_jobs() {
        let transcriber = ScriptedTranscriber::new(6).gated_after(2);
        let max_running = transcriber.max_running.clone();
        let gate = transcriber.gate.clone();
        let controller = Arc::new(controller(transcriber));

        let mut submits = Vec::new();
        let mut stops = Vec::new();
        for i in 0..12 {
            let submitter = Arc::clone(&controller);
            submits.push(tokio::spawn(async move {
                submitter.submit(PathBuf::from(format!("{i}.wav"))).await
            }));
            if i % 3 == 0 {
                let stopper = Arc::clone(&controller);
                stops.push(tokio::spawn(async move { stopper.stop().await }));
            }
        }

        // Keeps gated jobs moving so every submit returns.
        let drainer = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                loop {
                    controller.stop().await;
                    gate.notify_one();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        for task in submits {
            let result = tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("submit did not return")
                .unwrap();
            match result {
                Ok(JobOutcome::Completed(_)) | Ok(JobOutcome::Cancelled(_)) => {}
                Err(JobError::Busy(_)) => {}
                other => panic!("unexpected result {other:?}"),
            }
        }
        drainer.abort();
        for task in stops {
            assert!(!matches!(task.await.unwrap(), StopReport::Detached(_)));
        }

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(controller.slot.current().await.is_none());
    }

    /// Blocks its worker thread between segments, ignoring cancellation.
    /// Only the first decode blocks; later ones never yield anything.
    struct BlockingTranscriber {
        calls: AtomicUsize,
        blocks_entered: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TranscriptionDecoder for BlockingTranscriber {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn decode(
            &self,
            _source: &Path,
            _cancel: CancelSignal,
        ) -> Result<SegmentStream, DecodeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(stream::pending().boxed());
            }
            let entered = self.blocks_entered.clone();
            let flag = DropFlag(self.dropped.clone());
            let s = stream::unfold(0usize, move |i| {
                let entered = entered.clone();
                async move {
                    if i == 3 {
                        return None;
                    }
                    entered.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(300));
                    Some((Ok(Segment::new(i as f64, i as f64 + 1.0, "slow")), i + 1))
                }
            })
            .map(move |item| {
                let _flag = &flag;
                item
            });
            Ok(s.boxed())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unresponsive_job_is_detached_after_grace() {
        let blocks_entered = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let controller = JobController::new(
            Arc::new(BlockingTranscriber {
                calls: AtomicUsize::new(0),
                blocks_entered: blocks_entered.clone(),
                dropped: dropped.clone(),
            }),
            Duration::from_millis(20),
        );

        let stuck = controller.admit(PathBuf::from("a.wav")).await.unwrap();
        wait_until(|| blocks_entered.load(Ordering::SeqCst) == 2).await;

        assert_eq!(controller.stop().await, StopReport::Detached(stuck.id()));
        assert!(controller.slot.current().await.is_none());
        match controller.await_result(&stuck).await.unwrap() {
            JobOutcome::Cancelled(cancellation) => {
                assert_eq!(cancellation.reason, CancelReason::StopGraceElapsed);
                assert_eq!(cancellation.partial.len(), 1);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }

        let next = controller.admit(PathBuf::from("b.wav")).await.unwrap();

        // The detached runner wakes up, sees the stop and exits; its late
        // cleanup must not evict the newer job or overwrite the outcome.
        wait_until(|| dropped.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(controller.slot.current().await.unwrap().same_job(&next));
        assert!(!next.cancel().observe());
        assert!(matches!(
            stuck.terminal().await,
            JobState::Cancelled {
                reason: CancelReason::StopGraceElapsed,
                ..
            }
        ));

        assert_eq!(controller.stop().await, StopReport::Cancelled(next.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiter_woken_by_detach_can_submit_again() {
        let blocks_entered = Arc::new(AtomicUsize::new(0));
        let controller = Arc::new(JobController::new(
            Arc::new(BlockingTranscriber {
                calls: AtomicUsize::new(0),
                blocks_entered: blocks_entered.clone(),
                dropped: Arc::new(AtomicBool::new(false)),
            }),
            Duration::from_millis(20),
        ));

        let stuck = controller.admit(PathBuf::from("a.wav")).await.unwrap();
        wait_until(|| blocks_entered.load(Ordering::SeqCst) == 1).await;

        let waiter = {
            let controller = Arc::clone(&controller);
            let stuck = stuck.clone();
            tokio::spawn(async move {
                stuck.terminal().await;
                controller.admit(PathBuf::from("b.wav")).await
            })
        };

        assert_eq!(controller.stop().await, StopReport::Detached(stuck.id()));
        let next = match waiter.await.unwrap() {
            Ok(next) => next,
            Err(e) => panic!("resubmit after detach failed: {e}"),
        };
        assert_ne!(next.id(), stuck.id());
        assert_eq!(controller.stop().await, StopReport::Cancelled(next.id()));
    }

    #[tokio::test]
    async fn status_reports_current_job() {
        let controller = controller(ScriptedTranscriber::new(5).gated_after(2));
        let idle = controller.status("chat").await;
        assert!(idle.current_job.is_none());
        assert_eq!(idle.transcription_backend, "scripted");
        assert_eq!(idle.chat_backend, "chat");

        let job = controller.admit(PathBuf::from("a.wav")).await.unwrap();
        wait_until(|| job.segments_produced() == 2).await;

        let busy = controller.status("chat").await;
        let current = busy.current_job.unwrap();
        assert_eq!(current.id, job.id());
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.segments, 2);

        controller.stop().await;
    }
}
