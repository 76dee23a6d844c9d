//! Job boundary: cancellation, deadline, progress and threading.
//!
//! A [`JobContext`] travels through every stage of one render. Stages call
//! [`JobContext::checkpoint`] after each processed block, which is the only
//! place progress is reported and the only place a job can stop early.
//! Dropping a cancelled job's buffers is all the cleanup there is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use rayon::prelude::*;

use crate::buffer::AudioBuffer;
use crate::config::MixSpec;
use crate::error::{MasterError, Result, Stage};
use crate::meters::LiveMeters;
use crate::render::{RenderOutput, Renderer};

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Block-level progress of one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub stage: Stage,
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f32 / self.total as f32).clamp(0.0, 1.0)
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobContext {
    cancel: CancelToken,
    deadline: Option<Instant>,
    progress: Option<ProgressFn>,
    meters: Option<Arc<LiveMeters>>,
}

impl JobContext {
    /// Context with no deadline, no observers and a private cancel flag.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_progress(mut self, f: ProgressFn) -> Self {
        self.progress = Some(f);
        self
    }

    pub fn with_meters(mut self, meters: Arc<LiveMeters>) -> Self {
        self.meters = Some(meters);
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn meters(&self) -> Option<&LiveMeters> {
        self.meters.as_deref()
    }

    /// Report `done` of `total` blocks for `stage`, then stop the job if it
    /// was cancelled or ran past its deadline.
    pub fn checkpoint(&self, stage: Stage, done: usize, total: usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MasterError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MasterError::DeadlineExceeded);
            }
        }
        let progress = Progress { stage, done, total };
        if let Some(meters) = &self.meters {
            meters.set_stage_progress(stage, progress.fraction());
        }
        if let Some(f) = &self.progress {
            f(progress);
        }
        Ok(())
    }
}

/// One vocal + beat render, runnable inline, on its own thread, or in a batch.
pub struct MasteringJob {
    vocal: AudioBuffer,
    beat: AudioBuffer,
    spec: MixSpec,
    timeout: Option<Duration>,
    progress: Option<ProgressFn>,
    meters: Arc<LiveMeters>,
    cancel: CancelToken,
}

impl MasteringJob {
    pub fn new(vocal: AudioBuffer, beat: AudioBuffer, spec: MixSpec) -> Self {
        Self {
            vocal,
            beat,
            spec,
            timeout: None,
            progress: None,
            meters: Arc::new(LiveMeters::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Whole-pipeline deadline, counted from when the job starts running.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn meters(&self) -> Arc<LiveMeters> {
        Arc::clone(&self.meters)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run on the calling thread.
    pub fn run(self) -> Result<RenderOutput> {
        let mut ctx = JobContext::detached()
            .with_cancel(self.cancel.clone())
            .with_meters(Arc::clone(&self.meters));
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(f) = self.progress.clone() {
            ctx = ctx.with_progress(f);
        }

        let started = Instant::now();
        let result = Renderer::new(self.spec).render_in(&self.vocal, &self.beat, &ctx);
        match &result {
            Ok(out) => info!(
                "mastering job finished in {:.2?}: {:.2} LUFS, {} correction(s)",
                started.elapsed(),
                out.measurement.integrated_lufs,
                out.corrections
            ),
            Err(e) => debug!("mastering job stopped after {:.2?}: {}", started.elapsed(), e),
        }
        result
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> JobHandle {
        let cancel = self.cancel.clone();
        let meters = self.meters();
        let handle = thread::Builder::new()
            .name("vxmaster-job".into())
            .spawn(move || self.run());
        JobHandle {
            cancel,
            meters,
            handle,
        }
    }
}

pub struct JobHandle {
    cancel: CancelToken,
    meters: Arc<LiveMeters>,
    handle: std::io::Result<thread::JoinHandle<Result<RenderOutput>>>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn meters(&self) -> &LiveMeters {
        &self.meters
    }

    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Ok(h) => h.is_finished(),
            Err(_) => true,
        }
    }

    /// Block until the job completes.
    pub fn wait(self) -> Result<RenderOutput> {
        match self.handle {
            Ok(h) => match h.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            Err(e) => Err(MasterError::Spawn(e.to_string())),
        }
    }
}

/// Render independent jobs in parallel. Results keep the input order.
pub fn render_batch(jobs: Vec<MasteringJob>) -> Vec<Result<RenderOutput>> {
    debug!("rendering batch of {} job(s)", jobs.len());
    jobs.into_par_iter().map(MasteringJob::run).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_signals::{sine, stereo};
    use std::sync::atomic::AtomicUsize;

    fn job(seconds: f32) -> MasteringJob {
        let sr = 48000;
        let vocal = stereo(sine(220.0, 0.1, seconds, sr), sr);
        let beat = stereo(sine(60.0, 0.2, seconds, sr), sr);
        MasteringJob::new(vocal, beat, MixSpec::default())
    }

    #[test]
    fn test_checkpoint_honours_cancel() {
        let token = CancelToken::new();
        let ctx = JobContext::detached().with_cancel(token.clone());
        assert!(ctx.checkpoint(Stage::Mix, 1, 2).is_ok());
        token.cancel();
        assert_eq!(
            ctx.checkpoint(Stage::Mix, 2, 2),
            Err(MasterError::Cancelled)
        );
    }

    #[test]
    fn test_checkpoint_honours_deadline() {
        let ctx = JobContext::detached().with_deadline(Instant::now());
        assert_eq!(
            ctx.checkpoint(Stage::Limit, 0, 1),
            Err(MasterError::DeadlineExceeded)
        );
    }

    #[test]
    fn test_progress_reports_real_blocks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let out = job(1.0)
            .on_progress(move |p| {
                assert!(p.done <= p.total);
                seen.fetch_add(1, Ordering::Relaxed);
            })
            .run()
            .unwrap();
        assert!(out.measurement.integrated_lufs.is_finite());
        assert!(calls.load(Ordering::Relaxed) > 10);
    }

    #[test]
    fn test_cancelled_job_returns_error() {
        let job = job(2.0);
        job.cancel_token().cancel();
        let handle = job.spawn();
        assert_eq!(handle.wait().unwrap_err(), MasterError::Cancelled);
    }

    #[test]
    fn test_zero_timeout_fails_job() {
        let result = job(1.0).with_timeout(Duration::ZERO).run();
        assert_eq!(result.unwrap_err(), MasterError::DeadlineExceeded);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let batch = render_batch(vec![job(1.0), job(1.5)]);
        let single = job(1.5).run().unwrap();
        assert_eq!(batch.len(), 2);
        let second = batch[1].as_ref().unwrap();
        assert_eq!(second.buffer, single.buffer);
    }

    #[test]
    fn test_job_publishes_limiter_meters() {
        let sr = 48000;
        let vocal = stereo(sine(220.0, 0.1, 1.0, sr), sr);
        let beat = stereo(sine(60.0, 0.9, 1.0, sr), sr);
        let spec = MixSpec {
            beat_gain_db: 12.0,
            max_corrections: 0,
            ..MixSpec::default()
        };
        let ceiling = spec.limiter_ceiling_db;
        let job = MasteringJob::new(vocal, beat, spec);
        let meters = job.meters();
        assert_eq!(meters.get_gain_reduction_db(), 0.0);

        let out = job.run().unwrap();
        assert!(out.limiter_stats.max_gain_reduction_db > 0.0);
        assert!(meters.get_gain_reduction_db() > 0.0);
        let tp = meters.get_true_peak_db();
        assert!(tp.is_finite() && tp <= ceiling + 1.0, "{tp}");
        assert_eq!(tp, out.measurement.true_peak_db);
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let handle = JobHandle {
            cancel: CancelToken::new(),
            meters: Arc::new(LiveMeters::new()),
            handle: Err(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "no threads left",
            )),
        };
        assert!(handle.is_finished());
        match handle.wait() {
            Err(MasterError::Spawn(msg)) => assert!(msg.contains("no threads left")),
            other => panic!("expected a spawn error, got {:?}", other.map(|_| ())),
        }
    }
}
