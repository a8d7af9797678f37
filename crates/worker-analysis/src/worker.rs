//! Batch-processing loop for the feature-extraction worker.
//!
//! BRPOP-driven: blocks for the first job, drains the queue up to the batch
//! size, claims the rows, and fans the batch out to the worker pool under a
//! wall-clock batch timeout. Pool crashes re-queue unfinished jobs without
//! consuming retry budget; maintenance passes reconcile row state with the
//! queue while the loop idles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, warn};

use audioscope_core::analysis::{ANALYSIS_VERSION, TrackFeatures};
use audioscope_core::config::AnalysisConfig;
use audioscope_core::control::ControlCommand;
use audioscope_core::errors::JobError;
use audioscope_core::jobs::AnalysisJob;
use audioscope_core::paths::resolve_track_path;
use audioscope_core::queue::QueueClient;
use audioscope_core::store::{FAILURE_ENTITY_AUDIO, Store, failure_metadata};

use crate::pool::{AnalysisPool, PoolJob, PoolLimits};
use crate::{ANALYSIS_QUEUE, HEARTBEAT_KEY};

/// Maintenance runs after this many consecutive empty BRPOP cycles.
const IDLE_SHUTDOWN_CYCLES: u32 = 10;
/// Maintenance also runs every N busy batches.
const BUSY_MAINTENANCE_INTERVAL: u64 = 50;
/// Consecutive loop errors before the recovery pass kicks in.
const ERROR_RECOVERY_THRESHOLD: u32 = 5;

type JobReceiver = oneshot::Receiver<Result<TrackFeatures, JobError>>;

pub struct AnalysisWorker {
    queue: QueueClient,
    store: Store,
    config: AnalysisConfig,
    pool: Option<AnalysisPool>,
    num_workers: usize,
    paused: bool,
    consecutive_empty: u32,
    consecutive_errors: u32,
    last_work: Instant,
    pending_resize: Option<(usize, Instant)>,
    batch_count: u64,
    commands: UnboundedReceiver<ControlCommand>,
    shutdown: Arc<AtomicBool>,
}

impl AnalysisWorker {
    pub fn new(
        queue: QueueClient,
        store: Store,
        config: AnalysisConfig,
        commands: UnboundedReceiver<ControlCommand>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let num_workers = config.num_workers;
        Self {
            queue,
            store,
            config,
            pool: None,
            num_workers,
            paused: false,
            consecutive_empty: 0,
            consecutive_errors: 0,
            last_work: Instant::now(),
            pending_resize: None,
            batch_count: 0,
            commands,
            shutdown,
        }
    }

    fn limits(&self) -> PoolLimits {
        PoolLimits {
            max_file_size_mb: self.config.max_file_size_mb,
            max_analyze_secs: self.config.max_analyze_secs,
        }
    }

    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            workers = self.num_workers,
            brpop_timeout_secs = self.config.brpop_timeout.as_secs(),
            max_retries = self.config.max_retries,
            stale_processing_minutes = self.config.stale_processing_minutes,
            batch_timeout_secs = self.config.batch_timeout.as_secs(),
            "Starting analysis worker (lazy pool)"
        );

        info!("Cleaning up stale processing tracks...");
        self.run_maintenance().await;
        self.reconcile_pending().await;

        while !self.shutdown.load(Ordering::SeqCst) {
            self.queue.set_heartbeat(HEARTBEAT_KEY).await;
            self.drain_control_commands();
            self.apply_pending_resize().await;

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if self.paused {
                debug!("Analysis paused, waiting for resume signal");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            // A pool that stops answering probes is treated as crashed.
            if let Some(pool) = &self.pool
                && !pool.health_check().await
            {
                warn!("Pool health check failed; recreating pool");
                self.recreate_pool().await;
            }

            match self.process_batch().await {
                Ok(true) => {
                    self.consecutive_empty = 0;
                    self.consecutive_errors = 0;
                    self.last_work = Instant::now();
                    self.batch_count += 1;
                    if self.batch_count % BUSY_MAINTENANCE_INTERVAL == 0 {
                        self.run_maintenance().await;
                    }
                }
                Ok(false) => {
                    self.consecutive_empty += 1;
                    self.consecutive_errors = 0;
                    let found_work = self.reconcile_pending().await;

                    if self.pool.is_some() && !found_work {
                        let idle = self.last_work.elapsed();
                        if idle >= self.config.model_idle_timeout {
                            self.shutdown_pool("Pool idle past timeout").await;
                        } else if idle >= self.config.brpop_timeout {
                            // Queue and pending rows are both empty.
                            self.shutdown_pool("All work complete").await;
                        }
                    }

                    if self.consecutive_empty >= IDLE_SHUTDOWN_CYCLES {
                        self.run_maintenance().await;
                        self.consecutive_empty = 0;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Worker loop error");
                    self.consecutive_errors += 1;

                    if self.consecutive_errors >= ERROR_RECOVERY_THRESHOLD {
                        info!("Multiple consecutive errors, attempting recovery...");
                        self.run_maintenance().await;
                        if let Some(pool) = &self.pool
                            && !pool.health_check().await
                        {
                            self.recreate_pool().await;
                        }
                        self.consecutive_errors = 0;
                    }

                    tokio::time::sleep(self.config.brpop_timeout).await;
                }
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.shutdown(true);
        }
        info!("Analysis worker stopped");
    }

    // ── Control plane ────────────────────────────────────────────────────

    fn drain_control_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ControlCommand::Pause => {
                    self.paused = true;
                    info!("Audio analysis PAUSED");
                }
                ControlCommand::Resume => {
                    self.paused = false;
                    info!("Audio analysis RESUMED");
                }
                ControlCommand::Stop => {
                    info!("Audio analysis STOPPING (graceful shutdown)");
                    self.shutdown.store(true, Ordering::SeqCst);
                }
                ControlCommand::SetWorkers(count) => {
                    if count != self.num_workers {
                        info!(
                            from = self.num_workers,
                            to = count,
                            debounce_secs = self.config.resize_debounce.as_secs(),
                            "Worker resize queued"
                        );
                        self.pending_resize = Some((count, Instant::now()));
                    }
                }
            }
        }
    }

    /// Apply a buffered resize once the debounce window has passed with no
    /// newer request.
    async fn apply_pending_resize(&mut self) {
        let Some((target, requested_at)) = self.pending_resize else {
            return;
        };
        if requested_at.elapsed() < self.config.resize_debounce {
            return;
        }
        self.pending_resize = None;

        if target == self.num_workers {
            info!(count = target, "Worker count unchanged");
            return;
        }

        info!(from = self.num_workers, to = target, "Resizing worker pool");
        self.num_workers = target;

        if let Some(old_pool) = self.pool.take() {
            let new_pool = AnalysisPool::start(target, self.limits());
            // Old pool drains its in-flight work before being dropped.
            tokio::task::spawn_blocking(move || old_pool.shutdown(true))
                .await
                .ok();
            self.pool = Some(new_pool);
        }
        info!(workers = self.num_workers, "Worker pool resized");
    }

    // ── Pool lifecycle ───────────────────────────────────────────────────

    fn ensure_pool(&mut self) -> &AnalysisPool {
        if self.pool.is_none() {
            self.pool = Some(AnalysisPool::start(self.num_workers, self.limits()));
        }
        self.pool.as_ref().expect("pool just created")
    }

    async fn shutdown_pool(&mut self, reason: &str) {
        if let Some(pool) = self.pool.take() {
            info!(reason, "Shutting down worker pool to free memory");
            tokio::task::spawn_blocking(move || pool.shutdown(true))
                .await
                .ok();
            info!("Worker pool shut down (will restart when work arrives)");
        }
    }

    async fn recreate_pool(&mut self) {
        warn!("Recreating worker pool after crash");
        if let Some(pool) = self.pool.take() {
            tokio::task::spawn_blocking(move || pool.shutdown(false))
                .await
                .ok();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.pool = Some(AnalysisPool::start(self.num_workers, self.limits()));
        info!(workers = self.num_workers, "Worker pool recreated");
    }

    // ── Batch processing ─────────────────────────────────────────────────

    /// Block for the first job, drain the rest, process the batch.
    /// Returns false when the blocking pop timed out.
    async fn process_batch(&mut self) -> Result<bool> {
        let Some(first) = self
            .queue
            .blocking_pop(ANALYSIS_QUEUE, self.config.brpop_timeout)
            .await?
        else {
            return Ok(false);
        };

        let mut jobs: Vec<AnalysisJob> = Vec::with_capacity(self.config.batch_size);
        for payload in std::iter::once(first).chain(
            self.queue
                .drain(ANALYSIS_QUEUE, self.config.batch_size.saturating_sub(1))
                .await?,
        ) {
            match serde_json::from_str::<AnalysisJob>(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, payload = %payload, "Dropping malformed analysis job"),
            }
        }

        if jobs.is_empty() {
            return Ok(true);
        }

        self.process_tracks(jobs).await?;
        Ok(true)
    }

    async fn process_tracks(&mut self, mut jobs: Vec<AnalysisJob>) -> Result<()> {
        info!(
            count = jobs.len(),
            workers = self.num_workers,
            "Processing batch"
        );

        // Producers may pre-claim rows as processing before enqueueing, so
        // both pending and processing rows are accepted; anything else is a
        // stale queue entry and dropped.
        let track_ids: Vec<String> = jobs.iter().map(|j| j.track_id.clone()).collect();
        let claimed = self.store.claim_batch(&track_ids).await?;
        if claimed.len() < jobs.len() {
            info!(
                skipped = jobs.len() - claimed.len(),
                "Skipped stale queue entries (non-pending status)"
            );
            jobs.retain(|j| claimed.contains(&j.track_id));
        }
        if jobs.is_empty() {
            info!("No pending tracks left in batch after status guard");
            return Ok(());
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.batch_timeout;
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut permanent_failed = 0usize;

        // Dispatch everything up front; path errors fail the job without
        // touching the pool.
        let mut dispatched: Vec<(AnalysisJob, Option<JobReceiver>)> = Vec::new();
        let mut crash: Option<String> = None;

        for job in jobs {
            if crash.is_some() {
                dispatched.push((job, None));
                continue;
            }
            match resolve_track_path(&self.config.music_path, &job.file_path) {
                Ok(path) => {
                    let pool_job = PoolJob {
                        track_id: job.track_id.clone(),
                        path,
                    };
                    match self.ensure_pool().submit(pool_job) {
                        Ok(receiver) => dispatched.push((job, Some(receiver))),
                        Err(e) => {
                            crash = Some(e.to_string());
                            dispatched.push((job, None));
                        }
                    }
                }
                Err(job_error) => {
                    self.save_failed(&job, &job_error).await;
                    if job_error.is_permanent() {
                        permanent_failed += 1;
                    } else {
                        failed += 1;
                    }
                    continue;
                }
            }
        }

        let mut pending = dispatched.into_iter();
        let mut abandoned = 0usize;
        if crash.is_none() {
            while let Some((job, receiver)) = pending.next() {
                let Some(mut receiver) = receiver else {
                    crash = Some("pool rejected job".to_string());
                    let mut unfinished = vec![job];
                    unfinished.extend(pending.by_ref().map(|(j, _)| j));
                    self.requeue_after_crash(unfinished).await;
                    break;
                };

                match tokio::time::timeout_at(deadline, &mut receiver).await {
                    Ok(Ok(Ok(features))) => {
                        self.store
                            .save_features(&job.track_id, &features, ANALYSIS_VERSION)
                            .await?;
                        completed += 1;
                        info!(track_id = %job.track_id, mode = %features.analysis_mode, "Completed");
                    }
                    Ok(Ok(Err(job_error))) => {
                        self.save_failed(&job, &job_error).await;
                        if job_error.is_permanent() {
                            permanent_failed += 1;
                            warn!(track_id = %job.track_id, error = %job_error, "Permanently failed");
                        } else {
                            failed += 1;
                            error!(track_id = %job.track_id, error = %job_error, "Failed");
                        }
                    }
                    Ok(Err(_recv_dropped)) => {
                        // Worker died mid-job: crash path re-queues this job
                        // and everything still unfinished.
                        crash = Some("pool worker crashed mid-job".to_string());
                        let mut unfinished = vec![job];
                        unfinished.extend(pending.by_ref().map(|(j, _)| j));
                        self.requeue_after_crash(unfinished).await;
                        break;
                    }
                    Err(_elapsed) => {
                        // Deadline passed while waiting on this job. The
                        // batch was fanned out to N workers, so jobs
                        // dispatched after a stuck one may already have
                        // finished; drain every remaining receiver and only
                        // fail the jobs that genuinely never produced a
                        // result.
                        error!(
                            "Batch timed out after {}s - failing unfinished tracks permanently",
                            self.config.batch_timeout.as_secs()
                        );
                        let timeout_error = JobError::permanent(format!(
                            "Batch timeout after {}s",
                            self.config.batch_timeout.as_secs()
                        ));

                        let mut remaining = vec![(job, receiver)];
                        remaining.extend(
                            pending
                                .by_ref()
                                .filter_map(|(j, r)| r.map(|r| (j, r))),
                        );

                        let mut crashed: Vec<AnalysisJob> = Vec::new();
                        for (late_job, mut late_receiver) in remaining {
                            match late_receiver.try_recv() {
                                Ok(Ok(features)) => {
                                    self.store
                                        .save_features(
                                            &late_job.track_id,
                                            &features,
                                            ANALYSIS_VERSION,
                                        )
                                        .await?;
                                    completed += 1;
                                    info!(
                                        track_id = %late_job.track_id,
                                        "Completed before batch deadline"
                                    );
                                }
                                Ok(Err(job_error)) => {
                                    self.save_failed(&late_job, &job_error).await;
                                    if job_error.is_permanent() {
                                        permanent_failed += 1;
                                    } else {
                                        failed += 1;
                                    }
                                }
                                Err(TryRecvError::Empty) => {
                                    self.save_failed(&late_job, &timeout_error).await;
                                    permanent_failed += 1;
                                    abandoned += 1;
                                    warn!(
                                        track_id = %late_job.track_id,
                                        "Permanently failed (batch timeout)"
                                    );
                                }
                                Err(TryRecvError::Closed) => {
                                    // Worker died without delivering: crash
                                    // semantics, no retry budget consumed.
                                    crashed.push(late_job);
                                }
                            }
                        }

                        if !crashed.is_empty() {
                            crash = Some("pool worker crashed during timed-out batch".to_string());
                            self.requeue_after_crash(crashed).await;
                        }
                        break;
                    }
                }
            }
        } else {
            // Submission already failed: nothing ran, re-queue the lot.
            let unfinished: Vec<AnalysisJob> = pending.map(|(j, _)| j).collect();
            self.requeue_after_crash(unfinished).await;
        }

        if let Some(reason) = crash {
            error!(reason = %reason, "Worker pool crash detected");
            self.recreate_pool().await;
        } else if abandoned > 0 {
            // Timed-out jobs cannot be cancelled; their threads stay pinned
            // until the work finishes on its own. Rebuild the pool so the
            // next batch gets its full worker count back.
            let pinned = self.pool.as_ref().map(|p| p.busy_workers()).unwrap_or(0);
            warn!(
                abandoned,
                pinned_workers = pinned,
                "Rebuilding pool to restore capacity after batch timeout"
            );
            self.recreate_pool().await;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let total = completed + failed + permanent_failed;
        let rate = if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        };
        info!(
            completed,
            failed,
            permanent_failed,
            elapsed_secs = format!("{elapsed:.1}"),
            tracks_per_sec = format!("{rate:.1}"),
            "Batch complete"
        );

        Ok(())
    }

    /// Re-queue jobs interrupted by an infrastructure failure without
    /// consuming their retry budget.
    async fn requeue_after_crash(&self, jobs: Vec<AnalysisJob>) {
        if jobs.is_empty() {
            return;
        }

        let reason = "Analyzer worker crashed; re-queued for retry";
        let ids: Vec<String> = jobs.iter().map(|j| j.track_id.clone()).collect();
        let eligible = match self.store.requeue_processing(&ids, reason).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to reset tracks to pending after pool crash");
                return;
            }
        };

        let payloads: Vec<String> = jobs
            .iter()
            .filter(|j| eligible.contains(&j.track_id))
            .filter_map(|j| serde_json::to_string(j).ok())
            .collect();

        if payloads.is_empty() {
            return;
        }
        match self.queue.push_many(ANALYSIS_QUEUE, &payloads).await {
            Ok(()) => warn!(count = payloads.len(), "Re-queued tracks after pool crash"),
            Err(e) => error!(error = %e, "Failed to push re-queued tracks back to Redis"),
        }
    }

    async fn save_failed(&self, job: &AnalysisJob, job_error: &JobError) {
        let permanent = job_error.is_permanent();
        let message = job_error.to_string();

        let retry_count = match self
            .store
            .mark_analysis_failed(&job.track_id, &message, permanent, self.config.max_retries)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, track_id = %job.track_id, "Failed to mark track as failed");
                return;
            }
        };

        let context = self.store.track_context(&job.track_id).await.unwrap_or(None);
        let metadata = failure_metadata(
            context.as_ref().and_then(|c| c.file_path.as_deref()),
            context.as_ref().and_then(|c| c.artist_id.as_deref()),
            permanent,
            retry_count,
            self.config.max_retries,
        );

        if let Err(e) = self
            .store
            .upsert_failure(
                FAILURE_ENTITY_AUDIO,
                &job.track_id,
                context.as_ref().and_then(|c| c.title.as_deref()),
                &message,
                metadata,
            )
            .await
        {
            error!(error = %e, track_id = %job.track_id, "Failed to record failure row");
        }

        if permanent || retry_count >= self.config.max_retries {
            warn!(
                track_id = %job.track_id,
                retry_count,
                "Track permanently failed"
            );
        } else {
            info!(
                track_id = %job.track_id,
                attempt = retry_count,
                max_retries = self.config.max_retries,
                "Track failed, will retry"
            );
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    async fn run_maintenance(&self) {
        match self
            .store
            .reclaim_completed_stale(self.config.stale_processing_minutes)
            .await
        {
            Ok(ids) if !ids.is_empty() => {
                info!(count = ids.len(), "Recovered stale tracks that already had embeddings");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to reclaim stale completed tracks"),
        }

        match self
            .store
            .reset_stale_processing(self.config.stale_processing_minutes, self.config.max_retries)
            .await
        {
            Ok(count) if count > 0 => {
                info!(count, "Reset stale 'processing' tracks back to 'pending'");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to reset stale processing tracks"),
        }

        match self.store.recover_misfailed().await {
            Ok(ids) if !ids.is_empty() => {
                info!(count = ids.len(), "Recovered 'failed' tracks that already had embeddings");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to recover mis-failed tracks"),
        }

        match self.store.requeue_failed(self.config.max_retries).await {
            Ok(count) if count > 0 => {
                info!(
                    count,
                    max_retries = self.config.max_retries,
                    "Re-queued failed tracks for retry"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to re-queue failed tracks"),
        }

        match self
            .store
            .count_permanently_failed(self.config.max_retries)
            .await
        {
            Ok(count) if count > 0 => {
                warn!(count, "Tracks have permanently failed (retry budget exhausted)");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to count permanently failed tracks"),
        }
    }

    /// Claim pending rows the queue may have lost and push them back.
    /// Returns true when pending work was found.
    async fn reconcile_pending(&self) -> bool {
        let tracks = match self
            .store
            .select_pending(self.config.max_retries, self.config.batch_size as i64)
            .await
        {
            Ok(tracks) => tracks,
            Err(e) => {
                error!(error = %e, "DB reconciliation failed");
                return false;
            }
        };
        if tracks.is_empty() {
            return false;
        }

        info!(count = tracks.len(), "DB reconciliation found pending tracks, queuing...");

        let ids: Vec<String> = tracks.iter().map(|t| t.id.clone()).collect();
        let claimed = match self.store.claim_batch(&ids).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "Failed to claim pending tracks for reconciliation");
                return false;
            }
        };
        if claimed.is_empty() {
            return false;
        }

        let payloads: Vec<String> = tracks
            .iter()
            .filter(|t| claimed.contains(&t.id))
            .filter_map(|t| {
                serde_json::to_string(&AnalysisJob {
                    track_id: t.id.clone(),
                    file_path: t.file_path.clone().unwrap_or_default(),
                })
                .ok()
            })
            .collect();

        if let Err(e) = self.queue.push_many(ANALYSIS_QUEUE, &payloads).await {
            error!(error = %e, "Failed to push reconciled tracks to queue");
            return false;
        }
        true
    }
}
