//! Dynamically-sized analysis worker pool.
//!
//! Each worker thread owns its own analyzer instance and receives pure-data
//! job descriptors over a channel, returning pure-data results — no shared
//! state crosses the boundary, so the pool maps onto OS threads the same way
//! it would onto child processes. A panicking worker is caught, marks the
//! pool broken, and surfaces to the caller as a crash; the caller re-queues
//! unfinished jobs and rebuilds the pool.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use audioscope_core::analysis::{Analyzer, TrackFeatures};
use audioscope_core::audio::{ANALYSIS_SAMPLE_RATE, load_audio_window};
use audioscope_core::errors::{JobError, PoolError};
use audioscope_core::vibe::release_heap;

/// Pure-data job descriptor handed to a pool worker.
#[derive(Debug, Clone)]
pub struct PoolJob {
    pub track_id: String,
    pub path: PathBuf,
}

/// Limits applied inside each worker.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_file_size_mb: u64,
    pub max_analyze_secs: f64,
}

enum Request {
    Analyze {
        job: PoolJob,
        reply: oneshot::Sender<Result<TrackFeatures, JobError>>,
    },
    /// No-op used by the health check.
    Probe { reply: oneshot::Sender<()> },
}

pub struct AnalysisPool {
    sender: Option<mpsc::Sender<Request>>,
    handles: Vec<JoinHandle<()>>,
    broken: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
}

impl AnalysisPool {
    /// Spawn `size` worker threads, each initializing its own analyzer.
    pub fn start(size: usize, limits: PoolLimits) -> Self {
        info!(workers = size, "Starting analysis worker pool");

        let (sender, receiver) = mpsc::channel::<Request>();
        let receiver = Arc::new(Mutex::new(receiver));
        let broken = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicUsize::new(0));

        let handles = (0..size)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let broken = broken.clone();
                let busy = busy.clone();
                std::thread::Builder::new()
                    .name(format!("analysis-worker-{worker_id}"))
                    .spawn(move || worker_thread(worker_id, receiver, broken, busy, limits))
                    .expect("failed to spawn pool worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            handles,
            broken,
            busy,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Workers currently executing a job. After a batch timeout this counts
    /// the threads still pinned by abandoned jobs — a thread cannot be
    /// cancelled mid-job, so the batch loop uses this to decide whether to
    /// rebuild the pool and restore capacity.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Submit a job. The returned receiver resolves with the job outcome; a
    /// dropped receiver means the worker died mid-job.
    pub fn submit(
        &self,
        job: PoolJob,
    ) -> Result<oneshot::Receiver<Result<TrackFeatures, JobError>>, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::ShutDown)?;
        if self.is_broken() {
            return Err(PoolError::Crash("pool marked broken".to_string()));
        }

        let (reply, receiver) = oneshot::channel();
        sender
            .send(Request::Analyze { job, reply })
            .map_err(|_| PoolError::Crash("all pool workers exited".to_string()))?;
        Ok(receiver)
    }

    /// Submit a no-op probe and wait up to 5 seconds for a worker to answer.
    pub async fn health_check(&self) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        if self.is_broken() {
            return false;
        }

        let (reply, receiver) = oneshot::channel();
        if sender.send(Request::Probe { reply }).is_err() {
            return false;
        }

        matches!(
            tokio::time::timeout(Duration::from_secs(5), receiver).await,
            Ok(Ok(()))
        )
    }

    /// Shut the pool down, optionally waiting for in-flight work, and ask
    /// the allocator to return freed pages to the OS.
    ///
    /// Without `wait`, threads still running a job are detached — a thread
    /// cannot be interrupted mid-job, so hung or abandoned work finishes (or
    /// never does) on its own and the replacement pool carries the capacity.
    pub fn shutdown(mut self, wait: bool) {
        self.sender.take();
        if wait {
            for handle in self.handles.drain(..) {
                if handle.join().is_err() {
                    warn!("Pool worker panicked during shutdown");
                }
            }
        }
        release_heap();
    }
}

impl Drop for AnalysisPool {
    fn drop(&mut self) {
        self.sender.take();
    }
}

fn worker_thread(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Request>>>,
    broken: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
    limits: PoolLimits,
) {
    let analyzer = Analyzer::new();
    info!(worker_id, "Pool worker initialized");

    loop {
        let request = {
            let guard = match receiver.lock() {
                Ok(g) => g,
                Err(_) => {
                    broken.store(true, Ordering::SeqCst);
                    return;
                }
            };
            guard.recv()
        };

        let request = match request {
            Ok(r) => r,
            // Sender dropped: normal shutdown.
            Err(_) => return,
        };

        match request {
            Request::Probe { reply } => {
                let _ = reply.send(());
            }
            Request::Analyze { job, reply } => {
                busy.fetch_add(1, Ordering::SeqCst);
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| run_job(&analyzer, &job, limits)));
                busy.fetch_sub(1, Ordering::SeqCst);
                match outcome {
                    Ok(result) => {
                        let _ = reply.send(result);
                    }
                    Err(panic) => {
                        let message = panic_message(&panic);
                        error!(worker_id, track_id = %job.track_id, message = %message, "Pool worker panicked");
                        broken.store(true, Ordering::SeqCst);
                        // Dropping `reply` without a value signals the crash.
                        drop(reply);
                        return;
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Validate and analyze one track. Runs entirely inside the worker thread.
fn run_job(analyzer: &Analyzer, job: &PoolJob, limits: PoolLimits) -> Result<TrackFeatures, JobError> {
    let metadata = std::fs::metadata(&job.path)
        .map_err(|_| JobError::recoverable("File not found"))?;

    if limits.max_file_size_mb > 0 {
        let size_mb = metadata.len() as f64 / (1024.0 * 1024.0);
        if size_mb > limits.max_file_size_mb as f64 {
            return Err(JobError::permanent(format!(
                "File too large ({:.1}MB > {}MB limit)",
                size_mb, limits.max_file_size_mb
            )));
        }
    }

    let samples = load_audio_window(
        &job.path,
        ANALYSIS_SAMPLE_RATE,
        0.0,
        limits.max_analyze_secs,
    )
    .map_err(|e| JobError::from_message(format!("{:#}", e)))?;

    analyzer.analyze(&samples, ANALYSIS_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limits() -> PoolLimits {
        PoolLimits {
            max_file_size_mb: 500,
            max_analyze_secs: 90.0,
        }
    }

    #[tokio::test]
    async fn test_health_check_on_fresh_pool() {
        let pool = AnalysisPool::start(2, test_limits());
        assert!(pool.health_check().await);
        assert!(!pool.is_broken());
        assert_eq!(pool.busy_workers(), 0);
        pool.shutdown(true);
    }

    #[tokio::test]
    async fn test_missing_file_is_recoverable() {
        let pool = AnalysisPool::start(1, test_limits());
        let receiver = pool
            .submit(PoolJob {
                track_id: "t1".to_string(),
                path: PathBuf::from("/nonexistent/audio.flac"),
            })
            .unwrap();

        let outcome = receiver.await.unwrap();
        let err = outcome.unwrap_err();
        assert_eq!(err.to_string(), "File not found");
        assert!(!err.is_permanent());
        // The job finished, so no worker is pinned.
        assert_eq!(pool.busy_workers(), 0);
        pool.shutdown(true);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = AnalysisPool::start(1, test_limits());
        pool.shutdown(true);

        let pool = AnalysisPool {
            sender: None,
            handles: Vec::new(),
            broken: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicUsize::new(0)),
        };
        assert!(matches!(
            pool.submit(PoolJob {
                track_id: "t".to_string(),
                path: PathBuf::from("/tmp/x"),
            }),
            Err(PoolError::ShutDown)
        ));
    }
}
