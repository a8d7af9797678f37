//! Control-channel listener for the embedding worker.
//!
//! The embedding worker's thread count is fixed at startup, so `set_workers`
//! only logs a restart note here; `stop` flips the shared shutdown flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{error, info, warn};

use audioscope_core::control::{ControlCommand, parse_control_message};
use audioscope_core::queue::QueueClient;

use crate::CONTROL_CHANNEL;

pub async fn run_control_listener(queue: QueueClient, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        let mut pubsub = match queue.subscribe(CONTROL_CHANNEL).await {
            Ok(ps) => ps,
            Err(e) => {
                error!(error = %e, "Control channel subscription failed; retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let mut stream = pubsub.on_message();
        loop {
            let message = tokio::select! {
                msg = stream.next() => msg,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if shutdown.load(Ordering::SeqCst) {
                        info!("Control channel listener stopped");
                        return;
                    }
                    continue;
                }
            };

            let Some(message) = message else {
                warn!("Control channel connection closed; resubscribing");
                break;
            };

            let payload: String = match message.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Unreadable control message");
                    continue;
                }
            };

            match parse_control_message(&payload) {
                Some(ControlCommand::Stop) => {
                    info!("Stop signal received on control channel");
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
                Some(ControlCommand::SetWorkers(count)) => {
                    info!(
                        requested = count,
                        "Worker count change requested; restart the service to apply"
                    );
                }
                Some(other) => {
                    info!(command = ?other, "Control signal ignored by embedding worker");
                }
                None => warn!(payload = %payload, "Unknown control message"),
            }
        }
    }
}
