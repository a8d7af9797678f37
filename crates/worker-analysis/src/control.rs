//! Control-plane subscriber for the analysis worker.
//!
//! Forwards parsed commands to the worker loop over an unbounded channel so
//! the loop can drain them non-blockingly between batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use audioscope_core::control::{ControlCommand, parse_control_message};
use audioscope_core::queue::QueueClient;

use crate::CONTROL_CHANNEL;

pub async fn run_control_listener(
    queue: QueueClient,
    commands: UnboundedSender<ControlCommand>,
    shutdown: Arc<AtomicBool>,
) {
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
                Some(command) => {
                    info!(?command, "Received control signal");
                    if commands.send(command).is_err() {
                        // Worker loop gone; nothing left to control.
                        return;
                    }
                    if command == ControlCommand::Stop {
                        shutdown.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                None => warn!(payload = %payload, "Unknown control message"),
            }
        }
    }
}
