//! Listener Fetch Loop
//!
//! Pulls batched messages from a durable subscription and hands them to the
//! processor one at a time. Runs until the listener's running flag drops,
//! the subscription closes, or a global shutdown is broadcast.

use cor_broker::{BrokerError, PullSubscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::manager::ListenerSettings;
use crate::processor::ResponseProcessor;

pub(crate) struct FetcherContext {
    pub listener_id: String,
    pub subject: String,
    pub subscription: Arc<dyn PullSubscription>,
    pub processor: Arc<ResponseProcessor>,
    pub running: Arc<AtomicBool>,
    pub settings: ListenerSettings,
}

pub(crate) async fn run_fetch_loop(ctx: FetcherContext, mut shutdown_rx: broadcast::Receiver<()>) {
    info!(
        listener_id = %ctx.listener_id,
        subject = %ctx.subject,
        batch_size = ctx.settings.batch_size,
        "Listener fetch loop started"
    );

    while ctx.running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(listener_id = %ctx.listener_id, "Listener fetch loop received shutdown");
                break;
            }
            result = ctx.subscription.fetch(ctx.settings.batch_size, ctx.settings.max_wait) => {
                match result {
                    Ok(messages) => {
                        // Strictly sequential: the next message is only
                        // looked at once this one has been settled.
                        for message in &messages {
                            if !ctx.running.load(Ordering::SeqCst) {
                                break;
                            }
                            ctx.processor.process(&ctx.subscription, message).await;
                        }
                    }
                    Err(BrokerError::Closed) => {
                        info!(listener_id = %ctx.listener_id, "Subscription closed, fetch loop exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(
                            listener_id = %ctx.listener_id,
                            error = %e,
                            "Fetch failed, retrying after backoff"
                        );
                    }
                }
                tokio::time::sleep(ctx.settings.poll_interval).await;
            }
        }
    }

    info!(listener_id = %ctx.listener_id, subject = %ctx.subject, "Listener fetch loop exited");
}
