use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::context::AppContext;
use crate::gateway;
use crate::metrics;
use crate::retry::{Outcome, RetryPipeline};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fixed-size pool of consumer workers.
///
/// Each worker owns one broker consumer handle (its own prefetch window),
/// pulls deliveries from the work queues and drives them through the retry
/// pipeline. The delivery is acked exactly once after the pipeline reaches a
/// terminal state — success or dead-lettered — so a worker crash mid-
/// processing leaves the message unacked for redelivery.
pub struct ConsumerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ConsumerPool {
    pub async fn spawn(
        broker: Broker,
        pipeline: Arc<RetryPipeline>,
        ctx: AppContext,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = &ctx.config.broker;
        let queues = vec![config.general_queue.clone(), config.private_queue.clone()];

        let mut handles = Vec::with_capacity(config.concurrent_consumers);
        for worker_id in 0..config.concurrent_consumers {
            let consumer = broker.consumer(queues.clone(), config.prefetch_count).await;
            let pipeline = pipeline.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                tracing::info!(worker_id = worker_id, "Consumer worker started");

                while !shutdown.load(Ordering::SeqCst) {
                    let delivery =
                        match tokio::time::timeout(SHUTDOWN_POLL_INTERVAL, consumer.recv()).await {
                            Ok(delivery) => delivery,
                            Err(_) => continue,
                        };

                    metrics::DELIVERIES_TOTAL.inc();
                    let outcome = pipeline
                        .process(&delivery, |d| {
                            let ctx = ctx.clone();
                            async move { gateway::dispatch_delivery(&ctx, d).await }
                        })
                        .await;

                    match &outcome {
                        Outcome::Success { attempts } => {
                            tracing::debug!(
                                worker_id = worker_id,
                                message_id = %delivery.correlation_id,
                                attempts = attempts,
                                "Delivery processed"
                            );
                        }
                        Outcome::DeadLettered { attempts, .. } => {
                            tracing::warn!(
                                worker_id = worker_id,
                                message_id = %delivery.correlation_id,
                                attempts = attempts,
                                "Delivery dead-lettered"
                            );
                        }
                    }

                    // Terminal either way: settle the delivery
                    consumer.ack(delivery.tag).await;
                }

                tracing::info!(worker_id = worker_id, "Consumer worker stopped");
            }));
        }

        Self { handles, shutdown }
    }

    /// Signal workers to stop after their current delivery and wait for them
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}
