// ============================================================================
// Consumer retry pipeline
// ============================================================================
//
// Per-delivery lifecycle: PROCESSING -> SUCCESS | RETRY(attempt) | DEAD_LETTERED
//
// Handler failures are classified by a pluggable classifier. Fatal classes
// (payload deserialization, invalid argument, unsupported operation by
// default) skip retry entirely; everything else retries with exponential
// backoff until the configured attempts run out. Exhausted and fatal messages
// are republished to the dead-letter exchange with the original message id
// as correlation id. A failing dead-letter publish is logged and accepted
// as the one case where a message can be lost.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::broker::{Broker, Delivery, Publication};
use crate::config::RetryConfig;
use crate::message::DeliveryMode;
use crate::metrics;

/// Failure raised by a delivery handler
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("payload deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProcessingError::Deserialization(_) => ErrorClass::Deserialization,
            ProcessingError::InvalidArgument(_) => ErrorClass::InvalidArgument,
            ProcessingError::Unsupported(_) => ErrorClass::Unsupported,
            ProcessingError::Other(_) => ErrorClass::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Deserialization,
    InvalidArgument,
    Unsupported,
    Other,
}

impl ErrorClass {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deserialization" => Some(ErrorClass::Deserialization),
            "invalid-argument" => Some(ErrorClass::InvalidArgument),
            "unsupported-operation" => Some(ErrorClass::Unsupported),
            "other" => Some(ErrorClass::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Fatal,
    Transient,
}

/// Configurable fatal-class set; the right set is domain-specific, so it is
/// data rather than hard-coded types.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    fatal: HashSet<ErrorClass>,
}

impl ErrorClassifier {
    pub fn new(fatal: HashSet<ErrorClass>) -> Self {
        Self { fatal }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let mut fatal = HashSet::new();
        for raw in &config.fatal_classes {
            match ErrorClass::parse(raw) {
                Some(class) => {
                    fatal.insert(class);
                }
                None => {
                    tracing::warn!(class = %raw, "Unknown fatal error class in configuration, ignoring");
                }
            }
        }
        Self { fatal }
    }

    pub fn classify(&self, error: &ProcessingError) -> Classification {
        if self.fatal.contains(&error.class()) {
            Classification::Fatal
        } else {
            Classification::Transient
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            fatal: [
                ErrorClass::Deserialization,
                ErrorClass::InvalidArgument,
                ErrorClass::Unsupported,
            ]
            .into_iter()
            .collect(),
        }
    }
}

/// Exponential backoff: initial * multiplier^retry, capped
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(retry as i32);
        Duration::from_millis(millis as u64).min(self.max)
    }
}

/// A message that exhausted its retries or failed fatally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub original_exchange: String,
    pub original_routing_key: String,
    pub failure_reason: String,
    pub attempts: u32,
    /// Raw payload of the failed delivery
    pub payload: Vec<u8>,
    /// Unix timestamp
    pub dead_lettered_at: i64,
}

/// Final state of a processed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        attempts: u32,
    },
    DeadLettered {
        attempts: u32,
        classification: Classification,
    },
}

pub struct RetryPipeline {
    classifier: ErrorClassifier,
    backoff: BackoffPolicy,
    /// Retries after the initial attempt
    max_attempts: u32,
    broker: Broker,
    dead_letter_exchange: String,
    dead_letter_routing_key: String,
}

impl RetryPipeline {
    pub fn new(
        config: &RetryConfig,
        broker: Broker,
        dead_letter_exchange: &str,
        dead_letter_routing_key: &str,
    ) -> Self {
        Self {
            classifier: ErrorClassifier::from_config(config),
            backoff: BackoffPolicy::from_config(config),
            max_attempts: config.max_attempts,
            broker,
            dead_letter_exchange: dead_letter_exchange.to_string(),
            dead_letter_routing_key: dead_letter_routing_key.to_string(),
        }
    }

    /// Drive one delivery to a terminal state.
    ///
    /// The handler is invoked once, then up to `max_attempts` more times for
    /// transient failures with backoff in between. The backoff sleep
    /// suspends only the calling worker task.
    pub async fn process<F, Fut>(&self, delivery: &Delivery, mut handler: F) -> Outcome
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = Result<(), ProcessingError>>,
    {
        let mut retries: u32 = 0;

        loop {
            let attempt = retries + 1;
            match handler(delivery.clone()).await {
                Ok(()) => {
                    if retries > 0 {
                        tracing::info!(
                            message_id = %delivery.correlation_id,
                            attempt = attempt,
                            "Delivery handled after retry"
                        );
                    }
                    return Outcome::Success { attempts: attempt };
                }
                Err(error) => {
                    let classification = self.classifier.classify(&error);
                    match classification {
                        Classification::Fatal => {
                            tracing::warn!(
                                message_id = %delivery.correlation_id,
                                error = %error,
                                "Fatal processing error, skipping retry"
                            );
                            self.dead_letter(delivery, &error, attempt).await;
                            return Outcome::DeadLettered {
                                attempts: attempt,
                                classification,
                            };
                        }
                        Classification::Transient if retries >= self.max_attempts => {
                            tracing::warn!(
                                message_id = %delivery.correlation_id,
                                attempts = attempt,
                                error = %error,
                                "Retries exhausted"
                            );
                            self.dead_letter(delivery, &error, attempt).await;
                            return Outcome::DeadLettered {
                                attempts: attempt,
                                classification,
                            };
                        }
                        Classification::Transient => {
                            let delay = self.backoff.delay(retries);
                            metrics::DELIVERY_RETRIES_TOTAL.inc();
                            tracing::warn!(
                                message_id = %delivery.correlation_id,
                                attempt = attempt,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %error,
                                "Delivery failed, will retry"
                            );
                            tokio::time::sleep(delay).await;
                            retries += 1;
                        }
                    }
                }
            }
        }
    }

    /// Republish the failed delivery to the dead-letter exchange, keyed by
    /// the original message id. Best-effort: a failure here is logged and
    /// the message is lost only in this doubly-failing case.
    async fn dead_letter(&self, delivery: &Delivery, error: &ProcessingError, attempts: u32) {
        tracing::error!(
            message_id = %delivery.correlation_id,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            attempts = attempts,
            cause = %error,
            "Dead-lettering message"
        );

        let record = DeadLetterRecord {
            message_id: delivery.correlation_id.clone(),
            original_exchange: delivery.exchange.clone(),
            original_routing_key: delivery.routing_key.clone(),
            failure_reason: error.to_string(),
            attempts,
            payload: delivery.payload.clone(),
            dead_lettered_at: chrono::Utc::now().timestamp(),
        };

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    message_id = %delivery.correlation_id,
                    error = %e,
                    "Failed to serialize dead-letter record"
                );
                return;
            }
        };

        let publication = Publication {
            exchange: self.dead_letter_exchange.clone(),
            routing_key: self.dead_letter_routing_key.clone(),
            correlation_id: delivery.correlation_id.clone(),
            payload,
            delivery_mode: DeliveryMode::Persistent,
            mandatory: false,
        };

        match self.broker.publish(publication).await {
            Ok(()) => {
                metrics::DEAD_LETTERED_TOTAL.inc();
                tracing::info!(
                    message_id = %delivery.correlation_id,
                    "Message sent to dead-letter exchange"
                );
            }
            Err(e) => {
                tracing::error!(
                    message_id = %delivery.correlation_id,
                    error = %e,
                    "Failed to publish to dead-letter exchange"
                );
            }
        }
    }
}
