use crate::broker::{Broker, BrokerEvents, Publication};
use crate::error::GatewayResult;
use crate::message::Envelope;
use crate::metrics;

/// At-least-once send path into the broker.
///
/// Every publish is mandatory (must be routable) and carries the message id
/// as its correlation id. Confirms and returns arrive asynchronously and are
/// handled by the listener tasks; the caller returns to serving frames as
/// soon as the broker accepted the publish.
pub struct Publisher {
    broker: Broker,
    exchange: String,
}

impl Publisher {
    pub fn new(broker: Broker, exchange: &str) -> Self {
        Self {
            broker,
            exchange: exchange.to_string(),
        }
    }

    pub async fn publish(&self, envelope: &Envelope) -> GatewayResult<()> {
        if let Err(reason) = envelope.validate() {
            return Err(crate::error::GatewayError::validation(reason));
        }

        let payload = serde_json::to_vec(envelope)?;

        self.broker
            .publish(Publication {
                exchange: self.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
                correlation_id: envelope.message_id.clone(),
                payload,
                delivery_mode: envelope.delivery_mode,
                mandatory: true,
            })
            .await?;

        metrics::MESSAGES_PUBLISHED_TOTAL.inc();
        tracing::debug!(
            message_id = %envelope.message_id,
            routing_key = %envelope.routing_key,
            "Message handed to broker"
        );
        Ok(())
    }

    /// Spawn the confirm/return listener tasks.
    ///
    /// Confirms log at debug (ack) or error (nack, with cause). Returns mean
    /// a routing-configuration defect: logged at error with exchange,
    /// routing key and reason, counted for alerting, never retried.
    pub fn spawn_outcome_listeners(events: BrokerEvents) {
        let BrokerEvents {
            mut confirms,
            mut returns,
        } = events;

        tokio::spawn(async move {
            while let Some(confirm) = confirms.recv().await {
                if confirm.ack {
                    metrics::PUBLISH_CONFIRMED_TOTAL.inc();
                    tracing::debug!(
                        correlation_id = %confirm.correlation_id,
                        "Publish confirmed"
                    );
                } else {
                    metrics::PUBLISH_REJECTED_TOTAL.inc();
                    tracing::error!(
                        correlation_id = %confirm.correlation_id,
                        cause = %confirm.cause.unwrap_or_else(|| "unknown".to_string()),
                        "Publish rejected by broker"
                    );
                }
            }
        });

        tokio::spawn(async move {
            while let Some(returned) = returns.recv().await {
                metrics::PUBLISH_RETURNED_TOTAL.inc();
                tracing::error!(
                    exchange = %returned.exchange,
                    routing_key = %returned.routing_key,
                    reply_text = %returned.reply_text,
                    correlation_id = %returned.correlation_id,
                    "Message returned: no queue bound for routing key"
                );
            }
        });
    }
}
