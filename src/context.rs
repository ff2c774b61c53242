use std::sync::Arc;

use crate::authorizer::FrameAuthorizer;
use crate::broker::Broker;
use crate::config::Config;
use crate::publisher::Publisher;
use crate::registry::SessionRegistry;

/// Application context containing shared dependencies.
/// Cloned into every connection task and consumer worker.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub authorizer: Arc<FrameAuthorizer>,
    pub publisher: Arc<Publisher>,
    pub broker: Broker,
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        authorizer: Arc<FrameAuthorizer>,
        publisher: Arc<Publisher>,
        broker: Broker,
    ) -> Self {
        Self {
            config,
            registry,
            authorizer,
            publisher,
            broker,
        }
    }
}
