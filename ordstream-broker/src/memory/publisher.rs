use super::BrokerState;
use crate::broker::TopicPublisher;
use crate::error::BrokerResult as Result;
use crate::message::MessageId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// 内存版发布者
pub struct InMemoryPublisher {
    state: Arc<BrokerState>,
    topic: String,
}

impl InMemoryPublisher {
    pub(crate) fn new(state: Arc<BrokerState>, topic: String) -> Self {
        Self { state, topic }
    }
}

#[async_trait]
impl TopicPublisher for InMemoryPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, key: &str, payload: Value) -> Result<MessageId> {
        Ok(self.state.publish(&self.topic, key, payload).await)
    }
}
