use chrono::{DateTime, Utc};
use ordstream_broker::message::{Message, MessageId};
use serde_json::Value;

/// 批次来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    /// 主订阅正常投递
    Primary,
    /// 失败 key 的位点重放
    Replay,
}

/// 交付给处理器的消息及其来源
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    message: Message,
    source: DeliverySource,
}

impl MessageContext {
    pub fn new(message: Message, source: DeliverySource) -> Self {
        Self { message, source }
    }

    pub fn primary(message: Message) -> Self {
        Self::new(message, DeliverySource::Primary)
    }

    pub fn replay(message: Message) -> Self {
        Self::new(message, DeliverySource::Replay)
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn source(&self) -> DeliverySource {
        self.source
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    /// 消息 key 即 stream id
    pub fn stream_id(&self) -> &str {
        self.message.key()
    }

    pub fn sequence_id(&self) -> i64 {
        self.message.sequence_id()
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        self.message.publish_time()
    }

    pub fn payload(&self) -> &Value {
        self.message.payload()
    }

    pub fn message_id(&self) -> MessageId {
        self.message.id()
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}
