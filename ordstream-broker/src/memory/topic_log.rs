use crate::error::{BrokerError, BrokerResult as Result};
use crate::message::{Message, MessageId, Position};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

/// 仅追加的 topic 日志，序列号从 1 开始连续分配
pub(crate) struct TopicLog {
    name: String,
    messages: RwLock<Vec<Message>>,
}

impl TopicLog {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn append(&self, key: &str, payload: Value) -> MessageId {
        let mut messages = self.messages.write().await;
        let sequence_id = messages.len() as i64 + 1;
        messages.push(
            Message::builder()
                .topic(self.name.as_str())
                .key(key)
                .sequence_id(sequence_id)
                .publish_time(Utc::now())
                .payload(payload)
                .build(),
        );
        MessageId::new(self.name.as_str(), sequence_id)
    }

    /// 最后一条消息的序列号（空 topic 为 0）
    pub(crate) async fn head(&self) -> i64 {
        self.messages.read().await.len() as i64
    }

    pub(crate) async fn get(&self, sequence_id: i64) -> Option<Message> {
        if sequence_id < 1 {
            return None;
        }
        self.messages
            .read()
            .await
            .get((sequence_id - 1) as usize)
            .cloned()
    }

    pub(crate) async fn snapshot(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    /// 遍历尚未被越过的消息（序列号 > `after`）
    pub(crate) async fn scan_after<F>(&self, after: i64, mut f: F)
    where
        F: FnMut(&Message) -> bool,
    {
        let messages = self.messages.read().await;
        for message in messages.iter().skip(after.max(0) as usize) {
            if !f(message) {
                break;
            }
        }
    }

    /// 将位置换算为“已越过的最后序列号”
    pub(crate) async fn resolve(&self, position: Position) -> Result<i64> {
        match position {
            Position::Earliest => Ok(0),
            Position::Latest => Ok(self.head().await),
            Position::After(seq) if seq < 0 => Err(BrokerError::InvalidPosition {
                reason: format!("negative sequence id {seq}"),
            }),
            Position::After(seq) => Ok(seq),
            Position::From(seq) if seq < 1 => Err(BrokerError::InvalidPosition {
                reason: format!("sequence ids start at 1, got {seq}"),
            }),
            Position::From(seq) => Ok(seq - 1),
            Position::PublishedAt(at) => {
                let messages = self.messages.read().await;
                Ok(messages
                    .iter()
                    .take_while(|m| m.publish_time() < at)
                    .count() as i64)
            }
        }
    }
}
