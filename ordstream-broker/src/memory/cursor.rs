use super::topic_log::TopicLog;
use crate::broker::SubscriptionType;
use crate::error::{BrokerError, BrokerResult as Result};
use crate::key_hash::{KeyHashRange, KeyHashRanges};
use crate::message::Message;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 单个 topic 上某订阅的游标：确认水位、逐条确认、在途与延迟重投
pub(crate) struct SubscriptionCursor {
    topic: String,
    subscription: String,
    subscription_type: SubscriptionType,
    state: Mutex<CursorState>,
}

#[derive(Default)]
struct CursorState {
    /// 注册顺序决定哈希区间分配
    consumers: Vec<String>,
    /// 序列号 <= mark_delete 的消息均已确认
    mark_delete: i64,
    acked: BTreeSet<i64>,
    pending: HashMap<i64, String>,
    delayed: HashMap<i64, Instant>,
}

impl CursorState {
    fn ranges_for(&self, consumer: &str, subscription_type: SubscriptionType) -> KeyHashRanges {
        let Some(index) = self.consumers.iter().position(|c| c == consumer) else {
            return KeyHashRanges::default();
        };

        match subscription_type {
            SubscriptionType::Exclusive => KeyHashRanges::full(),
            SubscriptionType::KeyShared => {
                let ranges = KeyHashRange::split_evenly(self.consumers.len());
                KeyHashRanges::new(ranges.get(index).copied())
            }
        }
    }
}

impl SubscriptionCursor {
    pub(crate) fn new(
        topic: &str,
        subscription: &str,
        subscription_type: SubscriptionType,
        mark_delete: i64,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            subscription_type,
            state: Mutex::new(CursorState {
                mark_delete,
                ..Default::default()
            }),
        }
    }

    pub(crate) async fn register(&self, consumer: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.consumers.iter().any(|c| c == consumer) {
            return Ok(());
        }
        if self.subscription_type == SubscriptionType::Exclusive && !state.consumers.is_empty() {
            return Err(BrokerError::broker(format!(
                "exclusive subscription {} on {} already has a consumer",
                self.subscription, self.topic
            )));
        }
        state.consumers.push(consumer.to_string());
        Ok(())
    }

    /// 注销消费者，并释放其在途消息供其他消费者接收
    pub(crate) async fn unregister(&self, consumer: &str) {
        let mut state = self.state.lock().await;
        state.consumers.retain(|c| c != consumer);
        state.pending.retain(|_, owner| owner != consumer);
    }

    pub(crate) async fn owned_ranges(&self, consumer: &str) -> KeyHashRanges {
        self.state
            .lock()
            .await
            .ranges_for(consumer, self.subscription_type)
    }

    /// 为消费者挑选可投递的消息并标记为在途
    pub(crate) async fn dispatch(&self, log: &TopicLog, consumer: &str, max: usize) -> Vec<Message> {
        let mut state = self.state.lock().await;
        let ranges = state.ranges_for(consumer, self.subscription_type);
        if ranges.is_empty() || max == 0 {
            return Vec::new();
        }

        let now = Instant::now();
        state.delayed.retain(|_, at| *at > now);

        let mut out: Vec<Message> = Vec::new();
        log.scan_after(state.mark_delete, |message| {
            let seq = message.sequence_id();
            let available = !state.acked.contains(&seq)
                && !state.pending.contains_key(&seq)
                && !state.delayed.contains_key(&seq);
            if available && ranges.contains_key(message.key()) {
                out.push(message.clone());
            }
            out.len() < max
        })
        .await;

        for message in &out {
            state
                .pending
                .insert(message.sequence_id(), consumer.to_string());
        }
        out
    }

    pub(crate) async fn next_redelivery(&self) -> Option<Instant> {
        self.state.lock().await.delayed.values().min().copied()
    }

    pub(crate) async fn acknowledge(&self, sequence_id: i64, head: i64) -> Result<()> {
        if sequence_id < 1 || sequence_id > head {
            return Err(BrokerError::UnknownMessage {
                topic: self.topic.clone(),
                sequence_id,
            });
        }

        let mut state = self.state.lock().await;
        state.pending.remove(&sequence_id);
        state.delayed.remove(&sequence_id);
        if sequence_id <= state.mark_delete {
            return Ok(());
        }

        state.acked.insert(sequence_id);
        loop {
            let next = state.mark_delete + 1;
            if !state.acked.remove(&next) {
                break;
            }
            state.mark_delete = next;
        }
        Ok(())
    }

    /// 否认确认：消息在 `delay` 后重新可投递（此时同 key 的后续消息可能已被投递）
    pub(crate) async fn negative_acknowledge(&self, sequence_id: i64, delay: Duration) {
        let mut state = self.state.lock().await;
        if state.pending.remove(&sequence_id).is_some() {
            state.delayed.insert(sequence_id, Instant::now() + delay);
        }
    }

    pub(crate) async fn mark_delete(&self) -> i64 {
        self.state.lock().await.mark_delete
    }
}
