use crate::failure::TopicStream;
use dashmap::DashMap;
use std::sync::Arc;

/// 重放水位：某 (topic, key) 已由重放投递到的最大序列号
///
/// 主订阅可能落后于重放；水位之下的消息在主路径上直接丢弃，
/// 首条更新的消息到达后水位即失效。
#[derive(Debug, Clone, Default)]
pub struct ReplayWatermarks {
    inner: Arc<DashMap<TopicStream, i64>>,
}

impl ReplayWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: TopicStream, sequence_id: i64) {
        self.inner
            .entry(key)
            .and_modify(|seq| *seq = (*seq).max(sequence_id))
            .or_insert(sequence_id);
    }

    pub fn get(&self, key: &TopicStream) -> Option<i64> {
        self.inner.get(key).map(|seq| *seq)
    }

    /// 该消息是否已被重放投递过
    pub fn covers(&self, key: &TopicStream, sequence_id: i64) -> bool {
        match self.get(key) {
            Some(watermark) if sequence_id <= watermark => true,
            Some(_) => {
                self.inner.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
