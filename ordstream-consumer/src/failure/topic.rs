use super::log::FailureStateLog;
use super::state::StreamState;
use crate::error::ConsumerResult as Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 失败状态的写穿缓存：内存索引同步更新，随后写入日志；启动时由日志重放重建
pub struct FailureStateTopic {
    log: Arc<dyn FailureStateLog>,
    index: RwLock<StreamIndex>,
}

/// stream id → 槽位；槽位顺序在一次运行内确定
#[derive(Default)]
struct StreamIndex {
    slots: Vec<StreamState>,
    positions: HashMap<String, usize>,
}

impl StreamIndex {
    fn get(&self, stream_id: &str) -> Option<&StreamState> {
        self.positions.get(stream_id).map(|&i| &self.slots[i])
    }

    fn upsert(&mut self, state: StreamState) {
        if state.is_empty() {
            self.remove(&state.stream_id);
            return;
        }
        match self.positions.get(&state.stream_id) {
            Some(&i) => self.slots[i] = state,
            None => {
                self.positions.insert(state.stream_id.clone(), self.slots.len());
                self.slots.push(state);
            }
        }
    }

    fn remove(&mut self, stream_id: &str) {
        let Some(i) = self.positions.remove(stream_id) else {
            return;
        };
        self.slots.swap_remove(i);
        if let Some(moved) = self.slots.get(i) {
            self.positions.insert(moved.stream_id.clone(), i);
        }
    }
}

impl FailureStateTopic {
    pub fn new(log: Arc<dyn FailureStateLog>) -> Self {
        Self {
            log,
            index: RwLock::new(StreamIndex::default()),
        }
    }

    /// 将日志中新增的条目并入索引
    pub async fn initialize(&self) -> Result<()> {
        let entries = self.log.replay_to_head().await?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut index = self.index.write().await;
        for entry in entries {
            index.upsert(entry);
        }
        Ok(())
    }

    pub async fn streams(&self) -> Vec<StreamState> {
        self.index.read().await.slots.clone()
    }

    pub async fn find_stream(&self, stream_id: &str) -> Option<StreamState> {
        self.index.read().await.get(stream_id).cloned()
    }

    pub async fn find_streams<'a>(
        &self,
        stream_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<StreamState> {
        let index = self.index.read().await;
        stream_ids
            .into_iter()
            .filter_map(|id| index.get(id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn publish(&self, state: StreamState) -> Result<()> {
        self.index.write().await.upsert(state.clone());
        self.log.publish(&state).await
    }

    pub async fn close(&self) -> Result<()> {
        self.log.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::state::TopicState;
    use async_trait::async_trait;
    use chrono::Utc;
    use ordstream_broker::message::Message;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecLog {
        entries: Mutex<Vec<StreamState>>,
        cursor: Mutex<usize>,
    }

    #[async_trait]
    impl FailureStateLog for VecLog {
        async fn publish(&self, state: &StreamState) -> Result<()> {
            self.entries.lock().unwrap().push(state.clone());
            Ok(())
        }

        async fn replay_to_head(&self) -> Result<Vec<StreamState>> {
            let entries = self.entries.lock().unwrap();
            let mut cursor = self.cursor.lock().unwrap();
            let fresh = entries[*cursor..].to_vec();
            *cursor = entries.len();
            Ok(fresh)
        }
    }

    fn stream(id: &str) -> StreamState {
        let message = Message::builder()
            .topic("orders")
            .key(id)
            .sequence_id(1)
            .publish_time(Utc::now())
            .payload(json!({}))
            .build();
        let mut state = StreamState::new(id);
        state
            .topics
            .insert("orders".into(), TopicState::new(&message));
        state
    }

    #[tokio::test]
    async fn tombstone_removes_and_keeps_index_consistent() {
        let topic = FailureStateTopic::new(Arc::new(VecLog::default()));
        for id in ["a", "b", "c"] {
            topic.publish(stream(id)).await.unwrap();
        }
        topic.publish(StreamState::new("a")).await.unwrap();

        assert_eq!(topic.len().await, 2);
        assert!(topic.find_stream("a").await.is_none());
        assert!(topic.find_stream("b").await.is_some());
        assert!(topic.find_stream("c").await.is_some());
        assert_eq!(topic.find_streams(["b", "x", "c"]).await.len(), 2);
    }

    #[tokio::test]
    async fn initialize_rebuilds_from_log() {
        let log = Arc::new(VecLog::default());
        let writer = FailureStateTopic::new(log.clone());
        writer.publish(stream("a")).await.unwrap();
        writer.publish(stream("b")).await.unwrap();
        writer.publish(StreamState::new("b")).await.unwrap();

        let fresh = FailureStateTopic::new(log);
        fresh.initialize().await.unwrap();
        let ids: Vec<String> = fresh.streams().await.into_iter().map(|s| s.stream_id).collect();
        assert_eq!(ids, vec!["a".to_string()]);

        fresh.initialize().await.unwrap();
        assert_eq!(fresh.len().await, 1);
    }
}
