use chrono::{DateTime, Utc};
use ordstream_broker::message::{Message, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// (topic, stream id) 对
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicStream {
    pub topic: String,
    pub stream_id: String,
}

impl TopicStream {
    pub fn new(topic: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            stream_id: stream_id.into(),
        }
    }

    pub fn of(message: &Message) -> Self {
        Self::new(message.topic(), message.key())
    }
}

impl fmt::Display for TopicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.stream_id)
    }
}

/// 某个 key 在某个 topic 上的失败状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicState {
    pub topic_name: String,
    pub last_sequence_id: i64,
    pub last_message_publish_time: DateTime<Utc>,
    /// 自上次成功以来的连续失败次数（首次失败为 0）
    #[serde(default)]
    pub times_retried: u32,
    /// 非空表示存在未解决的失败
    #[serde(default)]
    pub next_retry: Option<DateTime<Utc>>,
    /// 重放已追上 topic 末尾
    #[serde(default)]
    pub is_up_to_date: bool,
}

impl TopicState {
    pub fn new(message: &Message) -> Self {
        Self {
            topic_name: message.topic().to_string(),
            last_sequence_id: message.sequence_id(),
            last_message_publish_time: message.publish_time(),
            times_retried: 0,
            next_retry: None,
            is_up_to_date: false,
        }
    }

    /// 记录观察到的消息位置
    pub fn observe(&mut self, message: &Message) {
        self.last_sequence_id = message.sequence_id();
        self.last_message_publish_time = message.publish_time();
    }

    pub fn has_pending_failure(&self) -> bool {
        self.next_retry.is_some()
    }

    /// 可进入重放：尚未追上末尾，且没有未到期的重试
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_up_to_date && self.next_retry.is_none_or(|at| now >= at)
    }

    /// 重放起点：最后观察到的消息失败时从它开始，否则从它之后开始
    pub fn replay_position(&self) -> Position {
        if self.has_pending_failure() {
            Position::From(self.last_sequence_id)
        } else {
            Position::After(self.last_sequence_id)
        }
    }
}

/// 某个 key 的全部失败状态；`topics` 为空时即墓碑
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_id: String,
    #[serde(default)]
    pub topics: BTreeMap<String, TopicState>,
}

impl StreamState {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            topics: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topic(&self, topic: &str) -> Option<&TopicState> {
        self.topics.get(topic)
    }

    /// 仅保留到期的 topic；没有到期 topic 时返回 `None`
    pub fn due_topics(&self, now: DateTime<Utc>) -> Option<StreamState> {
        let topics: BTreeMap<String, TopicState> = self
            .topics
            .iter()
            .filter(|(_, state)| state.is_due(now))
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();

        if topics.is_empty() {
            return None;
        }
        Some(StreamState {
            stream_id: self.stream_id.clone(),
            topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn message(seq: i64) -> Message {
        Message::builder()
            .topic("orders")
            .key("acct-1")
            .sequence_id(seq)
            .publish_time(Utc::now())
            .payload(json!({}))
            .build()
    }

    #[test]
    fn due_and_replay_position() {
        let now = Utc::now();
        let mut state = TopicState::new(&message(3));
        assert!(state.is_due(now));
        assert_eq!(state.replay_position(), Position::After(3));

        state.next_retry = Some(now + Duration::seconds(5));
        assert!(!state.is_due(now));
        assert!(state.is_due(now + Duration::seconds(5)));
        assert_eq!(state.replay_position(), Position::From(3));

        state.next_retry = None;
        state.is_up_to_date = true;
        assert!(!state.is_due(now));
    }

    #[test]
    fn due_topics_filters_and_drops_empty() {
        let now = Utc::now();
        let mut stream = StreamState::new("acct-1");
        let mut later = TopicState::new(&message(1));
        later.next_retry = Some(now + Duration::minutes(1));
        stream.topics.insert("orders".into(), later);
        assert!(stream.due_topics(now).is_none());

        let mut due = TopicState::new(&message(2));
        due.topic_name = "payments".into();
        stream.topics.insert("payments".into(), due);
        let filtered = stream.due_topics(now).unwrap();
        assert_eq!(filtered.topics.len(), 1);
        assert!(filtered.topic("payments").is_some());
    }

    #[test]
    fn missing_flags_deserialize_with_defaults() {
        let raw = json!({
            "stream_id": "acct-1",
            "topics": {
                "orders": {
                    "topic_name": "orders",
                    "last_sequence_id": 4,
                    "last_message_publish_time": "2024-01-01T00:00:00Z"
                }
            }
        });
        let state: StreamState = serde_json::from_value(raw).unwrap();
        let topic = state.topic("orders").unwrap();
        assert_eq!(topic.times_retried, 0);
        assert!(topic.next_retry.is_none());
        assert!(!topic.is_up_to_date);

        let tombstone: StreamState = serde_json::from_value(json!({"stream_id": "acct-1"})).unwrap();
        assert!(tombstone.is_empty());
    }
}
