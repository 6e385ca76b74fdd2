//! 消息模型（Message）
//!
//! 定义 broker 传递的标准消息形态、消息位点（topic + 序列号）
//! 以及读取器可定位的位置。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 消息位点：topic 内单调递增的序列号
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    topic: String,
    sequence_id: i64,
}

impl MessageId {
    pub fn new(topic: impl Into<String>, sequence_id: i64) -> Self {
        Self {
            topic: topic.into(),
            sequence_id,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sequence_id(&self) -> i64 {
        self.sequence_id
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.sequence_id)
    }
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct Message {
    /// 所属 topic
    #[builder(into)]
    topic: String,
    /// 分区/排序 key（即 stream id）
    #[builder(into)]
    key: String,
    /// topic 内序列号，由 broker 在写入时分配
    sequence_id: i64,
    /// broker 记录的发布时间
    publish_time: DateTime<Utc>,
    /// 消息负载
    payload: Value,
    /// 附加属性
    #[builder(default)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
}

impl Message {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sequence_id(&self) -> i64 {
        self.sequence_id
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        self.publish_time
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn id(&self) -> MessageId {
        MessageId::new(self.topic.clone(), self.sequence_id)
    }
}

/// 读取器/订阅可定位的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// topic 起点
    Earliest,
    /// 当前末尾（仅读取之后写入的消息）
    Latest,
    /// 严格位于该序列号之后
    After(i64),
    /// 从该序列号开始（包含）
    From(i64),
    /// 第一条发布时间不早于给定时间的消息
    PublishedAt(DateTime<Utc>),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Earliest => write!(f, "earliest"),
            Position::Latest => write!(f, "latest"),
            Position::After(seq) => write!(f, "after({seq})"),
            Position::From(seq) => write!(f, "from({seq})"),
            Position::PublishedAt(at) => write!(f, "published_at({})", at.to_rfc3339()),
        }
    }
}
