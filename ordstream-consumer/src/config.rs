//! 订阅配置（SubscriptionConfig）
//!
//! 一份配置同时驱动主订阅、失败重放与哈希区间刷新。
//!
use crate::error::{ConsumerError, ConsumerResult as Result};
use crate::retry_schedule::RetrySchedule;
use bon::Builder;
use chrono::{DateTime, Utc};
use ordstream_broker::message::Position;
use std::time::Duration;

/// 死信策略：重放仍失败达到 `max_retries` 次后，将消息转入死信 topic 并放行该 key
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct DeadLetterPolicy {
    #[builder(into)]
    pub topic: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Builder)]
pub struct SubscriptionConfig {
    pub topics: Vec<String>,
    #[builder(into)]
    pub subscription_name: String,
    #[builder(into, default = format!("ordstream-{}", uuid::Uuid::new_v4()))]
    pub consumer_name: String,
    #[builder(default = 100)]
    pub batch_size: usize,
    /// 主订阅单次批量接收的等待时间
    #[builder(default = Duration::from_secs(1))]
    pub receive_timeout: Duration,
    /// 主订阅无消息时的暂停
    #[builder(default = Duration::from_millis(200))]
    pub no_batch_delay: Duration,
    /// 新订阅从最早位置开始（否则从最新位置）
    #[builder(default = true)]
    pub is_beginning: bool,
    /// 新订阅从该发布时间开始，优先于 `is_beginning`
    pub start_date_time: Option<DateTime<Utc>>,
    pub retry_backoff_policy: Option<Vec<Duration>>,
    #[builder(default = Duration::from_secs(60))]
    pub key_hash_refresh_interval: Duration,
    /// 首次查询哈希区间前的等待，让 broker 完成分配
    #[builder(default = Duration::from_secs(1))]
    pub assignment_settle_delay: Duration,
    /// 单次位点读取的等待时间
    #[builder(default = Duration::from_millis(100))]
    pub replay_read_timeout: Duration,
    #[builder(into)]
    pub failure_state_topic: Option<String>,
    pub dead_letter: Option<DeadLetterPolicy>,
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(ConsumerError::invalid_config("at least one topic is required"));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConsumerError::invalid_config("topic names must not be empty"));
        }
        if self.subscription_name.trim().is_empty() {
            return Err(ConsumerError::invalid_config(
                "subscription name must not be empty",
            ));
        }
        if self.consumer_name.trim().is_empty() {
            return Err(ConsumerError::invalid_config("consumer name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(ConsumerError::invalid_config("batch size must be positive"));
        }
        if let Some(dead_letter) = &self.dead_letter
            && (dead_letter.topic.trim().is_empty() || self.topics.contains(&dead_letter.topic))
        {
            return Err(ConsumerError::invalid_config(format!(
                "dead-letter topic {:?} must be non-empty and distinct from consumed topics",
                dead_letter.topic
            )));
        }
        Ok(())
    }

    /// 主 topic：用于查询哈希区间与派生默认失败状态 topic
    pub fn primary_topic(&self) -> &str {
        self.topics.first().map(String::as_str).unwrap_or_default()
    }

    pub fn failure_state_topic_name(&self) -> String {
        match &self.failure_state_topic {
            Some(topic) => topic.clone(),
            None => format!(
                "{}-{}-failure-state",
                self.primary_topic(),
                self.subscription_name
            ),
        }
    }

    pub fn initial_position(&self) -> Position {
        match self.start_date_time {
            Some(at) => Position::PublishedAt(at),
            None if self.is_beginning => Position::Earliest,
            None => Position::Latest,
        }
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::from(self.retry_backoff_policy.clone())
    }
}
