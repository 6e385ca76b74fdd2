//! 内存版 broker（InMemoryBroker）
//!
//! 进程内实现全部 broker 协议，语义贴近 key-shared 订阅：
//! - 每个 topic 是仅追加日志，序列号从 1 开始；
//! - 订阅游标记录确认水位与逐条确认，否认确认的消息在延迟后重投，
//!   期间同 key 的后续消息照常投递（即不保证重投后的 key 内顺序）；
//! - key-shared 订阅按消费者注册顺序均分哈希空间；
//! - 读取器独立于订阅，可任意定位。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
mod consumer;
mod cursor;
mod publisher;
mod reader;
mod topic_log;

pub use consumer::InMemoryConsumer;
pub use publisher::InMemoryPublisher;
pub use reader::InMemoryReader;

use crate::broker::{
    BrokerClient, KeyHashRangeProvider, ReaderOptions, SubscribeOptions, TopicAdmin,
    TopicConsumer, TopicPublisher, TopicReader,
};
use crate::error::{BrokerError, BrokerResult as Result};
use crate::key_hash::KeyHashRanges;
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use bon::Builder;
use consumer::TopicBinding;
use cursor::SubscriptionCursor;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use topic_log::TopicLog;

/// 内存 broker 配置
#[derive(Debug, Clone, Builder)]
pub struct InMemoryBrokerConfig {
    /// 否认确认后重新投递前的等待时间
    #[builder(default = Duration::from_secs(1))]
    pub nack_redelivery_delay: Duration,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub(crate) struct BrokerState {
    config: InMemoryBrokerConfig,
    topics: DashMap<String, Arc<TopicLog>>,
    cursors: DashMap<(String, String), Arc<SubscriptionCursor>>,
    /// 发布、否认确认与关闭时唤醒等待中的接收方
    activity: Notify,
}

impl BrokerState {
    fn topic(&self, name: &str) -> Arc<TopicLog> {
        let entry = self
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(name)));
        Arc::clone(entry.value())
    }

    fn cursor(&self, topic: &str, subscription: &str) -> Option<Arc<SubscriptionCursor>> {
        self.cursors
            .get(&(topic.to_string(), subscription.to_string()))
            .map(|c| Arc::clone(c.value()))
    }

    pub(crate) async fn publish(&self, topic: &str, key: &str, payload: Value) -> MessageId {
        let log = self.topic(topic);
        let id = log.append(key, payload).await;
        self.activity.notify_waiters();
        id
    }
}

/// 进程内 broker，克隆后共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(BrokerState {
                config,
                topics: DashMap::new(),
                cursors: DashMap::new(),
                activity: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &InMemoryBrokerConfig {
        &self.state.config
    }

    /// 直接发布一条消息（topic 不存在时自动创建）
    pub async fn publish(&self, topic: &str, key: &str, payload: Value) -> MessageId {
        self.state.publish(topic, key, payload).await
    }

    /// topic 中的全部消息（按序列号）
    pub async fn messages(&self, topic: &str) -> Vec<Message> {
        let log = self.state.topics.get(topic).map(|l| Arc::clone(l.value()));
        match log {
            Some(log) => log.snapshot().await,
            None => Vec::new(),
        }
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.topics.contains_key(topic)
    }

    /// 订阅在某 topic 上的确认水位（该序列号及之前均已确认）
    pub async fn acknowledged_up_to(&self, topic: &str, subscription: &str) -> Option<i64> {
        match self.state.cursor(topic, subscription) {
            Some(cursor) => Some(cursor.mark_delete().await),
            None => None,
        }
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn ensure_topic_exists(&self, topic: &str) -> Result<()> {
        self.state.topic(topic);
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.state.topics.remove(topic);
        self.state.cursors.retain(|(t, _), _| t != topic);
        self.state.activity.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn TopicConsumer>> {
        if options.topics.is_empty() {
            return Err(BrokerError::broker(format!(
                "subscription {} names no topics",
                options.subscription_name
            )));
        }

        let mut bindings = Vec::with_capacity(options.topics.len());
        for topic in &options.topics {
            let log = self.state.topic(topic);
            let start = log.resolve(options.initial_position).await?;
            let cursor = {
                let entry = self
                    .state
                    .cursors
                    .entry((topic.clone(), options.subscription_name.clone()))
                    .or_insert_with(|| {
                        Arc::new(SubscriptionCursor::new(
                            topic,
                            &options.subscription_name,
                            options.subscription_type,
                            start,
                        ))
                    });
                Arc::clone(entry.value())
            };
            cursor.register(&options.consumer_name).await?;
            bindings.push(TopicBinding { log, cursor });
        }

        tracing::debug!(
            topics = ?options.topics,
            subscription = %options.subscription_name,
            consumer = %options.consumer_name,
            "in-memory subscription attached"
        );

        Ok(Box::new(InMemoryConsumer::new(
            Arc::clone(&self.state),
            options.consumer_name,
            options.subscription_name,
            bindings,
            options.max_batch_size,
        )))
    }

    async fn create_reader(&self, options: ReaderOptions) -> Result<Box<dyn TopicReader>> {
        let log = self.state.topic(&options.topic);
        let position = log.resolve(options.start).await?;
        Ok(Box::new(InMemoryReader::new(
            Arc::clone(&self.state),
            log,
            options.reader_name,
            position,
            options.key_hash_ranges,
        )))
    }

    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn TopicPublisher>> {
        self.state.topic(topic);
        Ok(Box::new(InMemoryPublisher::new(
            Arc::clone(&self.state),
            topic.to_string(),
        )))
    }
}

#[async_trait]
impl KeyHashRangeProvider for InMemoryBroker {
    async fn owned_ranges(
        &self,
        topic: &str,
        subscription_name: &str,
        consumer_name: &str,
    ) -> Result<KeyHashRanges> {
        let cursor = self.state.cursor(topic, subscription_name).ok_or_else(|| {
            BrokerError::SubscriptionNotFound {
                topic: topic.to_string(),
                subscription: subscription_name.to_string(),
            }
        })?;
        Ok(cursor.owned_ranges(consumer_name).await)
    }
}
