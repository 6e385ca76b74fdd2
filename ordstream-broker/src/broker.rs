//! broker 协议（Broker）
//!
//! 定义有序消费子系统依赖的全部 broker 能力：
//! - `TopicAdmin`：topic 的创建与删除；
//! - `TopicConsumer`：订阅消费，批量接收、确认与否认；
//! - `TopicReader`：按位置定位的直接读取，不经过订阅重投；
//! - `TopicPublisher`：按 key 发布消息；
//! - `BrokerClient`：上述消费者/读取器/发布者的工厂；
//! - `KeyHashRangeProvider`：查询某消费者在 key-shared 订阅中拥有的哈希区间。
//!
//! 超时不视为错误：`batch_receive` 返回空批次，`read_next` 返回 `None`。
//!
use crate::{
    error::BrokerResult as Result,
    key_hash::KeyHashRanges,
    message::{Message, MessageId, Position},
};
use async_trait::async_trait;
use bon::Builder;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// 订阅类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    /// 按 key 哈希区间在多个消费者间分配，保证同一 key 只投递给一个消费者
    #[default]
    KeyShared,
    /// 单消费者独占
    Exclusive,
}

/// 订阅参数
#[derive(Debug, Clone, Builder)]
pub struct SubscribeOptions {
    pub topics: Vec<String>,
    #[builder(into)]
    pub subscription_name: String,
    #[builder(into)]
    pub consumer_name: String,
    #[builder(default)]
    pub subscription_type: SubscriptionType,
    /// 仅在订阅首次创建时生效
    #[builder(default = Position::Earliest)]
    pub initial_position: Position,
    /// 单次 `batch_receive` 返回的最大条数
    #[builder(default = 1000)]
    pub max_batch_size: usize,
}

/// 读取器参数
#[derive(Debug, Clone, Builder)]
pub struct ReaderOptions {
    #[builder(into)]
    pub topic: String,
    #[builder(into)]
    pub reader_name: String,
    #[builder(default = Position::Earliest)]
    pub start: Position,
    /// 仅返回落在这些区间内的 key；为空表示不过滤
    pub key_hash_ranges: Option<KeyHashRanges>,
}

/// topic 管理
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// 确保 topic 存在（已存在时为 no-op）
    async fn ensure_topic_exists(&self, topic: &str) -> Result<()>;

    /// 删除 topic（不存在时为 no-op）
    async fn delete_topic(&self, topic: &str) -> Result<()>;
}

/// 订阅消费者
#[async_trait]
pub trait TopicConsumer: Send + Sync {
    fn consumer_name(&self) -> &str;

    /// 批量接收；在 `timeout` 内无消息时返回空批次
    async fn batch_receive(&self, timeout: Duration) -> Result<Vec<Message>>;

    async fn acknowledge(&self, id: &MessageId) -> Result<()>;

    /// 否认确认：broker 将在之后重新投递该消息（不保证 key 内顺序）
    async fn negative_acknowledge(&self, id: &MessageId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// 位点读取器
#[async_trait]
pub trait TopicReader: Send + Sync {
    fn topic(&self) -> &str;

    async fn seek(&self, position: Position) -> Result<()>;

    /// 读取下一条；在 `timeout` 内无消息时返回 `None`
    async fn read_next(&self, timeout: Duration) -> Result<Option<Message>>;

    /// 当前位置之后是否还有已写入的消息
    async fn has_more_available(&self) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// 发布者
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    fn topic(&self) -> &str;

    async fn publish(&self, key: &str, payload: Value) -> Result<MessageId>;

    async fn publish_batch(&self, messages: &[(String, Value)]) -> Result<Vec<MessageId>> {
        let mut ids = Vec::with_capacity(messages.len());
        for (key, payload) in messages {
            ids.push(self.publish(key, payload.clone()).await?);
        }
        Ok(ids)
    }
}

/// broker 客户端：消费者/读取器/发布者工厂
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn TopicConsumer>>;

    async fn create_reader(&self, options: ReaderOptions) -> Result<Box<dyn TopicReader>>;

    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn TopicPublisher>>;
}

/// 哈希区间查询
#[async_trait]
pub trait KeyHashRangeProvider: Send + Sync {
    async fn owned_ranges(
        &self,
        topic: &str,
        subscription_name: &str,
        consumer_name: &str,
    ) -> Result<KeyHashRanges>;
}

#[async_trait]
impl<T> TopicAdmin for Arc<T>
where
    T: TopicAdmin + ?Sized,
{
    async fn ensure_topic_exists(&self, topic: &str) -> Result<()> {
        (**self).ensure_topic_exists(topic).await
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        (**self).delete_topic(topic).await
    }
}

#[async_trait]
impl<T> BrokerClient for Arc<T>
where
    T: BrokerClient + ?Sized,
{
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn TopicConsumer>> {
        (**self).subscribe(options).await
    }

    async fn create_reader(&self, options: ReaderOptions) -> Result<Box<dyn TopicReader>> {
        (**self).create_reader(options).await
    }

    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn TopicPublisher>> {
        (**self).create_publisher(topic).await
    }
}

#[async_trait]
impl<T> KeyHashRangeProvider for Arc<T>
where
    T: KeyHashRangeProvider + ?Sized,
{
    async fn owned_ranges(
        &self,
        topic: &str,
        subscription_name: &str,
        consumer_name: &str,
    ) -> Result<KeyHashRanges> {
        (**self)
            .owned_ranges(topic, subscription_name, consumer_name)
            .await
    }
}

/// 固定区间：不随 broker 分配变化，适用于独占订阅或测试
#[derive(Debug, Clone)]
pub struct StaticKeyHashRangeProvider {
    ranges: KeyHashRanges,
}

impl StaticKeyHashRangeProvider {
    pub fn new(ranges: KeyHashRanges) -> Self {
        Self { ranges }
    }

    pub fn full() -> Self {
        Self::new(KeyHashRanges::full())
    }
}

#[async_trait]
impl KeyHashRangeProvider for StaticKeyHashRangeProvider {
    async fn owned_ranges(
        &self,
        _topic: &str,
        _subscription_name: &str,
        _consumer_name: &str,
    ) -> Result<KeyHashRanges> {
        Ok(self.ranges.clone())
    }
}
