//! 主订阅（正常阶段批次来源）
//!
//! 按 broker 顺序投递主订阅消息，但跳过仍处于恢复中的 key：
//! 这些 key 的消息由重放按位点重新读取，主路径只需确认掉。
//!
use crate::batch::{TopicBatchConsumer, pause};
use crate::config::SubscriptionConfig;
use crate::error::{ConsumerError, ConsumerResult as Result};
use crate::failure::{StreamFailureState, TopicStream};
use crate::message_context::MessageContext;
use crate::retry::ReplayWatermarks;
use async_trait::async_trait;
use ordstream_broker::broker::{
    BrokerClient, SubscribeOptions, SubscriptionType, TopicAdmin, TopicConsumer,
};
use ordstream_broker::message::{Message, MessageId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

pub struct PrimaryTopicConsumer {
    config: Arc<SubscriptionConfig>,
    client: Arc<dyn BrokerClient>,
    admin: Arc<dyn TopicAdmin>,
    failure_state: Arc<StreamFailureState>,
    watermarks: ReplayWatermarks,
    consumer: OnceCell<Box<dyn TopicConsumer>>,
    disposed: AtomicBool,
}

impl PrimaryTopicConsumer {
    pub fn new(
        config: Arc<SubscriptionConfig>,
        client: Arc<dyn BrokerClient>,
        admin: Arc<dyn TopicAdmin>,
        failure_state: Arc<StreamFailureState>,
        watermarks: ReplayWatermarks,
    ) -> Self {
        Self {
            config,
            client,
            admin,
            failure_state,
            watermarks,
            consumer: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// 建立订阅（仅首次生效）；broker 不可达时返回错误
    pub async fn initialize(&self) -> Result<()> {
        self.consumer().await.map(|_| ())
    }

    async fn consumer(&self) -> Result<&dyn TopicConsumer> {
        let consumer = self
            .consumer
            .get_or_try_init(|| async {
                for topic in self.managed_topics() {
                    self.admin.ensure_topic_exists(&topic).await?;
                }

                let options = SubscribeOptions::builder()
                    .topics(self.config.topics.clone())
                    .subscription_name(self.config.subscription_name.as_str())
                    .consumer_name(self.config.consumer_name.as_str())
                    .subscription_type(SubscriptionType::KeyShared)
                    .initial_position(self.config.initial_position())
                    .max_batch_size(self.config.batch_size)
                    .build();
                let consumer = self.client.subscribe(options).await?;

                tracing::info!(
                    topics = ?self.config.topics,
                    subscription = %self.config.subscription_name,
                    consumer = %self.config.consumer_name,
                    "primary subscription established"
                );
                Ok::<_, ConsumerError>(consumer)
            })
            .await?;
        Ok(&**consumer)
    }

    /// 订阅涉及的全部 topic：消费 topic、失败状态 topic 与死信 topic
    fn managed_topics(&self) -> Vec<String> {
        let mut topics = self.config.topics.clone();
        topics.push(self.config.failure_state_topic_name());
        if let Some(dead_letter) = &self.config.dead_letter {
            topics.push(dead_letter.topic.clone());
        }
        topics
    }

    async fn acknowledge(&self, consumer: &dyn TopicConsumer, id: &MessageId) -> Result<()> {
        match consumer.acknowledge(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_closed() => {
                tracing::debug!(message_id = %id, "acknowledge after close ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 过滤仍处于恢复中的 key，并确认被跳过的消息
    async fn filter(
        &self,
        consumer: &dyn TopicConsumer,
        messages: Vec<Message>,
    ) -> Result<Vec<MessageContext>> {
        let mut batch = Vec::with_capacity(messages.len());

        for message in messages {
            let key = TopicStream::of(&message);
            let sequence_id = message.sequence_id();

            if self.watermarks.covers(&key, sequence_id) {
                tracing::debug!(topic = %key.topic, stream_id = %key.stream_id, sequence_id, "already delivered by replay");
                self.acknowledge(consumer, &message.id()).await?;
                continue;
            }

            match self.failure_state.tracked(&key.topic, &key.stream_id).await {
                None => batch.push(MessageContext::primary(message)),
                Some(state) if state.is_up_to_date => {
                    if sequence_id <= state.last_sequence_id {
                        self.acknowledge(consumer, &message.id()).await?;
                        continue;
                    }
                    self.failure_state
                        .stream_topics_resolved(&key.stream_id, std::slice::from_ref(&key.topic))
                        .await?;
                    batch.push(MessageContext::primary(message));
                }
                Some(_) => {
                    tracing::debug!(topic = %key.topic, stream_id = %key.stream_id, sequence_id, "stream under recovery, skipped");
                    self.acknowledge(consumer, &message.id()).await?;
                }
            }
        }
        Ok(batch)
    }

    async fn record_failures(
        &self,
        consumer: &dyn TopicConsumer,
        failed: &BTreeMap<TopicStream, &MessageContext>,
        nacks: &[MessageContext],
    ) -> Result<()> {
        for (key, ctx) in failed {
            let Err(err) = self.failure_state.message_failed(ctx.message()).await else {
                continue;
            };

            tracing::error!(
                topic = %key.topic,
                stream_id = %key.stream_id,
                sequence_id = ctx.sequence_id(),
                error = %err,
                "failed to persist failure state, returning messages to broker"
            );
            for nack in nacks.iter().filter(|n| TopicStream::of(n.message()) == *key) {
                if let Err(e) = consumer.negative_acknowledge(&nack.message_id()).await {
                    tracing::warn!(message_id = %nack.message_id(), error = %e, "negative acknowledge failed");
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl TopicBatchConsumer for PrimaryTopicConsumer {
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<MessageContext>> {
        if self.disposed.load(Ordering::Acquire) || cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let consumer = self.consumer().await?;

        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            r = consumer.batch_receive(self.config.receive_timeout) => r,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(e) if e.is_already_closed() => {
                tracing::debug!(error = %e, "primary consumer already closed");
                return Ok(Vec::new());
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient broker error on receive");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if messages.is_empty() {
            pause(cancel, self.config.no_batch_delay).await;
            return Ok(Vec::new());
        }

        let received = messages.len();
        let batch = self.filter(consumer, messages).await?;
        if batch.len() < received {
            tracing::debug!(
                received,
                delivered = batch.len(),
                "primary batch filtered"
            );
        }
        Ok(batch)
    }

    async fn finalize_batch(&self, acks: &[MessageContext], nacks: &[MessageContext]) -> Result<()> {
        if acks.is_empty() && nacks.is_empty() {
            return Ok(());
        }
        let Some(consumer) = self.consumer.get() else {
            return Ok(());
        };
        let consumer = &**consumer;

        let mut failed: BTreeMap<TopicStream, &MessageContext> = BTreeMap::new();
        for nack in nacks {
            failed
                .entry(TopicStream::of(nack.message()))
                .and_modify(|lowest| {
                    if nack.sequence_id() < lowest.sequence_id() {
                        *lowest = nack;
                    }
                })
                .or_insert(nack);
        }
        self.record_failures(consumer, &failed, nacks).await?;

        let mut succeeded: BTreeMap<TopicStream, &MessageContext> = BTreeMap::new();
        for ack in acks {
            let key = TopicStream::of(ack.message());
            if failed.contains_key(&key) {
                continue;
            }
            succeeded
                .entry(key)
                .and_modify(|highest| {
                    if ack.sequence_id() > highest.sequence_id() {
                        *highest = ack;
                    }
                })
                .or_insert(ack);
        }
        for (key, ctx) in &succeeded {
            if self
                .failure_state
                .tracked(&key.topic, &key.stream_id)
                .await
                .is_some()
            {
                self.failure_state.message_succeeded(ctx.message()).await?;
            }
        }

        for ctx in acks.iter().chain(nacks) {
            self.acknowledge(consumer, &ctx.message_id()).await?;
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(consumer) = self.consumer.get() {
            match consumer.close().await {
                Err(e) if !e.is_already_closed() => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}
