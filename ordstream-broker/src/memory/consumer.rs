use super::BrokerState;
use super::cursor::SubscriptionCursor;
use super::topic_log::TopicLog;
use crate::broker::TopicConsumer;
use crate::error::{BrokerError, BrokerResult as Result};
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// 订阅在单个 topic 上的绑定
pub(crate) struct TopicBinding {
    pub(crate) log: Arc<TopicLog>,
    pub(crate) cursor: Arc<SubscriptionCursor>,
}

/// 内存版订阅消费者
pub struct InMemoryConsumer {
    state: Arc<BrokerState>,
    name: String,
    subscription: String,
    bindings: Vec<TopicBinding>,
    max_batch_size: usize,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    pub(crate) fn new(
        state: Arc<BrokerState>,
        name: String,
        subscription: String,
        bindings: Vec<TopicBinding>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            state,
            name,
            subscription,
            bindings,
            max_batch_size: max_batch_size.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::already_closed(format!(
                "consumer {} ({})",
                self.name, self.subscription
            )));
        }
        Ok(())
    }

    fn binding(&self, topic: &str) -> Result<&TopicBinding> {
        self.bindings
            .iter()
            .find(|b| b.log.name() == topic)
            .ok_or_else(|| BrokerError::SubscriptionNotFound {
                topic: topic.to_string(),
                subscription: self.subscription.clone(),
            })
    }

    async fn collect(&self) -> Vec<Message> {
        let mut batch = Vec::new();
        for binding in &self.bindings {
            let remaining = self.max_batch_size - batch.len();
            if remaining == 0 {
                break;
            }
            batch.extend(
                binding
                    .cursor
                    .dispatch(&binding.log, &self.name, remaining)
                    .await,
            );
        }
        batch
    }

    async fn next_redelivery(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for binding in &self.bindings {
            if let Some(at) = binding.cursor.next_redelivery().await {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }
        earliest
    }
}

#[async_trait]
impl TopicConsumer for InMemoryConsumer {
    fn consumer_name(&self) -> &str {
        &self.name
    }

    async fn batch_receive(&self, timeout: Duration) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.state.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect().await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            self.ensure_open()?;

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = match self.next_redelivery().await {
                Some(at) => at.min(deadline),
                None => deadline,
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, id: &MessageId) -> Result<()> {
        self.ensure_open()?;
        let binding = self.binding(id.topic())?;
        let head = binding.log.head().await;
        binding.cursor.acknowledge(id.sequence_id(), head).await
    }

    async fn negative_acknowledge(&self, id: &MessageId) -> Result<()> {
        self.ensure_open()?;
        let binding = self.binding(id.topic())?;
        binding
            .cursor
            .negative_acknowledge(id.sequence_id(), self.state.config.nack_redelivery_delay)
            .await;
        self.state.activity.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for binding in &self.bindings {
            binding.cursor.unregister(&self.name).await;
        }
        self.state.activity.notify_waiters();
        tracing::debug!(
            consumer = %self.name,
            subscription = %self.subscription,
            "in-memory consumer closed"
        );
        Ok(())
    }
}
