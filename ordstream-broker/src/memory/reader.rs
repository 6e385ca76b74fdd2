use super::BrokerState;
use super::topic_log::TopicLog;
use crate::broker::TopicReader;
use crate::error::{BrokerError, BrokerResult as Result};
use crate::key_hash::KeyHashRanges;
use crate::message::{Message, Position};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 内存版位点读取器：不参与订阅确认
pub struct InMemoryReader {
    state: Arc<BrokerState>,
    log: Arc<TopicLog>,
    name: String,
    /// 已越过的最后序列号
    position: Mutex<i64>,
    key_hash_ranges: Option<KeyHashRanges>,
    closed: AtomicBool,
}

impl InMemoryReader {
    pub(crate) fn new(
        state: Arc<BrokerState>,
        log: Arc<TopicLog>,
        name: String,
        position: i64,
        key_hash_ranges: Option<KeyHashRanges>,
    ) -> Self {
        Self {
            state,
            log,
            name,
            position: Mutex::new(position),
            key_hash_ranges: key_hash_ranges.filter(|r| !r.is_empty()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::already_closed(format!(
                "reader {} on {}",
                self.name,
                self.log.name()
            )));
        }
        Ok(())
    }

    fn accepts(&self, message: &Message) -> bool {
        self.key_hash_ranges
            .as_ref()
            .is_none_or(|ranges| ranges.contains_key(message.key()))
    }

    async fn advance(&self) -> Option<Message> {
        let mut position = self.position.lock().await;
        let head = self.log.head().await;
        while *position < head {
            *position += 1;
            if let Some(message) = self.log.get(*position).await
                && self.accepts(&message)
            {
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl TopicReader for InMemoryReader {
    fn topic(&self) -> &str {
        self.log.name()
    }

    async fn seek(&self, position: Position) -> Result<()> {
        self.ensure_open()?;
        let resolved = self.log.resolve(position).await?;
        *self.position.lock().await = resolved;
        Ok(())
    }

    async fn read_next(&self, timeout: Duration) -> Result<Option<Message>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.state.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.advance().await {
                return Ok(Some(message));
            }
            self.ensure_open()?;

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn has_more_available(&self) -> Result<bool> {
        self.ensure_open()?;
        let position = *self.position.lock().await;
        Ok(position < self.log.head().await)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.state.activity.notify_waiters();
        Ok(())
    }
}
