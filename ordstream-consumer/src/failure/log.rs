//! 失败状态持久化（控制 topic）
//!
//! 每次变更写入该 key 的完整状态，key 即 stream id；重放时后写覆盖先写，
//! 空状态为墓碑。
//!
use super::state::StreamState;
use crate::error::ConsumerResult as Result;
use async_trait::async_trait;
use ordstream_broker::broker::{BrokerClient, ReaderOptions, TopicPublisher, TopicReader};
use ordstream_broker::message::Position;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

#[async_trait]
pub trait FailureStateLog: Send + Sync {
    async fn publish(&self, state: &StreamState) -> Result<()>;

    /// 返回自上次调用以来追加的全部条目（首次调用返回整个日志）
    async fn replay_to_head(&self) -> Result<Vec<StreamState>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 基于 broker topic 的失败状态日志
pub struct TopicFailureStateLog {
    client: Arc<dyn BrokerClient>,
    topic: String,
    reader_name: String,
    read_timeout: Duration,
    publisher: OnceCell<Box<dyn TopicPublisher>>,
    reader: OnceCell<Box<dyn TopicReader>>,
}

impl TopicFailureStateLog {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        topic: impl Into<String>,
        reader_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            topic: topic.into(),
            reader_name: reader_name.into(),
            read_timeout: Duration::from_millis(100),
            publisher: OnceCell::new(),
            reader: OnceCell::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn publisher(&self) -> Result<&dyn TopicPublisher> {
        let publisher = self
            .publisher
            .get_or_try_init(|| self.client.create_publisher(&self.topic))
            .await?;
        Ok(&**publisher)
    }

    async fn reader(&self) -> Result<&dyn TopicReader> {
        let reader = self
            .reader
            .get_or_try_init(|| {
                self.client.create_reader(
                    ReaderOptions::builder()
                        .topic(self.topic.as_str())
                        .reader_name(self.reader_name.as_str())
                        .start(Position::Earliest)
                        .build(),
                )
            })
            .await?;
        Ok(&**reader)
    }
}

#[async_trait]
impl FailureStateLog for TopicFailureStateLog {
    async fn publish(&self, state: &StreamState) -> Result<()> {
        let payload = serde_json::to_value(state)?;
        self.publisher()
            .await?
            .publish(&state.stream_id, payload)
            .await?;
        Ok(())
    }

    async fn replay_to_head(&self) -> Result<Vec<StreamState>> {
        let reader = self.reader().await?;
        let mut entries = Vec::new();

        while reader.has_more_available().await? {
            let Some(message) = reader.read_next(self.read_timeout).await? else {
                break;
            };
            entries.push(serde_json::from_value(message.payload().clone())?);
        }

        if !entries.is_empty() {
            tracing::debug!(
                topic = %self.topic,
                count = entries.len(),
                "failure state entries replayed"
            );
        }
        Ok(entries)
    }

    async fn close(&self) -> Result<()> {
        if let Some(reader) = self.reader.get() {
            match reader.close().await {
                Err(e) if !e.is_already_closed() => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}
