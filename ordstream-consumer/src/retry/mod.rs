//! 失败重放（恢复阶段批次来源）
//!
//! 对到期且落在本实例哈希区间内的 key，从失败位置按序列号升序
//! 直接读取其历史（位点读取，不依赖 broker 重投），直到追上 topic 末尾：
//! - 重放中再次失败只记录失败并退避，不向上抛出；
//! - 追上末尾且全部确认后标记 up-to-date 并解除跟踪，主路径恢复投递；
//! - 读取过程中的 broker 错误视为恢复机制本身失效，向上抛出。
//!
mod watermark;

pub use watermark::ReplayWatermarks;

use crate::batch::TopicBatchConsumer;
use crate::config::SubscriptionConfig;
use crate::error::{ConsumerError, ConsumerResult as Result};
use crate::failure::{StreamFailureState, StreamState, TopicStream};
use crate::message_context::MessageContext;
use async_trait::async_trait;
use ordstream_broker::broker::{BrokerClient, ReaderOptions, TopicPublisher, TopicReader};
use ordstream_broker::error::BrokerError;
use ordstream_broker::key_hash::KeyHashRanges;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

/// 单个 (topic, key) 在本批次中的重放进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplayProgress {
    reached_head: bool,
    last_sequence_id: i64,
}

pub struct FailedMessageRetryHandler {
    config: Arc<SubscriptionConfig>,
    client: Arc<dyn BrokerClient>,
    failure_state: Arc<StreamFailureState>,
    watermarks: ReplayWatermarks,
    key_hash_ranges: Mutex<Option<KeyHashRanges>>,
    readers: Mutex<HashMap<String, Box<dyn TopicReader>>>,
    in_flight: Mutex<HashMap<TopicStream, ReplayProgress>>,
    dead_letter: OnceCell<Box<dyn TopicPublisher>>,
    disposed: AtomicBool,
}

impl FailedMessageRetryHandler {
    pub fn new(
        config: Arc<SubscriptionConfig>,
        client: Arc<dyn BrokerClient>,
        failure_state: Arc<StreamFailureState>,
        watermarks: ReplayWatermarks,
    ) -> Self {
        Self {
            config,
            client,
            failure_state,
            watermarks,
            key_hash_ranges: Mutex::new(None),
            readers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            dead_letter: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// 更新本实例拥有的哈希区间；`None` 表示尚未获取，此时不重放任何 key
    pub async fn set_key_hash_ranges(&self, ranges: Option<KeyHashRanges>) {
        *self.key_hash_ranges.lock().await = ranges;
    }

    pub async fn key_hash_ranges(&self) -> Option<KeyHashRanges> {
        self.key_hash_ranges.lock().await.clone()
    }

    fn recovery_failed(&self, key: &TopicStream, source: BrokerError) -> ConsumerError {
        tracing::error!(
            topic = %key.topic,
            stream_id = %key.stream_id,
            error = %source,
            "failed to replay stream"
        );
        ConsumerError::RecoveryFailed {
            topic: key.topic.clone(),
            stream_id: key.stream_id.clone(),
            source,
        }
    }

    async fn ensure_reader<'a>(
        &self,
        readers: &'a mut HashMap<String, Box<dyn TopicReader>>,
        key: &TopicStream,
    ) -> Result<&'a dyn TopicReader> {
        if !readers.contains_key(&key.topic) {
            let options = ReaderOptions::builder()
                .topic(key.topic.as_str())
                .reader_name(format!("{}-retry-{}", self.config.consumer_name, key.topic))
                .build();
            let reader = self
                .client
                .create_reader(options)
                .await
                .map_err(|e| self.recovery_failed(key, e))?;
            readers.insert(key.topic.clone(), reader);
        }
        readers
            .get(&key.topic)
            .map(|r| &**r)
            .ok_or_else(|| ConsumerError::failure_state(format!("reader for {} missing", key.topic)))
    }

    /// 读取某个 key 在某个 topic 上的历史，追加到 `batch`
    ///
    /// 返回 `None` 表示读取期间被取消。
    async fn replay_stream(
        &self,
        reader: &dyn TopicReader,
        key: &TopicStream,
        stream: &StreamState,
        batch: &mut Vec<MessageContext>,
        cancel: &CancellationToken,
    ) -> Result<Option<(usize, bool)>> {
        let Some(state) = stream.topic(&key.topic) else {
            return Ok(Some((0, false)));
        };
        reader
            .seek(state.replay_position())
            .await
            .map_err(|e| self.recovery_failed(key, e))?;

        let mut read = 0;
        loop {
            let more = reader
                .has_more_available()
                .await
                .map_err(|e| self.recovery_failed(key, e))?;
            if !more {
                return Ok(Some((read, true)));
            }
            if batch.len() >= self.config.batch_size {
                return Ok(Some((read, false)));
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                r = reader.read_next(self.config.replay_read_timeout) => r,
            };
            let Some(message) = next.map_err(|e| self.recovery_failed(key, e))? else {
                return Ok(Some((read, false)));
            };
            if message.key() != key.stream_id {
                continue;
            }
            batch.push(MessageContext::replay(message));
            read += 1;
        }
    }

    /// 重放已追上末尾：标记、记录水位并解除跟踪
    async fn complete_replay(&self, key: &TopicStream, last_sequence_id: i64) -> Result<()> {
        let topics = std::slice::from_ref(&key.topic);
        self.failure_state
            .stream_topics_up_to_date(&key.stream_id, topics)
            .await?;
        self.watermarks.record(key.clone(), last_sequence_id);
        self.failure_state
            .stream_topics_resolved(&key.stream_id, topics)
            .await
    }

    async fn should_dead_letter(&self, key: &TopicStream) -> bool {
        let Some(policy) = &self.config.dead_letter else {
            return false;
        };
        let Some(state) = self.failure_state.tracked(&key.topic, &key.stream_id).await else {
            return false;
        };
        let retries = if state.has_pending_failure() {
            state.times_retried.saturating_add(1)
        } else {
            0
        };
        retries >= policy.max_retries
    }

    async fn dead_letter(&self, ctx: &MessageContext) -> Result<()> {
        let Some(policy) = &self.config.dead_letter else {
            return Ok(());
        };
        let publisher = self
            .dead_letter
            .get_or_try_init(|| self.client.create_publisher(&policy.topic))
            .await?;

        let times_retried = self
            .failure_state
            .tracked(ctx.topic(), ctx.stream_id())
            .await
            .map(|s| s.times_retried)
            .unwrap_or_default();
        let payload = json!({
            "topic": ctx.topic(),
            "stream_id": ctx.stream_id(),
            "sequence_id": ctx.sequence_id(),
            "publish_time": ctx.publish_time(),
            "times_retried": times_retried,
            "payload": ctx.payload(),
        });
        publisher.publish(ctx.stream_id(), payload).await?;

        tracing::warn!(
            topic = %ctx.topic(),
            stream_id = %ctx.stream_id(),
            sequence_id = ctx.sequence_id(),
            dead_letter_topic = %policy.topic,
            "message dead-lettered"
        );
        Ok(())
    }
}

#[async_trait]
impl TopicBatchConsumer for FailedMessageRetryHandler {
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<MessageContext>> {
        if self.disposed.load(Ordering::Acquire) || cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let Some(ranges) = self.key_hash_ranges().await else {
            return Ok(Vec::new());
        };

        let owned: Vec<StreamState> = self
            .failure_state
            .streams_for_retry()
            .await
            .into_iter()
            .filter(|s| ranges.contains_key(&s.stream_id))
            .collect();
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let mut readers = self.readers.lock().await;
        let mut batch = Vec::new();
        let mut progress = HashMap::new();
        let mut idle = Vec::new();

        'streams: for stream in &owned {
            for topic in stream.topics.keys() {
                if batch.len() >= self.config.batch_size {
                    break 'streams;
                }
                let key = TopicStream::new(topic.as_str(), stream.stream_id.as_str());
                let reader = self.ensure_reader(&mut readers, &key).await?;

                let Some((read, reached_head)) = self
                    .replay_stream(reader, &key, stream, &mut batch, cancel)
                    .await?
                else {
                    return Ok(Vec::new());
                };

                match batch.last() {
                    Some(last) if read > 0 => {
                        progress.insert(
                            key,
                            ReplayProgress {
                                reached_head,
                                last_sequence_id: last.sequence_id(),
                            },
                        );
                    }
                    _ if reached_head => {
                        if let Some(state) = stream.topic(topic) {
                            idle.push((key, state.last_sequence_id));
                        }
                    }
                    _ => {}
                }
            }
        }
        drop(readers);

        for (key, last_sequence_id) in &idle {
            tracing::debug!(topic = %key.topic, stream_id = %key.stream_id, "nothing left to replay");
            self.complete_replay(key, *last_sequence_id).await?;
        }

        if !batch.is_empty() {
            tracing::info!(
                count = batch.len(),
                streams = progress.len(),
                "replaying failed streams"
            );
        }
        *self.in_flight.lock().await = progress;
        Ok(batch)
    }

    async fn finalize_batch(&self, acks: &[MessageContext], nacks: &[MessageContext]) -> Result<()> {
        let progress = std::mem::take(&mut *self.in_flight.lock().await);
        if acks.is_empty() && nacks.is_empty() {
            return Ok(());
        }

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

        // 只有位于首个失败之前的确认才算数
        let mut succeeded: BTreeMap<TopicStream, &MessageContext> = BTreeMap::new();
        for ack in acks {
            let key = TopicStream::of(ack.message());
            if failed
                .get(&key)
                .is_some_and(|f| ack.sequence_id() > f.sequence_id())
            {
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
            self.failure_state.message_succeeded(ctx.message()).await?;

            if failed.contains_key(key) {
                continue;
            }
            let caught_up = progress
                .get(key)
                .is_some_and(|p| p.reached_head && p.last_sequence_id == ctx.sequence_id());
            if caught_up {
                self.complete_replay(key, ctx.sequence_id()).await?;
            }
        }

        for (key, ctx) in &failed {
            if self.should_dead_letter(key).await {
                self.dead_letter(ctx).await?;
                self.failure_state.message_succeeded(ctx.message()).await?;
            } else {
                self.failure_state.message_failed(ctx.message()).await?;
            }
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let readers = std::mem::take(&mut *self.readers.lock().await);
        for (topic, reader) in readers {
            if let Err(e) = reader.close().await
                && !e.is_already_closed()
            {
                tracing::warn!(topic = %topic, error = %e, "failed to close replay reader");
            }
        }
        Ok(())
    }
}
