//! 失败状态索引（StreamFailureState）
//!
//! 回答“哪些 key 到期需要重放”，并记录成功/失败转换。所有命令都是
//! 读取-修改-写回整条 `StreamState`，由内部互斥锁串行化。
//!
use super::log::FailureStateLog;
use super::state::{StreamState, TopicState, TopicStream};
use super::topic::FailureStateTopic;
use crate::clock::Clock;
use crate::error::ConsumerResult as Result;
use crate::retry_schedule::RetrySchedule;
use chrono::{DateTime, TimeDelta, Utc};
use ordstream_broker::message::Message;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct StreamFailureState {
    topic: FailureStateTopic,
    schedule: RetrySchedule,
    clock: Arc<dyn Clock>,
    commands: Mutex<()>,
}

impl StreamFailureState {
    pub fn new(log: Arc<dyn FailureStateLog>, schedule: RetrySchedule, clock: Arc<dyn Clock>) -> Self {
        Self {
            topic: FailureStateTopic::new(log),
            schedule,
            clock,
            commands: Mutex::new(()),
        }
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 重放控制 topic 至末尾；可重复调用，只合并新增条目
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.commands.lock().await;
        self.topic.initialize().await
    }

    /// 每个 key 仅保留到期的 topic，没有到期 topic 的 key 不返回
    pub async fn streams_for_retry(&self) -> Vec<StreamState> {
        let now = self.clock.now();
        self.topic
            .streams()
            .await
            .iter()
            .filter_map(|s| s.due_topics(now))
            .collect()
    }

    pub async fn find_topic_streams<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a TopicStream>,
    ) -> Vec<(String, TopicState)> {
        let keys: Vec<&TopicStream> = keys.into_iter().collect();
        let streams = self
            .topic
            .find_streams(keys.iter().map(|k| k.stream_id.as_str()))
            .await;

        let mut found = Vec::new();
        for key in keys {
            let state = streams
                .iter()
                .find(|s| s.stream_id == key.stream_id)
                .and_then(|s| s.topic(&key.topic));
            if let Some(state) = state {
                found.push((key.stream_id.clone(), state.clone()));
            }
        }
        found
    }

    pub async fn tracked(&self, topic: &str, stream_id: &str) -> Option<TopicState> {
        self.topic
            .find_stream(stream_id)
            .await
            .and_then(|s| s.topic(topic).cloned())
    }

    pub async fn tracked_stream_count(&self) -> usize {
        self.topic.len().await
    }

    /// 标记已追上末尾；仅在确有标志变化时写入。重试尚未到期的 topic 不会被标记
    pub async fn stream_topics_up_to_date(&self, stream_id: &str, topics: &[String]) -> Result<bool> {
        let _guard = self.commands.lock().await;
        let Some(mut state) = self.topic.find_stream(stream_id).await else {
            return Ok(false);
        };

        let now = self.clock.now();
        let mut changed = false;
        for name in topics {
            let Some(topic_state) = state.topics.get_mut(name) else {
                continue;
            };
            if topic_state.is_up_to_date {
                continue;
            }
            if topic_state.next_retry.is_some_and(|at| at > now) {
                tracing::debug!(
                    topic = %name,
                    stream_id,
                    "retry still pending, not marking up to date"
                );
                continue;
            }
            topic_state.is_up_to_date = true;
            changed = true;
        }

        if changed {
            tracing::debug!(stream_id, topics = ?topics, "stream topics up to date");
            self.topic.publish(state).await?;
        }
        Ok(changed)
    }

    /// 移除已追上末尾且被请求的 topic；key 的状态清空后从索引中移除
    pub async fn stream_topics_resolved(&self, stream_id: &str, topics: &[String]) -> Result<()> {
        let _guard = self.commands.lock().await;
        let Some(mut state) = self.topic.find_stream(stream_id).await else {
            return Ok(());
        };

        let before = state.topics.len();
        state
            .topics
            .retain(|name, topic_state| !(topic_state.is_up_to_date && topics.contains(name)));
        if state.topics.len() == before {
            return Ok(());
        }

        tracing::info!(
            stream_id,
            topics = ?topics,
            remaining = state.topics.len(),
            "stream recovered"
        );
        self.topic.publish(state).await
    }

    /// 记录失败，返回该 (topic, key) 是否为新纳入跟踪
    pub async fn message_failed(&self, message: &Message) -> Result<bool> {
        let _guard = self.commands.lock().await;
        let now = self.clock.now();
        let mut state = self
            .topic
            .find_stream(message.key())
            .await
            .unwrap_or_else(|| StreamState::new(message.key()));

        let created = !state.topics.contains_key(message.topic());
        let topic_state = state
            .topics
            .entry(message.topic().to_string())
            .or_insert_with(|| TopicState::new(message));

        topic_state.observe(message);
        if topic_state.has_pending_failure() {
            topic_state.times_retried = topic_state.times_retried.saturating_add(1);
        }
        let interval = self.schedule.next_interval(topic_state.times_retried);
        let base = message.publish_time().max(now);
        let next_retry = TimeDelta::from_std(interval)
            .ok()
            .and_then(|delta| base.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        topic_state.next_retry = Some(next_retry);
        topic_state.is_up_to_date = false;

        tracing::info!(
            topic = %message.topic(),
            stream_id = %message.key(),
            sequence_id = message.sequence_id(),
            times_retried = topic_state.times_retried,
            next_retry = %next_retry,
            "message failed"
        );
        self.topic.publish(state).await?;
        Ok(created)
    }

    /// 记录成功，清除重试计数与待重试时间
    pub async fn message_succeeded(&self, message: &Message) -> Result<bool> {
        let _guard = self.commands.lock().await;
        let mut state = self
            .topic
            .find_stream(message.key())
            .await
            .unwrap_or_else(|| StreamState::new(message.key()));

        let created = !state.topics.contains_key(message.topic());
        let topic_state = state
            .topics
            .entry(message.topic().to_string())
            .or_insert_with(|| TopicState::new(message));

        topic_state.observe(message);
        let recovered = topic_state.has_pending_failure();
        topic_state.times_retried = 0;
        topic_state.next_retry = None;

        if recovered {
            tracing::info!(
                topic = %message.topic(),
                stream_id = %message.key(),
                sequence_id = message.sequence_id(),
                "failed message succeeded"
            );
        }
        self.topic.publish(state).await?;
        Ok(created)
    }

    pub async fn close(&self) -> Result<()> {
        self.topic.close().await
    }
}
