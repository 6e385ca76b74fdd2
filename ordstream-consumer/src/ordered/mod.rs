//! 顺序保证消费者（OrderGuaranteedConsumer）
//!
//! 在“正常 / 失败重放”两个阶段之间交替取批次：
//! - 每次调用先切换阶段，再按需刷新本实例的哈希区间；
//! - 重放阶段取到空批次时同一次调用内回落到正常阶段；
//! - `finalize_batch` 交给产生该批次的阶段处理。
//!
mod phase;

pub use phase::{BatchPhase, RefreshTimer};

use crate::batch::{TopicBatchConsumer, pause};
use crate::clock::{Clock, SystemClock};
use crate::config::SubscriptionConfig;
use crate::error::ConsumerResult as Result;
use crate::failure::{FailureStateLog, StreamFailureState, TopicFailureStateLog};
use crate::message_context::MessageContext;
use crate::primary::PrimaryTopicConsumer;
use crate::retry::{FailedMessageRetryHandler, ReplayWatermarks};
use async_trait::async_trait;
use bon::bon;
use ordstream_broker::broker::{BrokerClient, KeyHashRangeProvider, TopicAdmin};
use ordstream_broker::key_hash::KeyHashRanges;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct CycleState {
    phase: BatchPhase,
    refresh: RefreshTimer,
}

pub struct OrderGuaranteedConsumer {
    config: Arc<SubscriptionConfig>,
    failure_state: Arc<StreamFailureState>,
    primary: PrimaryTopicConsumer,
    retry: FailedMessageRetryHandler,
    key_hash_provider: Arc<dyn KeyHashRangeProvider>,
    cycle: Mutex<CycleState>,
    disposed: AtomicBool,
}

#[bon]
impl OrderGuaranteedConsumer {
    #[builder]
    pub fn new(
        config: SubscriptionConfig,
        client: Arc<dyn BrokerClient>,
        admin: Arc<dyn TopicAdmin>,
        key_hash_provider: Arc<dyn KeyHashRangeProvider>,
        clock: Option<Arc<dyn Clock>>,
        failure_state_log: Option<Arc<dyn FailureStateLog>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let log = failure_state_log.unwrap_or_else(|| {
            Arc::new(TopicFailureStateLog::new(
                client.clone(),
                config.failure_state_topic_name(),
                format!("{}-failure-state", config.consumer_name),
            ))
        });
        let failure_state = Arc::new(StreamFailureState::new(log, config.retry_schedule(), clock));
        let watermarks = ReplayWatermarks::new();

        let primary = PrimaryTopicConsumer::new(
            config.clone(),
            client.clone(),
            admin,
            failure_state.clone(),
            watermarks.clone(),
        );
        let retry = FailedMessageRetryHandler::new(
            config.clone(),
            client,
            failure_state.clone(),
            watermarks,
        );

        Ok(Self {
            cycle: Mutex::new(CycleState {
                phase: BatchPhase::default(),
                refresh: RefreshTimer::new(config.key_hash_refresh_interval),
            }),
            config,
            failure_state,
            primary,
            retry,
            key_hash_provider,
            disposed: AtomicBool::new(false),
        })
    }
}

impl OrderGuaranteedConsumer {
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn failure_state(&self) -> &Arc<StreamFailureState> {
        &self.failure_state
    }

    /// 最近一次 `next_batch` 所处的阶段
    pub async fn phase(&self) -> BatchPhase {
        self.cycle.lock().await.phase
    }

    pub async fn key_hash_ranges(&self) -> Option<KeyHashRanges> {
        self.retry.key_hash_ranges().await
    }

    async fn refresh_key_hash_ranges(
        &self,
        refresh: &mut RefreshTimer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !refresh.is_due(Instant::now()) {
            return Ok(());
        }
        let first = !refresh.has_refreshed();
        if first {
            pause(cancel, self.config.assignment_settle_delay).await;
            if cancel.is_cancelled() {
                return Ok(());
            }
        }

        let owned = self
            .key_hash_provider
            .owned_ranges(
                self.config.primary_topic(),
                &self.config.subscription_name,
                &self.config.consumer_name,
            )
            .await;

        match owned {
            Ok(ranges) => {
                tracing::debug!(
                    consumer = %self.config.consumer_name,
                    ranges = %ranges,
                    "key hash ranges refreshed"
                );
                self.retry.set_key_hash_ranges(Some(ranges)).await;
            }
            Err(e) if first => return Err(e.into()),
            Err(e) => {
                tracing::warn!(
                    consumer = %self.config.consumer_name,
                    error = %e,
                    "key hash range refresh failed, keeping previous ranges"
                );
            }
        }
        refresh.mark(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl TopicBatchConsumer for OrderGuaranteedConsumer {
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<MessageContext>> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let mut cycle = self.cycle.lock().await;
        let cycle = &mut *cycle;
        cycle.phase = cycle.phase.next();

        self.primary.initialize().await?;
        if let Err(e) = self.failure_state.initialize().await {
            if e.is_already_closed() {
                tracing::debug!(error = %e, "failure state log already closed");
                return Ok(Vec::new());
            }
            return Err(e);
        }
        self.refresh_key_hash_ranges(&mut cycle.refresh, cancel)
            .await?;

        if cycle.phase == BatchPhase::FailureRetry {
            let batch = match self.retry.next_batch(cancel).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "failure retry phase failed");
                    return Err(e);
                }
            };
            cycle.phase = cycle.phase.settle(batch.len());
            if !batch.is_empty() {
                return Ok(batch);
            }
        }

        self.primary.next_batch(cancel).await
    }

    async fn finalize_batch(&self, acks: &[MessageContext], nacks: &[MessageContext]) -> Result<()> {
        let cycle = self.cycle.lock().await;
        match cycle.phase {
            BatchPhase::FailureRetry => self.retry.finalize_batch(acks, nacks).await,
            BatchPhase::Normal => self.primary.finalize_batch(acks, nacks).await,
        }
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        let (primary, retry, failure_state) = futures_util::future::join3(
            self.primary.dispose(),
            self.retry.dispose(),
            self.failure_state.close(),
        )
        .await;
        primary.and(retry).and(failure_state)
    }
}
