//! 订阅驱动（SubscriptionEngine）
//!
//! 长驻任务循环“取批次 → 交给处理器 → 回报确认/否认”：
//! - 处理器返回错误时整批否认；
//! - 取批次或回报失败视为致命，记录后停止循环；
//! - 退出时释放底层消费者；
//! - 提供关闭与等待的 `SubscriptionHandle`。
//!
use crate::batch::{TopicBatchConsumer, pause};
use crate::error::{ConsumerError, ConsumerResult as Result};
use crate::message_context::MessageContext;
use async_trait::async_trait;
use bon::Builder;
use ordstream_broker::message::MessageId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 批次处理器
#[async_trait]
pub trait BatchHandler: Send + Sync {
    fn handler_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// 处理一批消息；通过 `ctx.nack` 标记失败的消息，未标记的视为成功
    async fn on_batch(&self, ctx: &mut SubscriptionContext) -> anyhow::Result<()>;
}

/// 单个批次的处理上下文
pub struct SubscriptionContext {
    messages: Vec<MessageContext>,
    nacked: HashSet<MessageId>,
    cancel: CancellationToken,
}

impl SubscriptionContext {
    pub fn new(messages: Vec<MessageContext>, cancel: CancellationToken) -> Self {
        Self {
            messages,
            nacked: HashSet::new(),
            cancel,
        }
    }

    pub fn messages(&self) -> &[MessageContext] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn nack(&mut self, message: &MessageContext) {
        self.nacked.insert(message.message_id());
    }

    pub fn nack_all(&mut self) {
        self.nacked = self.messages.iter().map(|m| m.message_id()).collect();
    }

    pub fn is_nacked(&self, message: &MessageContext) -> bool {
        self.nacked.contains(&message.message_id())
    }

    /// 订阅正在关闭
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 拆分为 (确认, 否认)
    pub fn into_outcome(self) -> (Vec<MessageContext>, Vec<MessageContext>) {
        let nacked = self.nacked;
        self.messages
            .into_iter()
            .partition(|m| !nacked.contains(&m.message_id()))
    }
}

/// 订阅驱动配置
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionEngineConfig {
    /// 取到空批次后的等待
    pub idle_delay: Duration,
}

impl Default for SubscriptionEngineConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Builder)]
pub struct SubscriptionEngine {
    consumer: Arc<dyn TopicBatchConsumer>,
    handler: Arc<dyn BatchHandler>,
    #[builder(default)]
    config: SubscriptionEngineConfig,
}

impl SubscriptionEngine {
    /// 启动订阅循环，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> SubscriptionHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(Self::run(self, token.clone()));
        SubscriptionHandle {
            token,
            task: Some(task),
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let outcome = self.consume_loop(&token).await;

        let disposed = self.consumer.dispose().await;
        if let Err(e) = &disposed {
            tracing::warn!(handler = %self.handler.handler_name(), error = %e, "failed to dispose consumer");
        }
        outcome.and(disposed)
    }

    async fn consume_loop(&self, token: &CancellationToken) -> Result<()> {
        let handler = self.handler.handler_name();

        while !token.is_cancelled() {
            let batch = match self.consumer.next_batch(token).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(handler, error = %e, "next batch failed, stopping subscription");
                    return Err(e);
                }
            };
            if batch.is_empty() {
                pause(token, self.config.idle_delay).await;
                continue;
            }

            let count = batch.len();
            let mut ctx = SubscriptionContext::new(batch, token.clone());
            if let Err(e) = self.handler.on_batch(&mut ctx).await {
                tracing::warn!(handler, count, error = %e, "batch handler failed, nacking batch");
                ctx.nack_all();
            }

            let (acks, nacks) = ctx.into_outcome();
            if let Err(e) = self.consumer.finalize_batch(&acks, &nacks).await {
                tracing::error!(handler, error = %e, "finalize batch failed, stopping subscription");
                return Err(e);
            }
        }
        Ok(())
    }
}

/// 订阅运行句柄：用于优雅关闭与等待任务结束
pub struct SubscriptionHandle {
    token: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl SubscriptionHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    pub async fn join(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ConsumerError::SubscriptionTask {
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ordstream_broker::message::Message;
    use serde_json::json;
    use std::sync::Mutex;

    fn ctx(seq: i64) -> MessageContext {
        MessageContext::primary(
            Message::builder()
                .topic("orders")
                .key("acct-1")
                .sequence_id(seq)
                .publish_time(Utc::now())
                .payload(json!({}))
                .build(),
        )
    }

    /// 按预置脚本返回批次，记录回报结果
    struct ScriptedConsumer {
        batches: Mutex<Vec<Vec<MessageContext>>>,
        finalized: Mutex<Vec<(Vec<i64>, Vec<i64>)>>,
        disposed: Mutex<usize>,
    }

    #[async_trait]
    impl TopicBatchConsumer for ScriptedConsumer {
        async fn next_batch(&self, _cancel: &CancellationToken) -> Result<Vec<MessageContext>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Err(ConsumerError::failure_state("script exhausted"));
            }
            Ok(batches.remove(0))
        }

        async fn finalize_batch(&self, acks: &[MessageContext], nacks: &[MessageContext]) -> Result<()> {
            let seqs = |l: &[MessageContext]| l.iter().map(|m| m.sequence_id()).collect::<Vec<_>>();
            self.finalized.lock().unwrap().push((seqs(acks), seqs(nacks)));
            Ok(())
        }

        async fn dispose(&self) -> Result<()> {
            *self.disposed.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct NackEven;

    #[async_trait]
    impl BatchHandler for NackEven {
        async fn on_batch(&self, ctx: &mut SubscriptionContext) -> anyhow::Result<()> {
            let even: Vec<MessageContext> = ctx
                .messages()
                .iter()
                .filter(|m| m.sequence_id() % 2 == 0)
                .cloned()
                .collect();
            for m in &even {
                ctx.nack(m);
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl BatchHandler for Failing {
        async fn on_batch(&self, _ctx: &mut SubscriptionContext) -> anyhow::Result<()> {
            anyhow::bail!("downstream unavailable")
        }
    }

    fn scripted(batches: Vec<Vec<MessageContext>>) -> Arc<ScriptedConsumer> {
        Arc::new(ScriptedConsumer {
            batches: Mutex::new(batches),
            finalized: Mutex::new(Vec::new()),
            disposed: Mutex::new(0),
        })
    }

    #[tokio::test]
    async fn routes_outcome_and_stops_on_fatal_error() {
        let consumer = scripted(vec![vec![ctx(1), ctx(2), ctx(3)], vec![]]);
        let engine = Arc::new(
            SubscriptionEngine::builder()
                .consumer(consumer.clone())
                .handler(Arc::new(NackEven))
                .build(),
        );

        let err = engine.start().join().await.unwrap_err();
        assert!(matches!(err, ConsumerError::FailureState { .. }));
        assert_eq!(
            *consumer.finalized.lock().unwrap(),
            vec![(vec![1, 3], vec![2])]
        );
        assert_eq!(*consumer.disposed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn handler_error_nacks_whole_batch() {
        let consumer = scripted(vec![vec![ctx(1), ctx(2)]]);
        let engine = Arc::new(
            SubscriptionEngine::builder()
                .consumer(consumer.clone())
                .handler(Arc::new(Failing))
                .build(),
        );

        let _ = engine.start().join().await;
        assert_eq!(
            *consumer.finalized.lock().unwrap(),
            vec![(vec![], vec![1, 2])]
        );
    }

    #[tokio::test]
    async fn shutdown_stops_idle_loop() {
        let consumer = scripted((0..10_000).map(|_| Vec::new()).collect());
        let engine = Arc::new(
            SubscriptionEngine::builder()
                .consumer(consumer.clone())
                .handler(Arc::new(NackEven))
                .build(),
        );

        let handle = engine.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown();
        handle.join().await.unwrap();
        assert_eq!(*consumer.disposed.lock().unwrap(), 1);
    }
}
