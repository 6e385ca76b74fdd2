//! 批次来源协议
//!
//! 由一个驱动循环顺序调用：`next_batch` 取批次，处理后以
//! `finalize_batch` 回报确认/否认，二者不会并发。
//!
use crate::error::ConsumerResult as Result;
use crate::message_context::MessageContext;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait TopicBatchConsumer: Send + Sync {
    /// 取下一批消息；取消或超时返回空批次
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<MessageContext>>;

    /// 对上一次 `next_batch` 的结果回报处理结果，每条消息恰好出现在其中一个列表
    async fn finalize_batch(&self, acks: &[MessageContext], nacks: &[MessageContext]) -> Result<()>;

    /// 释放底层 broker 资源；可重复调用
    async fn dispose(&self) -> Result<()>;
}

/// 可取消的暂停
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
