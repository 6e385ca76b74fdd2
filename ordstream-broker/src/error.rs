//! broker 层统一错误定义
//!
//! 聚焦序列化、传输与资源三类最小必要集合，便于上层按
//! “瞬时错误 / 关闭竞争 / 致命错误” 进行分类处理。
//!
use thiserror::Error;

/// 统一错误类型（broker 协议最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 传输 ---
    #[error("broker error: {reason}")]
    Broker { reason: String },
    #[error("broker timeout: operation={operation}")]
    Timeout { operation: String },
    #[error("broker disconnected: {reason}")]
    Disconnected { reason: String },
    #[error("already closed: {resource}")]
    AlreadyClosed { resource: String },

    // --- 资源 ---
    #[error("topic not found: {topic}")]
    TopicNotFound { topic: String },
    #[error("subscription not found: topic={topic}, subscription={subscription}")]
    SubscriptionNotFound { topic: String, subscription: String },
    #[error("unknown message: topic={topic}, sequence_id={sequence_id}")]
    UnknownMessage { topic: String, sequence_id: i64 },
    #[error("invalid position: {reason}")]
    InvalidPosition { reason: String },
}

/// 统一 Result 类型别名
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    pub fn broker(reason: impl Into<String>) -> Self {
        BrokerError::Broker {
            reason: reason.into(),
        }
    }

    pub fn already_closed(resource: impl Into<String>) -> Self {
        BrokerError::AlreadyClosed {
            resource: resource.into(),
        }
    }

    /// 超时与断连属于瞬时错误：调用方返回空批次并等待下一轮即可
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. } | BrokerError::Disconnected { .. }
        )
    }

    /// 关闭竞争：对已关闭资源的操作
    pub fn is_already_closed(&self) -> bool {
        matches!(self, BrokerError::AlreadyClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(
            BrokerError::Timeout {
                operation: "batch_receive".into()
            }
            .is_transient()
        );
        assert!(
            BrokerError::Disconnected {
                reason: "reset".into()
            }
            .is_transient()
        );
        assert!(!BrokerError::broker("boom").is_transient());
        assert!(BrokerError::already_closed("consumer").is_already_closed());
        assert!(!BrokerError::already_closed("consumer").is_transient());
    }
}
