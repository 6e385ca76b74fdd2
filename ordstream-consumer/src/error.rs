use ordstream_broker::error::BrokerError;

/// 有序消费子系统错误
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("failure state: {reason}")]
    FailureState { reason: String },

    #[error("recovery failed: topic={topic}, stream_id={stream_id}: {source}")]
    RecoveryFailed {
        topic: String,
        stream_id: String,
        #[source]
        source: BrokerError,
    },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("subscription task: {reason}")]
    SubscriptionTask { reason: String },
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

impl ConsumerError {
    pub fn failure_state(reason: impl Into<String>) -> Self {
        ConsumerError::FailureState {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        ConsumerError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// 底层 broker 资源已关闭（关闭竞争）
    pub fn is_already_closed(&self) -> bool {
        matches!(self, ConsumerError::Broker(e) if e.is_already_closed())
    }
}
