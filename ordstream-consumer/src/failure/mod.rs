//! 失败状态（Failure State）
//!
//! - `state`：`TopicState` / `StreamState` 数据模型；
//! - `log`：控制 topic 持久化协议及其 broker 实现；
//! - `topic`：内存索引 + 日志的写穿缓存；
//! - `stream_failure`：到期查询与成功/失败转换。
//!
mod log;
mod state;
mod stream_failure;
mod topic;

pub use log::{FailureStateLog, TopicFailureStateLog};
pub use state::{StreamState, TopicState, TopicStream};
pub use stream_failure::StreamFailureState;
pub use topic::FailureStateTopic;
