//! 按 key 保序的消费子系统（ordstream-consumer）
//!
//! broker 的否认确认会把失败消息排到同 key 后续消息之后重投，破坏 key 内顺序。
//! 本 crate 在 broker 协议之上提供保序消费：
//! - 失败状态（`failure`）：按 key 记录失败与退避，持久化到控制 topic；
//! - 主订阅（`primary`）：正常投递，跳过仍在恢复中的 key；
//! - 失败重放（`retry`）：对到期 key 按位点从失败处重新读取；
//! - 编排（`ordered`）：在两个阶段间交替取批次；
//! - 订阅驱动（`subscription`）：把批次交给处理器并回报结果。
//!
pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod failure;
pub mod message_context;
pub mod ordered;
pub mod primary;
pub mod retry;
pub mod retry_schedule;
pub mod subscription;

pub use batch::TopicBatchConsumer;
pub use config::{DeadLetterPolicy, SubscriptionConfig};
pub use error::{ConsumerError, ConsumerResult};
pub use message_context::{DeliverySource, MessageContext};
pub use ordered::OrderGuaranteedConsumer;
pub use subscription::{BatchHandler, SubscriptionContext, SubscriptionEngine, SubscriptionHandle};
