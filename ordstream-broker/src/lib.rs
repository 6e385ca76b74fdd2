//! 分区式发布/订阅 broker 协议层（ordstream-broker）
//!
//! 提供按 key 有序消费所需的最小 broker 抽象：
//! - 消息模型（`message`）：消息、消息位点与读取位置；
//! - key 哈希空间（`key_hash`）：key-shared 订阅下的哈希区间归属；
//! - broker 协议（`broker`）：管理、订阅消费、位点读取、发布与区间查询；
//! - 内存实现（`memory`）：满足全部协议的进程内 broker，用于测试与本地开发。
//!
//! 本 crate 仅定义协议与内存实现，不绑定具体传输，
//! 上层消费子系统只依赖这里的 trait。
//!
pub mod broker;
pub mod error;
pub mod key_hash;
#[cfg(feature = "memory")]
pub mod memory;
pub mod message;
