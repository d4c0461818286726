//! 内存后端模块
//! Memory backend module
//!
//! 提供基于内存的数据存储与消息 broker，适用于测试、开发和单进程嵌入
//! Provides in-memory datastore and message broker, for tests, development and single-process embedding

pub mod broker;
pub mod datastore;

pub use broker::MemoryBroker;
pub use datastore::MemoryDatastore;
