//! 共享库
//!
//! 包含服务共用的配置加载和可观测性初始化代码。

pub mod config;
pub mod observability;
