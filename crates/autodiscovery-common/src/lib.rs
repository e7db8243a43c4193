//! Auto-Discovery Common - 服务自动发现共享模型
//!
//! 该模块提供自动发现组件共享的数据结构、配置与错误处理，
//! 包括 HTTP(S) 端口识别、镜像版本指纹以及扫描记录的版本标签。
//! 这里的逻辑不依赖集群连接，可以独立测试。

pub mod config;
pub mod duration;
pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use config::{AutoDiscoveryConfig, InclusionMode, ScanConfig, SHORT_REQUEUE_INTERVAL};
pub use error::Error;
pub use error::Result;
pub use models::fingerprint::*;
pub use models::host_port::*;
pub use models::version_labels::*;
