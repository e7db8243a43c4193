//! 数据模型模块
//!
//! 端口分类、版本指纹与版本标签。均为单次协调内重新计算的临时数据。

pub mod fingerprint;
pub mod host_port;
pub mod version_labels;
