//! 错误处理模块
//!
//! 该模块提供自动发现组件共享的错误类型。配置错误与模板错误属于
//! 需要人工介入的错误，其余为序列化或 I/O 层面的错误。

use std::io;
use thiserror::Error;

/// 自动发现统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 模板解析或渲染错误
    #[error("模板 '{name}' 渲染失败: {message}")]
    Template {
        /// 模板名称，例如 `parameter[1]` 或 `annotation[team]`
        name: String,
        /// 模板引擎给出的错误信息
        message: String,
    },

    /// 序列化/反序列化错误
    #[error("序列化/反序列化错误: {0}")]
    Serialization(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// 由模板引擎错误构造模板错误
    pub fn template(name: impl Into<String>, err: &minijinja::Error) -> Self {
        Error::Template {
            name: name.into(),
            message: err.to_string(),
        }
    }

    /// 是否为需要修改配置才能恢复的错误
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Template { .. })
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
