//! 错误处理模块
//!
//! 区分可重试的集群访问错误、写入错误与配置错误，
//! 由协调器决定是短时间重试还是等待下一次被动协调。

use thiserror::Error;

/// Operator 错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 读取或列举资源失败
    #[error("Kubernetes API 错误 ({operation}): {source}")]
    Kube {
        /// 正在执行的操作
        operation: &'static str,
        /// 原始错误
        #[source]
        source: kube::Error,
    },

    /// 超过本次协调的截止时间
    #[error("{operation} 超时")]
    Timeout {
        /// 正在执行的操作
        operation: &'static str,
    },

    /// 创建或更新 ScheduledScan 失败
    #[error("写入 ScheduledScan {name} 失败: {source}")]
    Write {
        /// ScheduledScan 名称
        name: String,
        /// 原始错误
        #[source]
        source: kube::Error,
    },

    /// 同名 ScheduledScan 已被创建
    #[error("ScheduledScan {name} 已存在")]
    AlreadyExists {
        /// ScheduledScan 名称
        name: String,
    },

    /// 更新时资源版本冲突
    #[error("ScheduledScan {name} 已被修改，资源版本冲突")]
    Conflict {
        /// ScheduledScan 名称
        name: String,
    },

    /// 发布事件失败
    #[error("发布事件失败: {0}")]
    Event(#[source] kube::Error),

    /// 配置、模板或序列化错误
    #[error(transparent)]
    Common(#[from] autodiscovery_common::Error),
}

impl Error {
    /// 包装读取类错误
    pub fn kube(operation: &'static str, source: kube::Error) -> Self {
        Error::Kube { operation, source }
    }

    /// 是否可以通过短时间重试恢复
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Common(e) => !e.is_configuration_error(),
            _ => true,
        }
    }

    /// 是否为写入类错误
    pub fn is_write(&self) -> bool {
        matches!(self, Error::Write { .. })
    }
}

/// 判断 Kubernetes API 返回的状态码与原因
pub(crate) fn is_api_status(err: &kube::Error, code: u16, reason: &str) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code && response.reason == reason)
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
