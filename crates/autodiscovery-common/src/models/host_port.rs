//! HTTP(S) 端口识别
//!
//! 根据端口号和端口名称启发式地判断 Service 的哪些端口可能提供 HTTP(S) 服务，
//! 并为其确定访问协议。

use k8s_openapi::api::core::v1::ServicePort;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 常见的 HTTP(S) 端口
pub const LIKELY_HTTP_PORTS: [i32; 7] = [
    80, 443, 8080, 8443,
    // Node.js
    3000,
    // Flask
    5000,
    // Django
    8000,
];

/// 访问协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// 明文 HTTP
    Http,
    /// HTTPS
    Https,
}

impl Scheme {
    /// 协议字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已分类的端点，仅在单次协调中使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    /// 端口号
    pub port: i32,
    /// 协议，模板中以 `host.type` 访问
    #[serde(rename = "type")]
    pub scheme: Scheme,
}

impl HostPort {
    /// 对单个端口进行分类
    pub fn classify(port: &ServicePort) -> Self {
        let name = port.name.as_deref();
        let scheme = if port.port == 443 || port.port == 8443 || name == Some("https") {
            Scheme::Https
        } else {
            Scheme::Http
        };

        Self {
            port: port.port,
            scheme,
        }
    }
}

/// 端口是否可能提供 HTTP(S) 服务
pub fn is_likely_http(port: &ServicePort) -> bool {
    LIKELY_HTTP_PORTS.contains(&port.port)
        || matches!(port.name.as_deref(), Some("http") | Some("https"))
}

/// 按声明顺序返回可能提供 HTTP(S) 服务的端口
pub fn likely_http_ports(ports: &[ServicePort]) -> Vec<&ServicePort> {
    ports.iter().filter(|port| is_likely_http(port)).collect()
}

/// 返回可能提供 HTTP(S) 服务的端口及其协议
///
/// 结果为空时调用方应将该 Service 视为不需要扫描，这不是错误。
pub fn host_ports(ports: &[ServicePort]) -> Vec<HostPort> {
    likely_http_ports(ports)
        .into_iter()
        .map(HostPort::classify)
        .collect()
}
