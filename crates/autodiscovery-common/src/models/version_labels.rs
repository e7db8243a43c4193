//! 版本标签与身份键
//!
//! 标签和命名规则需与已有的扫描记录保持兼容，不可随意修改。

use std::collections::BTreeMap;

use crate::models::fingerprint::VersionFingerprint;

/// 目标 Service 名称标签
pub const TARGET_SERVICE_LABEL: &str = "auto-discovery.securecodebox.io/target-service";

/// 目标端口标签
pub const TARGET_PORT_LABEL: &str = "auto-discovery.securecodebox.io/target-port";

/// 容器摘要标签前缀，后接容器名
pub const DIGEST_LABEL_PREFIX: &str = "digest.auto-discovery.securecodebox.io/";

/// 标签值的最大长度
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// 由 Service 名称与端口得到的扫描记录身份键
pub fn identity_key(service_name: &str, port: i32) -> String {
    format!("{service_name}-service-port-{port}")
}

/// 描述某个 (Service, 端口, 版本) 的标签集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLabelSet {
    labels: BTreeMap<String, String>,
}

impl VersionLabelSet {
    /// 构造版本标签
    ///
    /// 指纹中摘要不唯一的容器不会出现在标签中；调用方应在指纹稳定后再调用。
    pub fn new(service_name: &str, port: i32, fingerprint: &VersionFingerprint) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(TARGET_SERVICE_LABEL.to_string(), service_name.to_string());
        labels.insert(TARGET_PORT_LABEL.to_string(), port.to_string());

        for (container, digests) in fingerprint.containers() {
            if let Some(digest) = digests.single() {
                labels.insert(
                    format!("{DIGEST_LABEL_PREFIX}{container}"),
                    truncate_label_value(digest).to_string(),
                );
            }
        }

        Self { labels }
    }

    /// 标签映射
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// 转换为标签映射
    pub fn into_labels(self) -> BTreeMap<String, String> {
        self.labels
    }
}

/// 截断到标签值允许的最大长度
fn truncate_label_value(value: &str) -> &str {
    match value.char_indices().nth(MAX_LABEL_VALUE_LEN) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
