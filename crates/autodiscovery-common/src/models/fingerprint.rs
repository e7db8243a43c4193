//! 镜像版本指纹
//!
//! 汇总 Service 后端所有 Pod 中每个容器的镜像摘要（digest），
//! 用于判断 Service 是否处于可扫描的稳定状态。滚动发布期间新旧 Pod
//! 的摘要不同，此时不应调度扫描。

use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// 唯一支持的摘要算法前缀
const SHA256_PREFIX: &str = "sha256:";

/// sha256 摘要的十六进制长度
const SHA256_HEX_LEN: usize = 64;

/// 单个容器在所有 Pod 中观察到的摘要及出现次数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestSet {
    occurrences: BTreeMap<String, usize>,
}

impl DigestSet {
    /// 记录一次摘要
    pub fn observe(&mut self, digest: impl Into<String>) {
        *self.occurrences.entry(digest.into()).or_insert(0) += 1;
    }

    /// 所有 Pod 是否对该容器的镜像达成一致
    pub fn is_singleton(&self) -> bool {
        self.occurrences.len() == 1
    }

    /// 唯一的摘要；不唯一时返回 `None`
    pub fn single(&self) -> Option<&str> {
        if self.is_singleton() {
            self.occurrences.keys().next().map(String::as_str)
        } else {
            None
        }
    }

    /// 不同摘要的数量
    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    /// 是否没有任何摘要
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    /// 某个摘要出现的次数
    pub fn occurrences(&self, digest: &str) -> usize {
        self.occurrences.get(digest).copied().unwrap_or(0)
    }
}

/// 容器名到摘要集合的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionFingerprint {
    containers: BTreeMap<String, DigestSet>,
}

impl VersionFingerprint {
    /// 从 Pod 列表计算指纹
    ///
    /// 镜像标识为空或无法解析出 sha256 摘要的容器会被跳过。
    pub fn from_pods(pods: &[Pod]) -> Self {
        let mut fingerprint = Self::default();

        for pod in pods {
            let statuses = pod
                .status
                .as_ref()
                .and_then(|status| status.container_statuses.as_ref());

            for container in statuses.into_iter().flatten() {
                if let Some(digest) = parse_sha256_digest(&container.image_id) {
                    fingerprint.observe(&container.name, digest);
                }
            }
        }

        fingerprint
    }

    /// 记录某个容器的一次摘要
    pub fn observe(&mut self, container: &str, digest: impl Into<String>) {
        self.containers
            .entry(container.to_string())
            .or_default()
            .observe(digest);
    }

    /// 每个容器是否恰好只有一个摘要
    ///
    /// 空指纹视为稳定，是否存在就绪 Pod 由 [`has_ready_pod`] 单独把关。
    pub fn is_stable(&self) -> bool {
        self.containers.values().all(DigestSet::is_singleton)
    }

    /// 稳定状态下每个容器对应的唯一摘要
    pub fn stable_digests(&self) -> Option<BTreeMap<&str, &str>> {
        self.containers
            .iter()
            .map(|(name, digests)| digests.single().map(|digest| (name.as_str(), digest)))
            .collect()
    }

    /// 获取某个容器的摘要集合
    pub fn container(&self, name: &str) -> Option<&DigestSet> {
        self.containers.get(name)
    }

    /// 所有容器摘要集合
    pub fn containers(&self) -> impl Iterator<Item = (&str, &DigestSet)> {
        self.containers.iter().map(|(name, set)| (name.as_str(), set))
    }

    /// 是否没有任何容器
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// 从容器状态中的镜像标识提取 sha256 摘要（不含算法前缀）
///
/// 例如 `docker-pullable://nginx@sha256:f953...` 得到 `f953...`。
pub fn parse_sha256_digest(image_id: &str) -> Option<&str> {
    if image_id.is_empty() {
        return None;
    }

    let (_, prefixed) = image_id.rsplit_once('@')?;
    let hex = prefixed.strip_prefix(SHA256_PREFIX)?;
    let digest = hex.get(..SHA256_HEX_LEN)?;

    if digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest)
    } else {
        None
    }
}

/// 是否至少有一个 Pod 的所有容器都已就绪
///
/// 尚未上报任何容器状态的 Pod 不算就绪。这是有意的严格判断：
/// 没有容器状态说明 Pod 仍在调度或拉取镜像。
pub fn has_ready_pod(pods: &[Pod]) -> bool {
    pods.iter().any(|pod| {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_deref())
            .unwrap_or_default();

        !statuses.is_empty() && statuses.iter().all(|container| container.ready)
    })
}
