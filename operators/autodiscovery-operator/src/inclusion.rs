//! 资源纳入过滤
//!
//! 根据配置的纳入方式以及命名空间/Service 上的启用注解，
//! 判断某个 Service 是否应被自动发现处理。

use autodiscovery_common::config::ENABLED_ANNOTATION;
use autodiscovery_common::InclusionMode;
use kube::ResourceExt;

/// 资源是否带有启用注解
fn is_enabled<K: ResourceExt>(resource: &K) -> bool {
    resource
        .annotations()
        .get(ENABLED_ANNOTATION)
        .map(|value| value == "true")
        .unwrap_or(false)
}

/// Service 是否应被处理
pub fn is_included<S, N>(mode: InclusionMode, service: &S, namespace: &N) -> bool
where
    S: ResourceExt,
    N: ResourceExt,
{
    match mode {
        InclusionMode::ScopeCluster => true,
        InclusionMode::EnabledPerNamespace => is_enabled(namespace),
        InclusionMode::EnabledPerResource => is_enabled(service),
    }
}
