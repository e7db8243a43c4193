//! 配置管理模块
//!
//! 该模块负责加载自动发现的配置文件，支持 YAML/JSON 格式，
//! 并在启动时校验所有模板能够被解析。

use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::duration;
use crate::error::{Error, Result};

/// 启用自动发现的注解
pub const ENABLED_ANNOTATION: &str = "auto-discovery.securecodebox.io/enabled";

/// 滚动发布、Pod 未就绪及临时错误时的固定重试间隔
pub const SHORT_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

/// 间隔的最小值，写入 ScheduledScan 的时长只保留到毫秒
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// 自动发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoDiscoveryConfig {
    /// 集群信息，仅用于模板
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// 哪些 Service 会被处理
    #[serde(default)]
    pub resource_inclusion: ResourceInclusionConfig,
    /// Service 自动发现配置
    #[serde(default)]
    pub service_auto_discovery: ServiceAutoDiscoveryConfig,
    /// 单次协调的截止时间
    #[serde(default = "default_reconcile_timeout", with = "duration")]
    pub reconcile_timeout: Duration,
}

impl Default for AutoDiscoveryConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            resource_inclusion: ResourceInclusionConfig::default(),
            service_auto_discovery: ServiceAutoDiscoveryConfig::default(),
            reconcile_timeout: default_reconcile_timeout(),
        }
    }
}

/// 集群信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// 集群显示名称
    #[serde(default = "default_cluster_name")]
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
        }
    }
}

/// 资源纳入方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InclusionMode {
    /// 命名空间带有启用注解时处理其中所有 Service
    #[default]
    EnabledPerNamespace,
    /// 仅处理带有启用注解的 Service
    EnabledPerResource,
    /// 处理集群内所有 Service
    ScopeCluster,
}

/// 资源纳入配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInclusionConfig {
    /// 纳入方式
    #[serde(default)]
    pub mode: InclusionMode,
}

/// Service 自动发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAutoDiscoveryConfig {
    /// 被动重新协调间隔，也用于等待用户安装 ScanType
    #[serde(default = "default_passive_reconcile_interval", with = "duration")]
    pub passive_reconcile_interval: Duration,
    /// 生成扫描的配置
    #[serde(default)]
    pub scan_config: ScanConfig,
}

impl Default for ServiceAutoDiscoveryConfig {
    fn default() -> Self {
        Self {
            passive_reconcile_interval: default_passive_reconcile_interval(),
            scan_config: ScanConfig::default(),
        }
    }
}

/// 扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// ScanType 名称
    #[serde(default = "default_scan_type")]
    pub scan_type: String,
    /// 参数模板，按顺序渲染，渲染结果为空的参数会被丢弃
    #[serde(default = "default_parameters")]
    pub parameters: Vec<String>,
    /// 重复扫描间隔
    #[serde(default = "default_repeat_interval", with = "duration")]
    pub repeat_interval: Duration,
    /// 注解模板
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// 透传给扫描容器的环境变量
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// 透传给扫描容器的卷
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// 透传给扫描容器的挂载点
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_type: default_scan_type(),
            parameters: default_parameters(),
            repeat_interval: default_repeat_interval(),
            annotations: BTreeMap::new(),
            env: Vec::new(),
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
        }
    }
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

fn default_reconcile_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_passive_reconcile_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scan_type() -> String {
    "zap-baseline-scan".to_string()
}

fn default_parameters() -> Vec<String> {
    vec![
        "-t".to_string(),
        "{{ host.type }}://{{ service.name }}.{{ service.namespace }}.svc:{{ host.port }}".to_string(),
    ]
}

fn default_repeat_interval() -> Duration {
    Duration::from_secs(168 * 3600)
}

impl AutoDiscoveryConfig {
    /// 从文件加载配置，格式由扩展名决定
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(Error::Config(format!(
                    "不支持的配置文件格式 {:?}，仅支持 YAML 或 JSON",
                    path
                )))
            }
        };

        config.validate()?;
        info!("从 {:?} 加载配置成功", path);

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let discovery = &self.service_auto_discovery;
        let scan = &discovery.scan_config;

        if scan.scan_type.trim().is_empty() {
            return Err(Error::Config("scanType 不能为空".to_string()));
        }
        if scan.repeat_interval < MIN_INTERVAL {
            return Err(Error::Config("repeatInterval 不能小于 1s".to_string()));
        }
        if discovery.passive_reconcile_interval < MIN_INTERVAL {
            return Err(Error::Config("passiveReconcileInterval 不能小于 1s".to_string()));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(Error::Config("reconcileTimeout 必须大于 0".to_string()));
        }

        let env = minijinja::Environment::new();
        for (i, template) in scan.parameters.iter().enumerate() {
            env.template_from_str(template)
                .map_err(|e| Error::template(format!("parameter[{i}]"), &e))?;
        }
        for (key, template) in &scan.annotations {
            env.template_from_str(template)
                .map_err(|e| Error::template(format!("annotation[{key}]"), &e))?;
        }

        debug!(
            "配置校验通过: scanType={}, 参数模板 {} 个, 注解模板 {} 个",
            scan.scan_type,
            scan.parameters.len(),
            scan.annotations.len()
        );

        Ok(())
    }

    /// 当前使用的扫描配置
    pub fn scan_config(&self) -> &ScanConfig {
        &self.service_auto_discovery.scan_config
    }

    /// 被动重新协调间隔
    pub fn passive_reconcile_interval(&self) -> Duration {
        self.service_auto_discovery.passive_reconcile_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
cluster:
  name: staging
resourceInclusion:
  mode: scope-cluster
serviceAutoDiscovery:
  passiveReconcileInterval: 2m
  scanConfig:
    scanType: nikto
    repeatInterval: 24h
    parameters:
      - "-h"
      - "{{ host.type }}://{{ service.name }}"
    annotations:
      defectdojo.securecodebox.io/product-name: "{{ cluster.name }} | {{ namespace.name }}"
"#;

    #[test]
    fn test_defaults() {
        let config = AutoDiscoveryConfig::default();
        assert_eq!(config.cluster.name, "kubernetes");
        assert_eq!(config.resource_inclusion.mode, InclusionMode::EnabledPerNamespace);
        assert_eq!(config.passive_reconcile_interval(), Duration::from_secs(60));
        assert_eq!(config.scan_config().scan_type, "zap-baseline-scan");
        assert_eq!(config.scan_config().repeat_interval, Duration::from_secs(168 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config: AutoDiscoveryConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.cluster.name, "staging");
        assert_eq!(config.resource_inclusion.mode, InclusionMode::ScopeCluster);
        assert_eq!(config.passive_reconcile_interval(), Duration::from_secs(120));
        assert_eq!(config.scan_config().scan_type, "nikto");
        assert_eq!(config.scan_config().parameters.len(), 2);
        assert_eq!(config.scan_config().annotations.len(), 1);
        assert_eq!(config.reconcile_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("auto-discovery-{}.yaml", std::process::id()));
        std::fs::File::create(&path)
            .and_then(|mut file| file.write_all(SAMPLE.as_bytes()))
            .unwrap();

        let config = AutoDiscoveryConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.cluster.name, "staging");
    }

    #[test]
    fn test_unknown_extension() {
        let err = AutoDiscoveryConfig::load("/tmp/auto-discovery.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Config(_)));
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.parameters = vec!["{{ host.port ".to_string()];

        let err = config.validate().unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("parameter[0]"));
    }

    #[test]
    fn test_sub_second_interval_is_rejected() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.repeat_interval = Duration::from_micros(500);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.passive_reconcile_interval = Duration::from_millis(999);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.repeat_interval = Duration::from_secs(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.repeat_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
