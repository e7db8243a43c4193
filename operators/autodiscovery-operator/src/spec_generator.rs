//! 扫描规范生成器
//!
//! 该模块根据配置中的模板为某个 (Service, 端口) 生成 ScheduledScan 的
//! 参数与注解。每次渲染都使用独立构造的模板上下文，不依赖全局状态。

use autodiscovery_common::config::ClusterConfig;
use autodiscovery_common::{AutoDiscoveryConfig, Error, HostPort, Result, ScanConfig};
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::ObjectMeta;
use minijinja::{Environment, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::crd::{ScanSpec, ScheduledScanSpec};

/// 模板上下文版本
pub const TEMPLATE_CONTEXT_VERSION: u32 = 1;

/// 需要从 Service 透传到扫描上的注解
static PASSTHROUGH_ANNOTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*securecodebox\.io/.*").expect("注解匹配正则无效"));

static EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();

/// 资源元数据在模板中的视图
#[derive(Debug, Serialize)]
pub struct ObjectContext<'a> {
    /// 名称
    pub name: &'a str,
    /// 所在命名空间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<&'a str>,
    /// 标签
    pub labels: &'a BTreeMap<String, String>,
    /// 注解
    pub annotations: &'a BTreeMap<String, String>,
}

impl<'a> ObjectContext<'a> {
    fn from_meta(meta: &'a ObjectMeta) -> Self {
        Self {
            name: meta.name.as_deref().unwrap_or_default(),
            namespace: meta.namespace.as_deref(),
            labels: meta.labels.as_ref().unwrap_or(&EMPTY_MAP),
            annotations: meta.annotations.as_ref().unwrap_or(&EMPTY_MAP),
        }
    }
}

/// 单次渲染的模板上下文
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContext<'a> {
    /// 上下文版本
    pub version: u32,
    /// 集群信息
    pub cluster: &'a ClusterConfig,
    /// 完整配置
    pub config: &'a AutoDiscoveryConfig,
    /// 当前使用的扫描配置
    pub scan_config: &'a ScanConfig,
    /// 被扫描的 Service
    pub service: ObjectContext<'a>,
    /// 与 `service` 相同，供注解模板使用
    pub target: ObjectContext<'a>,
    /// Service 所在命名空间
    pub namespace: ObjectContext<'a>,
    /// 被扫描的端点
    pub host: HostPort,
}

impl<'a> TemplateContext<'a> {
    /// 构造模板上下文
    pub fn new(
        config: &'a AutoDiscoveryConfig,
        service: &'a Service,
        namespace: &'a Namespace,
        host: HostPort,
    ) -> Self {
        Self {
            version: TEMPLATE_CONTEXT_VERSION,
            cluster: &config.cluster,
            config,
            scan_config: config.scan_config(),
            service: ObjectContext::from_meta(&service.metadata),
            target: ObjectContext::from_meta(&service.metadata),
            namespace: ObjectContext::from_meta(&namespace.metadata),
            host,
        }
    }
}

/// 生成结果
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedScan {
    /// ScheduledScan 注解
    pub annotations: BTreeMap<String, String>,
    /// ScheduledScan 规范
    pub spec: ScheduledScanSpec,
}

/// 扫描规范生成器
pub struct SpecGenerator<'a> {
    /// 自动发现配置
    config: &'a AutoDiscoveryConfig,
    /// 模板引擎
    env: Environment<'static>,
}

impl<'a> SpecGenerator<'a> {
    /// 创建新的生成器
    pub fn new(config: &'a AutoDiscoveryConfig) -> Self {
        Self {
            config,
            env: Environment::new(),
        }
    }

    /// 为某个端点生成注解与规范
    ///
    /// 任一模板渲染失败都会终止本端点的生成并返回 [`Error::Template`]。
    pub fn generate(
        &self,
        service: &Service,
        namespace: &Namespace,
        host: HostPort,
    ) -> Result<GeneratedScan> {
        let context = TemplateContext::new(self.config, service, namespace, host);
        let context = Value::from_serialize(&context);

        let annotations = self.annotations(service, &context)?;
        let parameters = self.parameters(&context)?;

        let scan_config = self.config.scan_config();
        let spec = ScheduledScanSpec {
            interval: scan_config.repeat_interval,
            scan_spec: ScanSpec {
                scan_type: scan_config.scan_type.clone(),
                parameters,
                env: scan_config.env.clone(),
                volumes: scan_config.volumes.clone(),
                volume_mounts: scan_config.volume_mounts.clone(),
                cascades: None,
            },
            ..Default::default()
        };

        Ok(GeneratedScan { annotations, spec })
    }

    /// 渲染参数模板，空结果被丢弃
    fn parameters(&self, context: &Value) -> Result<Vec<String>> {
        let mut parameters = Vec::new();

        for (i, template) in self.config.scan_config().parameters.iter().enumerate() {
            let rendered = self
                .env
                .render_str(template, context)
                .map_err(|e| Error::template(format!("parameter[{i}]"), &e))?;

            if !rendered.is_empty() {
                parameters.push(rendered);
            }
        }

        Ok(parameters)
    }

    /// 渲染注解模板，再叠加 Service 上的 securecodebox.io 注解
    fn annotations(&self, service: &Service, context: &Value) -> Result<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();

        for (key, template) in &self.config.scan_config().annotations {
            let rendered = self
                .env
                .render_str(template, context)
                .map_err(|e| Error::template(format!("annotation[{key}]"), &e))?;

            if !rendered.is_empty() {
                annotations.insert(key.clone(), rendered);
            }
        }

        for (key, value) in service.metadata.annotations.iter().flatten() {
            if PASSTHROUGH_ANNOTATION.is_match(key) {
                annotations.insert(key.clone(), value.clone());
            }
        }

        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodiscovery_common::Scheme;
    use k8s_openapi::api::core::v1::EnvVar;
    use std::time::Duration;

    fn service(annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("juice-shop".to_string()),
                namespace: Some("shop".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn namespace() -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("shop".to_string()),
                labels: Some([("team".to_string(), "red".to_string())].into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn host() -> HostPort {
        HostPort { port: 3000, scheme: Scheme::Http }
    }

    #[test]
    fn test_default_parameters() {
        let config = AutoDiscoveryConfig::default();
        let generated = SpecGenerator::new(&config)
            .generate(&service(&[]), &namespace(), host())
            .unwrap();

        assert_eq!(
            generated.spec.scan_spec.parameters,
            vec!["-t", "http://juice-shop.shop.svc:3000"]
        );
        assert_eq!(generated.spec.scan_spec.scan_type, "zap-baseline-scan");
        assert_eq!(generated.spec.interval, Duration::from_secs(168 * 3600));
    }

    #[test]
    fn test_empty_parameters_are_dropped() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.parameters = vec![
            "{% if host.type == 'https' %}--tls{% endif %}".to_string(),
            "-p".to_string(),
            "{{ host.port }}".to_string(),
        ];

        let generated = SpecGenerator::new(&config)
            .generate(&service(&[]), &namespace(), host())
            .unwrap();
        assert_eq!(generated.spec.scan_spec.parameters, vec!["-p", "3000"]);
    }

    #[test]
    fn test_annotation_templates_and_passthrough() {
        let mut config = AutoDiscoveryConfig::default();
        config.cluster.name = "prod".to_string();
        config.service_auto_discovery.scan_config.annotations = [
            (
                "defectdojo.securecodebox.io/product-name".to_string(),
                "{{ cluster.name }} | {{ namespace.name }} | {{ target.name }}".to_string(),
            ),
            (
                "defectdojo.securecodebox.io/product-tags".to_string(),
                "{{ namespace.labels.missing }}".to_string(),
            ),
            (
                "team".to_string(),
                "{{ namespace.labels.team }}".to_string(),
            ),
        ]
        .into_iter()
        .collect();

        let service = service(&[("scan.securecodebox.io/foo", "bar"), ("unrelated/foo", "bar")]);
        let generated = SpecGenerator::new(&config)
            .generate(&service, &namespace(), host())
            .unwrap();

        let annotations = generated.annotations;
        assert_eq!(
            annotations["defectdojo.securecodebox.io/product-name"],
            "prod | shop | juice-shop"
        );
        assert_eq!(annotations["team"], "red");
        assert_eq!(annotations["scan.securecodebox.io/foo"], "bar");
        assert!(!annotations.contains_key("unrelated/foo"));
        assert!(!annotations.contains_key("defectdojo.securecodebox.io/product-tags"));
    }

    #[test]
    fn test_service_annotation_overrides_template() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.annotations = [(
            "defectdojo.securecodebox.io/engagement-name".to_string(),
            "generated".to_string(),
        )]
        .into_iter()
        .collect();

        let service = service(&[("defectdojo.securecodebox.io/engagement-name", "manual")]);
        let generated = SpecGenerator::new(&config)
            .generate(&service, &namespace(), host())
            .unwrap();
        assert_eq!(
            generated.annotations["defectdojo.securecodebox.io/engagement-name"],
            "manual"
        );
    }

    #[test]
    fn test_render_error_is_reported() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.parameters =
            vec!["-t".to_string(), "{{ host.port | no_such_filter }}".to_string()];

        let err = SpecGenerator::new(&config)
            .generate(&service(&[]), &namespace(), host())
            .unwrap_err();
        match err {
            Error::Template { name, .. } => assert_eq!(name, "parameter[1]"),
            other => panic!("意外的错误: {other}"),
        }
    }

    #[test]
    fn test_passthrough_fields() {
        let mut config = AutoDiscoveryConfig::default();
        config.service_auto_discovery.scan_config.env = vec![EnvVar {
            name: "ZAP_TIMEOUT".to_string(),
            value: Some("300".to_string()),
            ..Default::default()
        }];

        let generated = SpecGenerator::new(&config)
            .generate(&service(&[]), &namespace(), host())
            .unwrap();
        assert_eq!(generated.spec.scan_spec.env.len(), 1);
        assert_eq!(generated.spec.scan_spec.env[0].name, "ZAP_TIMEOUT");
    }
}
