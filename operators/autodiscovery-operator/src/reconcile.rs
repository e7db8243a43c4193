//! 资源协调模块
//!
//! 该模块针对单个 Service 决定是否需要（重新）调度安全扫描：
//! 识别 HTTP(S) 端口，确认后端 Pod 镜像版本一致且至少有一个 Pod 就绪，
//! 然后对每个端口跳过、新建或强制重新扫描。
//!
//! 每次协调都从集群重新读取状态，不保留任何上一次协调的中间结果。

use autodiscovery_common::{
    has_ready_pod, host_ports, identity_key, AutoDiscoveryConfig, HostPort, VersionFingerprint,
    VersionLabelSet, SHORT_REQUEUE_INTERVAL,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::crd::ScheduledScan;
use crate::error::{Error, Result};
use crate::inclusion::is_included;
use crate::resolver::{Resolution, ScanRecordResolver};
use crate::spec_generator::SpecGenerator;
use crate::store::{ClusterStore, Deadline};

/// 回拨上次调度时间时额外减去的时长，容忍两个控制器之间的时钟偏差
pub const CLOCK_SKEW_MARGIN: Duration = Duration::from_secs(24 * 3600);

/// 缺少 ScanType 时的事件原因
pub const SCAN_TYPE_MISSING_REASON: &str = "ScanTypeMissing";

/// 扫描模板无法渲染时的事件原因
pub const SCAN_CONFIG_INVALID_REASON: &str = "ScanConfigInvalid";

/// 一次协调请求
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    /// Service 名称
    pub name: String,
    /// Service 所在命名空间
    pub namespace: String,
    /// 截止时间
    pub deadline: Instant,
}

impl ReconcileRequest {
    /// 创建协调请求，截止时间为当前时间加上 `timeout`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            deadline: Instant::now() + timeout,
        }
    }
}

/// 协调结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 结束，等待下一次变更事件
    Done,
    /// 在指定时长后重新协调
    RequeueAfter(Duration),
}

/// 单个端口的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDecision {
    /// 当前版本已扫描，或扫描记录已被并发创建
    Skip,
    /// 新建了扫描记录
    Created,
    /// 更新了旧版本的扫描记录并触发立即扫描
    Rescanned,
    /// 命名空间内缺少配置的 ScanType
    ScanTypeMissing,
    /// 扫描模板渲染失败
    InvalidTemplate,
    /// 更新时资源版本冲突，需要基于最新状态重试
    Conflict,
}

/// 协调器
pub struct ReconcileEngine<S> {
    /// 集群状态访问
    store: S,
    /// 自动发现配置
    config: Arc<AutoDiscoveryConfig>,
}

impl<S: ClusterStore> ReconcileEngine<S> {
    /// 创建新的协调器
    pub fn new(store: S, config: Arc<AutoDiscoveryConfig>) -> Self {
        Self { store, config }
    }

    /// 集群状态访问
    pub fn store(&self) -> &S {
        &self.store
    }

    /// 协调单个 Service
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<Outcome> {
        let deadline = Deadline::new(request.deadline);
        let ns = request.namespace.as_str();
        let name = request.name.as_str();
        let passive = self.config.passive_reconcile_interval();

        debug!("协调 Service {}/{}", ns, name);

        let Some(service) = deadline
            .run("读取 Service", self.store.get_service(ns, name))
            .await?
        else {
            debug!("Service {}/{} 不存在，结束协调", ns, name);
            return Ok(Outcome::Done);
        };

        let Some(namespace) = deadline
            .run("读取命名空间", self.store.get_namespace(ns))
            .await?
        else {
            debug!("命名空间 {} 不存在，结束协调", ns);
            return Ok(Outcome::Done);
        };

        if !is_included(self.config.resource_inclusion.mode, &service, &namespace) {
            debug!("Service {}/{} 未启用自动发现", ns, name);
            return Ok(Outcome::Done);
        }

        let spec = service.spec.as_ref();
        let hosts = host_ports(spec.and_then(|s| s.ports.as_deref()).unwrap_or_default());
        if hosts.is_empty() {
            debug!("Service {}/{} 没有 HTTP(S) 端口", ns, name);
            return Ok(Outcome::Done);
        }

        let Some(selector) = spec
            .and_then(|s| s.selector.as_ref())
            .filter(|selector| !selector.is_empty())
        else {
            debug!("Service {}/{} 没有 Pod 选择器，无法确定版本", ns, name);
            return Ok(Outcome::RequeueAfter(passive));
        };

        let pods = deadline
            .run("列举 Pod", self.store.list_pods(ns, selector))
            .await?;

        let fingerprint = VersionFingerprint::from_pods(&pods);
        if !fingerprint.is_stable() {
            info!(
                "Service {}/{} 的 Pod 镜像摘要不一致，可能正在发布，稍后重试",
                ns, name
            );
            return Ok(Outcome::RequeueAfter(SHORT_REQUEUE_INTERVAL));
        }

        if !has_ready_pod(&pods) {
            info!("Service {}/{} 没有就绪的 Pod，稍后重试", ns, name);
            return Ok(Outcome::RequeueAfter(SHORT_REQUEUE_INTERVAL));
        }

        let generator = SpecGenerator::new(&self.config);
        let mut write_error = None;
        let mut scan_type_missing = false;
        let mut retry_soon = false;

        for host in hosts {
            let decision = self
                .reconcile_port(&deadline, &service, &namespace, host, &fingerprint, &generator)
                .await;

            match decision {
                Ok(PortDecision::ScanTypeMissing) => {
                    scan_type_missing = true;
                    break;
                }
                Ok(PortDecision::Conflict) => retry_soon = true,
                Ok(decision) => {
                    debug!("Service {}/{} 端口 {}: {:?}", ns, name, host.port, decision)
                }
                Err(e) if e.is_write() => {
                    error!("Service {}/{} 端口 {} 写入失败: {}", ns, name, host.port, e);
                    write_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(e) = write_error {
            return Err(e);
        }

        if retry_soon {
            return Ok(Outcome::RequeueAfter(SHORT_REQUEUE_INTERVAL));
        }

        if scan_type_missing {
            debug!("等待用户安装 ScanType，{:?} 后重新检查", passive);
        }

        Ok(Outcome::RequeueAfter(passive))
    }

    /// 处理单个端口
    async fn reconcile_port(
        &self,
        deadline: &Deadline,
        service: &Service,
        namespace: &Namespace,
        host: HostPort,
        fingerprint: &VersionFingerprint,
        generator: &SpecGenerator<'_>,
    ) -> Result<PortDecision> {
        let ns = service.namespace().unwrap_or_default();
        let service_name = service.name_any();
        let labels = VersionLabelSet::new(&service_name, host.port, fingerprint);

        let resolution = ScanRecordResolver::new(&self.store, *deadline)
            .resolve(&ns, &service_name, host.port, &labels)
            .await?;

        match resolution {
            Resolution::AlreadyScanned => {
                debug!(
                    "Service {}/{} 端口 {} 的当前版本已扫描，跳过",
                    ns, service_name, host.port
                );
                Ok(PortDecision::Skip)
            }
            Resolution::CreateNew => {
                self.create_scan(deadline, service, namespace, host, labels, generator)
                    .await
            }
            Resolution::Rescan(previous) => {
                self.rescan(deadline, service, namespace, host, labels, *previous, generator)
                    .await
            }
        }
    }

    /// 为从未扫描过的端口创建 ScheduledScan
    async fn create_scan(
        &self,
        deadline: &Deadline,
        service: &Service,
        namespace: &Namespace,
        host: HostPort,
        labels: VersionLabelSet,
        generator: &SpecGenerator<'_>,
    ) -> Result<PortDecision> {
        let ns = service.namespace().unwrap_or_default();
        let service_name = service.name_any();
        let scan_type = &self.config.scan_config().scan_type;

        let exists = deadline
            .run("读取 ScanType", self.store.scan_type_exists(&ns, scan_type))
            .await?;
        if !exists {
            let note = format!(
                "Namespace requires ScanType '{}' to properly start automatic scans.",
                scan_type
            );
            warn!("命名空间 {} 缺少 ScanType '{}'，无法自动扫描 Service {}", ns, scan_type, service_name);
            self.warn(deadline, service, SCAN_TYPE_MISSING_REASON, &note).await;
            return Ok(PortDecision::ScanTypeMissing);
        }

        let generated = match generator.generate(service, namespace, host) {
            Ok(generated) => generated,
            Err(e) => return Ok(self.invalid_template(deadline, service, host, e).await),
        };

        let scan = ScheduledScan {
            metadata: ObjectMeta {
                name: Some(identity_key(&service_name, host.port)),
                namespace: Some(ns.clone()),
                labels: Some(labels.into_labels()),
                annotations: Some(generated.annotations),
                ..Default::default()
            },
            spec: generated.spec,
            status: None,
        };

        match deadline
            .run("创建 ScheduledScan", self.store.create_scheduled_scan(&scan))
            .await
        {
            Ok(created) => {
                info!(
                    "发现未扫描的 Service {}/{}，已创建 ScheduledScan {}",
                    ns,
                    service_name,
                    created.name_any()
                );
                Ok(PortDecision::Created)
            }
            Err(Error::AlreadyExists { name }) => {
                info!("ScheduledScan {}/{} 已被并发创建，跳过", ns, name);
                Ok(PortDecision::Skip)
            }
            Err(e) => Err(e),
        }
    }

    /// 用当前版本覆盖已有的 ScheduledScan，并回拨上次调度时间以立即触发扫描
    #[allow(clippy::too_many_arguments)]
    async fn rescan(
        &self,
        deadline: &Deadline,
        service: &Service,
        namespace: &Namespace,
        host: HostPort,
        labels: VersionLabelSet,
        mut scan: ScheduledScan,
        generator: &SpecGenerator<'_>,
    ) -> Result<PortDecision> {
        let ns = service.namespace().unwrap_or_default();
        let name = scan.name_any();

        let generated = match generator.generate(service, namespace, host) {
            Ok(generated) => generated,
            Err(e) => return Ok(self.invalid_template(deadline, service, host, e).await),
        };

        let previous_labels = scan.metadata.labels.clone();
        scan.metadata.annotations = Some(generated.annotations);
        scan.spec = generated.spec;

        // 版本标签最后写入，前面任一步失败时下次协调仍会按旧版本重新执行
        match deadline
            .run("更新 ScheduledScan", self.store.replace_scheduled_scan(&scan))
            .await
        {
            Ok(_) => {}
            Err(Error::Conflict { .. }) => {
                info!("ScheduledScan {}/{} 已被修改，稍后基于最新状态重试", ns, name);
                return Ok(PortDecision::Conflict);
            }
            Err(e) => return Err(e),
        }

        let backdated = backdated_schedule_time(Utc::now(), self.config.scan_config().repeat_interval);
        debug!(
            "将 ScheduledScan {}/{} 的上次调度时间从 {:?} 改为 {}",
            ns,
            name,
            scan.status.as_ref().and_then(|s| s.last_schedule_time),
            backdated
        );

        self.write_with_retry(deadline, "更新 ScheduledScan 状态", &name, || {
            self.store.update_last_schedule_time(&ns, &name, backdated)
        })
        .await?;

        let patch = label_patch(previous_labels.as_ref(), labels.into_labels());
        self.write_with_retry(deadline, "更新 ScheduledScan 标签", &name, || {
            self.store.update_labels(&ns, &name, &patch)
        })
        .await?;

        info!(
            "Service {}/{} 已更新版本，ScheduledScan {} 将立即重新扫描",
            ns,
            service.name_any(),
            name
        );

        Ok(PortDecision::Rescanned)
    }

    /// 写入失败时原地重试一次
    async fn write_with_retry<T, F, Fut>(
        &self,
        deadline: &Deadline,
        operation: &'static str,
        name: &str,
        write: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match deadline.run(operation, write()).await {
            Err(e) if e.is_write() => {
                warn!("{} {} 失败，重试一次: {}", operation, name, e);
                deadline.run(operation, write()).await
            }
            result => result,
        }
    }

    /// 模板错误只影响当前端口
    async fn invalid_template(
        &self,
        deadline: &Deadline,
        service: &Service,
        host: HostPort,
        err: autodiscovery_common::Error,
    ) -> PortDecision {
        error!(
            "Service {}/{} 端口 {} 的扫描配置渲染失败: {}",
            service.namespace().unwrap_or_default(),
            service.name_any(),
            host.port,
            err
        );

        let note = format!("Failed to render scan configuration for port {}: {}", host.port, err);
        self.warn(deadline, service, SCAN_CONFIG_INVALID_REASON, &note).await;

        PortDecision::InvalidTemplate
    }

    /// 发布警告事件，失败只记录日志
    async fn warn(&self, deadline: &Deadline, service: &Service, reason: &str, note: &str) {
        if let Err(e) = deadline
            .run("发布事件", self.store.publish_warning(service, reason, note))
            .await
        {
            warn!("在 Service {} 上发布事件 {} 失败: {}", service.name_any(), reason, e);
        }
    }
}

/// 由旧标签与新标签计算合并补丁，旧标签中多余的键被删除
fn label_patch(
    previous: Option<&BTreeMap<String, String>>,
    next: BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut patch: BTreeMap<String, Option<String>> = previous
        .into_iter()
        .flatten()
        .filter(|(key, _)| !next.contains_key(*key))
        .map(|(key, _)| (key.clone(), None))
        .collect();

    patch.extend(next.into_iter().map(|(key, value)| (key, Some(value))));
    patch
}

/// 计算回拨后的上次调度时间：当前时间减去重复间隔再减去时钟偏差余量
pub fn backdated_schedule_time(now: DateTime<Utc>, repeat_interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(repeat_interval + CLOCK_SKEW_MARGIN)
        .ok()
        .and_then(|offset| now.checked_sub_signed(offset))
        .unwrap_or_default()
}
