//! 集群状态访问
//!
//! 协调器只通过 [`ClusterStore`] 读写集群状态，便于在测试中替换。
//! [`KubeStore`] 是基于 kube-rs 的实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Resource, ResourceExt,
};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::time::Instant;
use tracing::debug;

use crate::crd::{ScanType, ScheduledScan};
use crate::error::{is_api_status, Error, Result};

/// 事件上报者名称
pub const REPORTER_NAME: &str = "auto-discovery";

/// 集群状态读写接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// 读取 Service，不存在时返回 `None`
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// 读取命名空间，不存在时返回 `None`
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// 按标签列举命名空间内的 Pod
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    /// 按标签列举命名空间内的 ScheduledScan
    async fn list_scheduled_scans(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ScheduledScan>>;

    /// 读取 ScheduledScan，不存在时返回 `None`
    async fn get_scheduled_scan(&self, namespace: &str, name: &str)
        -> Result<Option<ScheduledScan>>;

    /// ScanType 是否存在
    async fn scan_type_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// 创建 ScheduledScan，同名资源已存在时返回 [`Error::AlreadyExists`]
    async fn create_scheduled_scan(&self, scan: &ScheduledScan) -> Result<ScheduledScan>;

    /// 更新 ScheduledScan 的标签、注解与规范，版本冲突时返回 [`Error::Conflict`]
    async fn replace_scheduled_scan(&self, scan: &ScheduledScan) -> Result<ScheduledScan>;

    /// 以合并补丁整体替换 ScheduledScan 的标签，值为 `None` 的键会被删除
    async fn update_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<ScheduledScan>;

    /// 更新状态子资源中的上次调度时间
    async fn update_last_schedule_time(
        &self,
        namespace: &str,
        name: &str,
        time: DateTime<Utc>,
    ) -> Result<ScheduledScan>;

    /// 在 Service 上发布一条警告事件
    async fn publish_warning(&self, service: &Service, reason: &str, note: &str) -> Result<()>;
}

/// 本次协调的截止时间
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// 创建截止时间
    pub fn new(at: Instant) -> Self {
        Self(at)
    }

    /// 截止时刻
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// 在截止时间内执行一次集群调用，超时返回 [`Error::Timeout`]
    pub async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.0, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { operation }),
        }
    }
}

/// 基于 kube-rs 的集群状态访问
#[derive(Clone)]
pub struct KubeStore {
    /// Kubernetes 客户端
    client: Client,
    /// 事件上报者
    reporter: Reporter,
}

impl KubeStore {
    /// 创建新的集群状态访问
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER_NAME.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn scheduled_scans(&self, namespace: &str) -> Api<ScheduledScan> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// 等值标签选择器
fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// 写入错误分类
fn write_error(name: String, err: kube::Error) -> Error {
    if is_api_status(&err, 409, "AlreadyExists") {
        Error::AlreadyExists { name }
    } else if is_api_status(&err, 409, "Conflict") {
        Error::Conflict { name }
    } else {
        Error::Write { name, source: err }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube("读取 Service", e))
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube("读取命名空间", e))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(selector));
        let pods = api
            .list(&params)
            .await
            .map_err(|e| Error::kube("列举 Pod", e))?;

        Ok(pods.items)
    }

    async fn list_scheduled_scans(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ScheduledScan>> {
        let params = ListParams::default().labels(&label_selector(labels));
        let scans = self
            .scheduled_scans(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::kube("列举 ScheduledScan", e))?;

        Ok(scans.items)
    }

    async fn get_scheduled_scan(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ScheduledScan>> {
        self.scheduled_scans(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::kube("读取 ScheduledScan", e))
    }

    async fn scan_type_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<ScanType> = Api::namespaced(self.client.clone(), namespace);
        let scan_type = api
            .get_opt(name)
            .await
            .map_err(|e| Error::kube("读取 ScanType", e))?;

        Ok(scan_type.is_some())
    }

    async fn create_scheduled_scan(&self, scan: &ScheduledScan) -> Result<ScheduledScan> {
        let name = scan.name_any();
        let namespace = scan.namespace().unwrap_or_default();

        self.scheduled_scans(&namespace)
            .create(&PostParams::default(), scan)
            .await
            .map_err(|e| write_error(name, e))
    }

    async fn replace_scheduled_scan(&self, scan: &ScheduledScan) -> Result<ScheduledScan> {
        let name = scan.name_any();
        let namespace = scan.namespace().unwrap_or_default();

        self.scheduled_scans(&namespace)
            .replace(&name, &PostParams::default(), scan)
            .await
            .map_err(|e| write_error(name.clone(), e))
    }

    async fn update_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<ScheduledScan> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels
            }
        });

        self.scheduled_scans(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| write_error(name.to_string(), e))
    }

    async fn update_last_schedule_time(
        &self,
        namespace: &str,
        name: &str,
        time: DateTime<Utc>,
    ) -> Result<ScheduledScan> {
        let patch = serde_json::json!({
            "status": {
                "lastScheduleTime": time
            }
        });

        self.scheduled_scans(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| write_error(name.to_string(), e))
    }

    async fn publish_warning(&self, service: &Service, reason: &str, note: &str) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            service.object_ref(&()),
        );

        debug!(
            "在 Service {}/{} 上发布事件 {}",
            service.namespace().unwrap_or_default(),
            service.name_any(),
            reason
        );

        recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await
            .map_err(Error::Event)
    }
}
