//! 测试用的内存集群状态

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::core::ErrorResponse;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::crd::{ScheduledScan, ScheduledScanStatus};
use crate::error::{Error, Result};
use crate::store::ClusterStore;

/// 已发布的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub reason: String,
    pub note: String,
}

/// 内存中的集群状态
#[derive(Debug, Default)]
pub struct State {
    pub services: BTreeMap<(String, String), Service>,
    pub namespaces: BTreeMap<String, Namespace>,
    pub pods: Vec<Pod>,
    pub scans: BTreeMap<(String, String), ScheduledScan>,
    pub scan_types: BTreeSet<(String, String)>,
    pub events: Vec<RecordedEvent>,
    pub creates: usize,
    pub replaces: usize,
    pub status_updates: usize,
    pub label_updates: usize,
    /// 接下来这么多次状态写入会失败
    pub status_failures: usize,
    /// 接下来这么多次标签写入会失败
    pub label_failures: usize,
    /// 每次调用前的人为延迟
    pub latency: Option<Duration>,
}

impl State {
    /// 写入次数总和
    pub fn writes(&self) -> usize {
        self.creates + self.replaces + self.status_updates + self.label_updates
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

fn key<K: ResourceExt>(resource: &K) -> (String, String) {
    (resource.namespace().unwrap_or_default(), resource.name_any())
}

/// 模拟 API Server 返回的写入失败
fn injected_failure(name: &str) -> Error {
    Error::Write {
        name: name.to_string(),
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "injected".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }),
    }
}

/// 写入后递增资源版本
fn bump_version(scan: &mut ScheduledScan) {
    let version = scan
        .resource_version()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_default()
        + 1;
    scan.metadata.resource_version = Some(version.to_string());
}

fn matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

impl InMemoryStore {
    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_service(self, service: Service) -> Self {
        self.state().services.insert(key(&service), service);
        self
    }

    pub fn with_namespace(self, namespace: Namespace) -> Self {
        self.state().namespaces.insert(namespace.name_any(), namespace);
        self
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.state().pods.push(pod);
        self
    }

    pub fn with_scan_type(self, namespace: &str, name: &str) -> Self {
        self.state()
            .scan_types
            .insert((namespace.to_string(), name.to_string()));
        self
    }

    pub fn with_status_failures(self, failures: usize) -> Self {
        self.state().status_failures = failures;
        self
    }

    pub fn with_label_failures(self, failures: usize) -> Self {
        self.state().label_failures = failures;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.delay().await;
        Ok(self
            .state()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        self.delay().await;
        Ok(self.state().namespaces.get(name).cloned())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        self.delay().await;
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| matches(pod.labels(), selector))
            .cloned()
            .collect())
    }

    async fn list_scheduled_scans(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ScheduledScan>> {
        self.delay().await;
        Ok(self
            .state()
            .scans
            .values()
            .filter(|scan| scan.namespace().as_deref() == Some(namespace))
            .filter(|scan| matches(scan.labels(), labels))
            .cloned()
            .collect())
    }

    async fn get_scheduled_scan(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ScheduledScan>> {
        self.delay().await;
        Ok(self
            .state()
            .scans
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn scan_type_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delay().await;
        Ok(self
            .state()
            .scan_types
            .contains(&(namespace.to_string(), name.to_string())))
    }

    async fn create_scheduled_scan(&self, scan: &ScheduledScan) -> Result<ScheduledScan> {
        self.delay().await;
        let mut state = self.state();
        let key = key(scan);
        if state.scans.contains_key(&key) {
            return Err(Error::AlreadyExists { name: key.1 });
        }

        let mut created = scan.clone();
        created.metadata.resource_version = Some("1".to_string());
        state.scans.insert(key, created.clone());
        state.creates += 1;
        Ok(created)
    }

    async fn replace_scheduled_scan(&self, scan: &ScheduledScan) -> Result<ScheduledScan> {
        self.delay().await;
        let mut state = self.state();
        let key = key(scan);
        let current = state
            .scans
            .get(&key)
            .and_then(|current| current.resource_version());
        if current.is_none() || current != scan.resource_version() {
            return Err(Error::Conflict { name: key.1 });
        }

        let mut replaced = scan.clone();
        bump_version(&mut replaced);
        state.scans.insert(key, replaced.clone());
        state.replaces += 1;
        Ok(replaced)
    }

    async fn update_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<ScheduledScan> {
        self.delay().await;
        let mut state = self.state();
        if state.label_failures > 0 {
            state.label_failures -= 1;
            return Err(injected_failure(name));
        }

        let scan = state
            .scans
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::Conflict { name: name.to_string() })?;

        let current = scan.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            match value {
                Some(value) => current.insert(key.clone(), value.clone()),
                None => current.remove(key),
            };
        }
        bump_version(scan);
        let updated = scan.clone();
        state.label_updates += 1;
        Ok(updated)
    }

    async fn update_last_schedule_time(
        &self,
        namespace: &str,
        name: &str,
        time: DateTime<Utc>,
    ) -> Result<ScheduledScan> {
        self.delay().await;
        let mut state = self.state();
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(injected_failure(name));
        }

        let scan = state
            .scans
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::Conflict { name: name.to_string() })?;

        scan.status
            .get_or_insert_with(ScheduledScanStatus::default)
            .last_schedule_time = Some(time);
        bump_version(scan);
        let updated = scan.clone();
        state.status_updates += 1;
        Ok(updated)
    }

    async fn publish_warning(&self, service: &Service, reason: &str, note: &str) -> Result<()> {
        self.delay().await;
        self.state().events.push(RecordedEvent {
            object: service.name_any(),
            reason: reason.to_string(),
            note: note.to_string(),
        });
        Ok(())
    }
}
