//! 扫描记录查询
//!
//! 对每个 (Service, 端口) 先按版本标签精确查找，再按身份键查找，
//! 得出需要跳过、新建还是重新扫描。

use autodiscovery_common::{identity_key, VersionLabelSet};
use tracing::debug;

use crate::crd::ScheduledScan;
use crate::error::Result;
use crate::store::{ClusterStore, Deadline};

/// 查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 当前版本已经调度过扫描
    AlreadyScanned,
    /// 该端口从未被扫描过，需要新建
    CreateNew,
    /// 该端口扫描过旧版本，需要原地更新
    Rescan(Box<ScheduledScan>),
}

/// 扫描记录查询器
pub struct ScanRecordResolver<'a, S: ?Sized> {
    /// 集群状态访问
    store: &'a S,
    /// 本次协调的截止时间
    deadline: Deadline,
}

impl<'a, S: ClusterStore + ?Sized> ScanRecordResolver<'a, S> {
    /// 创建新的查询器
    pub fn new(store: &'a S, deadline: Deadline) -> Self {
        Self { store, deadline }
    }

    /// 查询某个端口的扫描记录状态
    pub async fn resolve(
        &self,
        namespace: &str,
        service_name: &str,
        port: i32,
        labels: &VersionLabelSet,
    ) -> Result<Resolution> {
        let same_version = self
            .deadline
            .run(
                "列举 ScheduledScan",
                self.store.list_scheduled_scans(namespace, labels.labels()),
            )
            .await?;

        debug!(
            "Service {}/{} 端口 {} 找到 {} 个相同版本的 ScheduledScan",
            namespace,
            service_name,
            port,
            same_version.len()
        );

        if !same_version.is_empty() {
            return Ok(Resolution::AlreadyScanned);
        }

        let name = identity_key(service_name, port);
        let previous = self
            .deadline
            .run(
                "读取 ScheduledScan",
                self.store.get_scheduled_scan(namespace, &name),
            )
            .await?;

        Ok(match previous {
            Some(scan) => Resolution::Rescan(Box::new(scan)),
            None => Resolution::CreateNew,
        })
    }
}
