//! Auto-Discovery Operator - 自动发现 Service 并调度安全扫描
//!
//! 该模块实现了自动发现的 Kubernetes Operator：监听 Service，
//! 在确认后端 Pod 的镜像版本一致且就绪后，为每个 HTTP(S) 端口
//! 创建或更新 ScheduledScan，使每个部署版本都恰好被扫描一次。

pub mod controller;
pub mod crd;
pub mod error;
pub mod inclusion;
pub mod reconcile;
pub mod resolver;
pub mod spec_generator;
pub mod store;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use autodiscovery_common::AutoDiscoveryConfig;
use kube::{Client, CustomResourceExt};
use std::sync::Arc;
use tracing::info;

use crate::crd::{ScanType, ScheduledScan};

/// Operator 主结构体
pub struct AutoDiscoveryOperator {
    /// 控制器
    controller: controller::Controller,
}

impl AutoDiscoveryOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: AutoDiscoveryConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("无法创建 Kubernetes 客户端")?;

        info!(
            "集群 {} 使用 {:?} 纳入方式，扫描类型 {}",
            config.cluster.name,
            config.resource_inclusion.mode,
            config.scan_config().scan_type
        );

        Ok(Self {
            controller: controller::Controller::new(client, Arc::new(config)),
        })
    }

    /// 启动 Operator，直到收到退出信号
    pub async fn run(self) -> Result<()> {
        self.controller.run().await
    }
}

/// 以 YAML 多文档形式输出用到的 CRD
pub fn crds_yaml() -> Result<String> {
    let documents = [
        serde_yaml::to_string(&ScheduledScan::crd())?,
        serde_yaml::to_string(&ScanType::crd())?,
    ];

    Ok(documents.join("---\n"))
}
