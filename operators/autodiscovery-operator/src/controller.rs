//! 控制器模块
//!
//! 监听集群内所有 Service，将变更交给 [`ReconcileEngine`] 处理，
//! 并把协调结果转换为 kube-rs 的重新入队动作。

use anyhow::Result;
use autodiscovery_common::{AutoDiscoveryConfig, SHORT_REQUEUE_INTERVAL};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller as KubeController},
        watcher,
    },
    ResourceExt,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::reconcile::{Outcome, ReconcileEngine, ReconcileRequest};
use crate::store::KubeStore;

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => Action::await_change(),
            Outcome::RequeueAfter(after) => Action::requeue(after),
        }
    }
}

/// 协调回调共享的上下文
pub struct Context {
    /// 协调器
    engine: ReconcileEngine<KubeStore>,
    /// 自动发现配置
    config: Arc<AutoDiscoveryConfig>,
}

impl Context {
    /// 创建上下文
    pub fn new(client: Client, config: Arc<AutoDiscoveryConfig>) -> Self {
        Self {
            engine: ReconcileEngine::new(KubeStore::new(client), config.clone()),
            config,
        }
    }
}

/// 控制器结构体
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 自动发现配置
    config: Arc<AutoDiscoveryConfig>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Client, config: Arc<AutoDiscoveryConfig>) -> Self {
        Self { client, config }
    }

    /// 运行控制器直到收到退出信号
    pub async fn run(self) -> Result<()> {
        let services: Api<Service> = Api::all(self.client.clone());
        let context = Arc::new(Context::new(self.client, self.config));

        info!("启动 Service 自动发现控制器");

        KubeController::new(services, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|result| async move {
                match result {
                    Ok((object, action)) => debug!("协调完成 {}: {:?}", object.name, action),
                    Err(e) => warn!("协调失败: {}", e),
                }
            })
            .await;

        info!("Service 自动发现控制器已停止");

        Ok(())
    }
}

/// 协调回调
async fn reconcile(service: Arc<Service>, context: Arc<Context>) -> Result<Action, Error> {
    let request = ReconcileRequest::new(
        service.namespace().unwrap_or_default(),
        service.name_any(),
        context.config.reconcile_timeout,
    );

    context.engine.reconcile(&request).await.map(Action::from)
}

/// 错误处理回调
fn error_policy(service: Arc<Service>, error: &Error, context: Arc<Context>) -> Action {
    error!(
        "协调 Service {}/{} 出错: {}",
        service.namespace().unwrap_or_default(),
        service.name_any(),
        error
    );

    if error.is_retryable() {
        Action::requeue(SHORT_REQUEUE_INTERVAL)
    } else {
        Action::requeue(context.config.passive_reconcile_interval())
    }
}
