//! 自定义资源定义模块
//!
//! 该模块声明自动发现需要读写的扫描资源：ScheduledScan 和 ScanType。
//! 这些资源由扫描 Operator 定义和执行，这里只声明用到的字段，
//! 其余字段作为不透明数据透传。

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 定时扫描规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "execution.securecodebox.io",
    version = "v1",
    kind = "ScheduledScan",
    plural = "scheduledscans",
    namespaced,
    status = "ScheduledScanStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.scanSpec.scanType"}"#,
    printcolumn = r#"{"name":"Interval", "type":"string", "jsonPath":".spec.interval"}"#,
    printcolumn = r#"{"name":"Last Scheduled", "type":"date", "jsonPath":".status.lastScheduleTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledScanSpec {
    /// 重复执行间隔，Go 时长格式
    #[serde(with = "autodiscovery_common::duration")]
    #[schemars(with = "String")]
    pub interval: Duration,

    /// 保留的成功扫描数量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,

    /// 保留的失败扫描数量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,

    /// 每次执行时创建的扫描
    pub scan_spec: ScanSpec,
}

/// 扫描规范
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanSpec {
    /// 要启动的 ScanType 名称
    pub scan_type: String,

    /// 扫描器命令行参数
    #[serde(default)]
    pub parameters: Vec<String>,

    /// 扫描容器的环境变量
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// 扫描容器的卷
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// 扫描容器的挂载点
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// 级联扫描规则，原样透传
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub cascades: Option<serde_json::Value>,
}

/// 定时扫描状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledScanStatus {
    /// 上次调度时间，由扫描 Operator 据此判断下一次执行
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,

    /// 扫描结果统计，原样透传
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub findings: Option<serde_json::Value>,
}

/// 扫描类型规范，自动发现只关心它是否存在
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "execution.securecodebox.io",
    version = "v1",
    kind = "ScanType",
    plural = "scantypes",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ScanTypeSpec {
    /// 扫描结果位置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_results: Option<ExtractResults>,

    /// 扫描 Job 模板，原样透传
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub job_template: Option<serde_json::Value>,
}

/// 扫描结果位置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtractResults {
    /// 结果类型
    #[serde(rename = "type")]
    pub result_type: String,
    /// 结果文件路径
    pub location: String,
}

/// 允许任意字段的对象 schema
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}
