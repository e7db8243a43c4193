//! Go 风格的时长格式
//!
//! 扫描记录与配置文件中的时长使用 `168h0m0s`、`1m` 这样的字符串表示。

use serde::{de, Deserialize, Deserializer, Serializer};
use std::time::Duration;

use crate::error::{Error, Result};

/// 解析时长字符串，例如 `168h`、`1h30m`、`5s`
pub fn parse(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|e| Error::Config(format!("无效的时长 '{}': {}", input, e)))
}

/// 格式化为 Go `time.Duration` 的字符串形式
pub fn format(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let millis = duration.subsec_millis();

    let seconds = if millis == 0 {
        format!("{}s", total % 60)
    } else {
        let fraction = format!("{:03}", millis);
        format!("{}.{}s", total % 60, fraction.trim_end_matches('0'))
    };

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}")
    } else {
        seconds
    }
}

/// serde 适配：`#[serde(with = "autodiscovery_common::duration")]`
pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(*duration))
}

/// serde 适配，见 [`serialize`]
pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(de::Error::custom)
}
