use crate::error::{Result, VehicleError};
use crate::types::PriorityRules;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// 处理器完整配置（启动时读取，会话期间不可变）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub sampling: SamplingConfig,
    pub health: HealthConfig,
    pub validation: ValidationConfig,
    pub transport: TransportConfig,
    pub ingress: IngressConfig,
    pub priority_rules: PriorityRules,
}

/// 采样配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Normal 优先级采样率 (0.0-1.0)
    pub normal_rate: f64,
    /// Low 优先级采样率 (0.0-1.0)
    pub low_rate: f64,
    /// 系统降级时 Normal 采样率的乘数
    pub degraded_normal_backoff: f64,
    /// 固定随机种子；为空时使用系统熵
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            normal_rate: 1.0,
            low_rate: 1.0,
            degraded_normal_backoff: 0.5,
            seed: None,
        }
    }
}

/// 健康判定与统计窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 丢弃率阈值，超过即判定为降级
    pub degraded_drop_rate_threshold: f64,
    /// 平均延迟上限，超过即判定为降级
    #[serde(rename = "degraded_latency_ceiling_ms", with = "duration_ms")]
    pub degraded_latency_ceiling: Duration,
    /// 统计窗口长度
    #[serde(rename = "window_duration_ms", with = "duration_ms")]
    pub window_duration: Duration,
    /// 保留的已完成窗口数量
    pub history_len: usize,
    /// 健康报告日志间隔
    #[serde(rename = "report_interval_ms", with = "duration_ms")]
    pub report_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_drop_rate_threshold: 0.1,
            degraded_latency_ceiling: Duration::from_millis(10),
            window_duration: Duration::from_secs(5),
            history_len: 12,
            report_interval: Duration::from_secs(10),
        }
    }
}

/// 消息校验配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// 允许时间戳超前处理时间的最大值
    #[serde(rename = "timestamp_skew_tolerance_ms", with = "duration_ms")]
    pub timestamp_skew_tolerance: Duration,
    /// 负载中（含嵌套）允许的最大条目数
    pub max_payload_entries: usize,
    /// 负载允许的最大嵌套深度
    pub max_payload_depth: usize,
    /// 原始字节消息的最大长度
    pub max_raw_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timestamp_skew_tolerance: Duration::from_secs(5),
            max_payload_entries: 256,
            max_payload_depth: 8,
            max_raw_bytes: 64 * 1024,
        }
    }
}

/// 重连退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "initial_ms", with = "duration_ms")]
    pub initial: Duration,
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// 传输适配器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// 发布端地址
    pub endpoint: String,
    /// 主题前缀，拼接在 message_type 之前
    pub topic_prefix: String,
    /// 单次发送超时
    #[serde(rename = "send_timeout_ms", with = "duration_ms")]
    pub send_timeout: Duration,
    /// 单次连接超时
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// 连续失败多少次后进入 Degraded
    pub degraded_after_failures: u32,
    pub reconnect_backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "ipc:///tmp/vehicle_nn.ipc".to_string(),
            topic_prefix: String::new(),
            send_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(1),
            degraded_after_failures: 3,
            reconnect_backoff: BackoffConfig::default(),
        }
    }
}

/// 各优先级入口队列容量
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCapacity {
    pub critical: usize,
    pub normal: usize,
    pub low: usize,
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self {
            critical: 200,
            normal: 500,
            low: 100,
        }
    }
}

/// 处理服务入口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// 并发工作者数量
    pub workers: usize,
    pub queue_capacity: QueueCapacity,
    /// 去重窗口；为空时不去重
    #[serde(rename = "dedup_window_ms", with = "option_duration_ms")]
    pub dedup_window: Option<Duration>,
    /// 去重缓存最大条目数
    pub dedup_capacity: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: QueueCapacity::default(),
            dedup_window: None,
            dedup_capacity: 100_000,
        }
    }
}

impl ProcessorConfig {
    /// 从TOML字符串解析并校验配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ProcessorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从TOML文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded processor configuration from {}", path.display());
        Ok(config)
    }

    /// 校验配置取值，任何错误都会阻止流水线启动
    pub fn validate(&self) -> Result<()> {
        check_unit_interval("sampling.normal_rate", self.sampling.normal_rate)?;
        check_unit_interval("sampling.low_rate", self.sampling.low_rate)?;
        check_unit_interval(
            "sampling.degraded_normal_backoff",
            self.sampling.degraded_normal_backoff,
        )?;
        check_unit_interval(
            "health.degraded_drop_rate_threshold",
            self.health.degraded_drop_rate_threshold,
        )?;

        check_non_zero("health.degraded_latency_ceiling", self.health.degraded_latency_ceiling)?;
        check_non_zero("health.window_duration", self.health.window_duration)?;
        check_non_zero("health.report_interval", self.health.report_interval)?;
        check_non_zero("transport.send_timeout", self.transport.send_timeout)?;
        check_non_zero("transport.connect_timeout", self.transport.connect_timeout)?;

        let backoff = &self.transport.reconnect_backoff;
        check_non_zero("transport.reconnect_backoff.initial", backoff.initial)?;
        if backoff.max < backoff.initial {
            return Err(config_error(format!(
                "transport.reconnect_backoff.max ({:?}) is below initial ({:?})",
                backoff.max, backoff.initial
            )));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(config_error(format!(
                "transport.reconnect_backoff.multiplier must be >= 1.0, got {}",
                backoff.multiplier
            )));
        }

        if self.transport.degraded_after_failures == 0 {
            return Err(config_error("transport.degraded_after_failures must be > 0"));
        }
        if self.health.history_len == 0 {
            return Err(config_error("health.history_len must be > 0"));
        }
        if self.validation.max_payload_depth == 0 {
            return Err(config_error("validation.max_payload_depth must be > 0"));
        }
        if self.validation.max_raw_bytes == 0 {
            return Err(config_error("validation.max_raw_bytes must be > 0"));
        }
        if self.ingress.workers == 0 {
            return Err(config_error("ingress.workers must be > 0"));
        }
        let caps = &self.ingress.queue_capacity;
        if caps.critical == 0 || caps.normal == 0 || caps.low == 0 {
            return Err(config_error("ingress.queue_capacity entries must be > 0"));
        }
        if let Some(window) = self.ingress.dedup_window {
            check_non_zero("ingress.dedup_window", window)?;
            if self.ingress.dedup_capacity == 0 {
                return Err(config_error("ingress.dedup_capacity must be > 0"));
            }
        }

        self.priority_rules.validate()
    }
}

fn config_error(message: impl Into<String>) -> VehicleError {
    VehicleError::ConfigError(message.into())
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(config_error(format!("{} must be within [0, 1], got {}", name, value)))
    }
}

fn check_non_zero(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        Err(config_error(format!("{} must be greater than zero", name)))
    } else {
        Ok(())
    }
}

/// 以毫秒整数表示的 Duration
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessagePriority;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.normal_rate, 1.0);
        assert_eq!(config.health.window_duration, Duration::from_secs(5));
        assert!(config.ingress.dedup_window.is_none());
    }

    #[test]
    fn test_sampling_rate_out_of_range_is_fatal() {
        let mut config = ProcessorConfig::default();
        config.sampling.low_rate = 1.5;
        assert!(matches!(config.validate(), Err(VehicleError::ConfigError(_))));

        config.sampling.low_rate = f64::NAN;
        assert!(config.validate().is_err());

        config.sampling.low_rate = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = ProcessorConfig::default();
        config.transport.reconnect_backoff.max = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.transport.reconnect_backoff.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
            [sampling]
            normal_rate = 0.5
            low_rate = 0.1
            seed = 7

            [health]
            degraded_drop_rate_threshold = 0.25
            window_duration_ms = 1000

            [transport]
            endpoint = "tcp://127.0.0.1:5555"
            send_timeout_ms = 20

            [transport.reconnect_backoff]
            initial_ms = 50
            max_ms = 800

            [ingress]
            workers = 2
            dedup_window_ms = 1000

            [[priority_rules]]
            pattern = "emergency"
            match = "contains"
            priority = "critical"
        "#;

        let config = ProcessorConfig::from_toml_str(content).unwrap();
        assert_eq!(config.sampling.normal_rate, 0.5);
        assert_eq!(config.sampling.seed, Some(7));
        assert_eq!(config.health.window_duration, Duration::from_secs(1));
        assert_eq!(config.health.history_len, 12);
        assert_eq!(config.transport.send_timeout, Duration::from_millis(20));
        assert_eq!(config.transport.reconnect_backoff.multiplier, 2.0);
        assert_eq!(config.ingress.workers, 2);
        assert_eq!(config.ingress.dedup_window, Some(Duration::from_secs(1)));
        assert_eq!(
            config.priority_rules.classify("vehicle_emergency_stop"),
            MessagePriority::Critical
        );
    }

    #[test]
    fn test_invalid_toml_values_rejected() {
        let content = r#"
            [sampling]
            normal_rate = 2.0
        "#;
        assert!(matches!(
            ProcessorConfig::from_toml_str(content),
            Err(VehicleError::ConfigError(_))
        ));

        let content = r#"
            [ingress]
            workers = 0
        "#;
        assert!(ProcessorConfig::from_toml_str(content).is_err());
    }
}
