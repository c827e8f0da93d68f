//! Vehicle Message Core Library
//!
//! 车辆遥测消息处理核心库：优先级分类、准入采样、规范化序列化、
//! 健康监控以及带重连的消息发布。

pub mod types;
pub mod config;
pub mod admission;
pub mod pipeline;
pub mod transport;
pub mod service;
pub mod performance;
pub mod error;


// 重新导出主要类型
pub use types::*;
pub use config::{ProcessorConfig, SamplingConfig, HealthConfig, ValidationConfig, TransportConfig, IngressConfig};
pub use admission::{AdmissionController, AdmissionDecision};
pub use pipeline::{MessagePipeline, PipelineStage, ProcessingOutcome, FailureCause};
pub use transport::{TransportAdapter, ConnectionState, PayloadSink, PayloadSource, MemorySink};
pub use service::{ProcessingService, ShutdownMode};
pub use performance::{PerformanceMonitor, HealthStatus, HealthReport, LoadSnapshot, StatsSnapshot};
pub use error::{VehicleError, ValidationError, SerializationError, TransportError, Result};

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 获取库信息
pub fn get_library_info() -> String {
    format!(
        "Vehicle Message Core v{} - Priority-aware vehicle telemetry processing library",
        VERSION
    )
}
