use vehicle_msg_core::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Vehicle Message Core example");

    // 采样配置：Normal 80%，Low 20%
    let mut config = ProcessorConfig::default();
    config.sampling.normal_rate = 0.8;
    config.sampling.low_rate = 0.2;
    config.health.window_duration = Duration::from_secs(1);

    let sink = Arc::new(MemorySink::new());
    let pipeline = MessagePipeline::with_sink(&config, sink.clone())?;
    pipeline.transport().connect().await?;

    // 模拟消息处理
    for i in 0..1000 {
        let message_type = match i % 10 {
            0 => "tracking",
            1..=3 => "vcc",
            _ => "traj",
        };

        let message = VehicleMessage::new(message_type, format!("VIN_{}", i % 5), unix_timestamp())
            .with_field("x", i as f64 * 0.1)
            .with_field("y", i as f64 * 0.2)
            .with_field("speed", 30.0 + (i % 20) as f64);

        match pipeline.process(message).await {
            ProcessingOutcome::Dispatched { fingerprint, .. } if i % 100 == 0 => {
                info!("Message #{} dispatched, fingerprint {}", i, fingerprint);
            }
            ProcessingOutcome::Failed(cause) => info!("Message #{} failed: {:?}", i, cause),
            _ => {}
        }

        // 模拟处理间隔
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // 输出最终统计
    let snapshot = pipeline.monitor().snapshot();
    let total = snapshot.lifetime.total();
    info!("Final statistics:");
    info!("  Received: {}", total.received);
    info!("  Processed: {}", total.processed);
    info!("  Dropped (sampling): {}", total.dropped_sampling);
    info!("  Dropped (error): {}", total.dropped_error);
    for priority in MessagePriority::ALL {
        let counters = snapshot.lifetime.priority(priority);
        info!(
            "  {:<8} processed {}/{}",
            priority.as_str(),
            counters.processed,
            counters.received
        );
    }
    info!("  Published payloads: {}", sink.sent_count());
    info!("  Health status: {}", snapshot.health.status.as_str());

    Ok(())
}
