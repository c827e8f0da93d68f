use vehicle_msg_core::transport::ChannelSource;
use vehicle_msg_core::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

/// 完整的车辆消息处理系统示例：入站源 → 处理服务 → 发布端
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("🚗 Starting Vehicle Message Core Complete System Example");
    info!("📋 {}", get_library_info());

    // 1. 加载配置（命令行第一个参数为 TOML 配置文件路径）
    let config = match std::env::args().nth(1) {
        Some(path) => ProcessorConfig::from_file(path)?,
        None => {
            let mut config = ProcessorConfig::default();
            config.sampling.normal_rate = 0.7;
            config.sampling.low_rate = 0.3;
            config.health.window_duration = Duration::from_secs(2);
            config.health.report_interval = Duration::from_secs(2);
            config.ingress.dedup_window = Some(Duration::from_secs(10));
            config
        }
    };

    // 2. 创建发布端与流水线
    let sink = Arc::new(MemorySink::new());
    let pipeline = Arc::new(MessagePipeline::with_sink(&config, sink.clone())?);

    // 3. 启动处理服务（含重连、健康报告、去重缓存清理）
    let service = Arc::new(ProcessingService::start(pipeline.clone(), &config));
    info!("🔧 System components initialized");

    // 4. 入站源与模拟车辆
    let (tx, source) = ChannelSource::new(1024);
    let pump_handle = {
        let service = service.clone();
        tokio::spawn(async move { service.pump(&source).await })
    };
    let producer_handle = tokio::spawn(simulate_vehicles(tx));

    // 5. 中途模拟一次发布端故障
    tokio::time::sleep(Duration::from_secs(3)).await;
    warn!("⚠️  Injecting publisher failure");
    sink.set_send_failure(Some(TransportError::Refused("simulated outage".into())));
    tokio::time::sleep(Duration::from_secs(2)).await;
    sink.set_send_failure(None);
    info!("✅ Publisher recovered, transport state: {:?}", pipeline.transport().state());

    // 6. 等待生产者结束、入站源关闭
    producer_handle.await?;
    let submitted = pump_handle.await??;
    info!("📨 Pump submitted {} messages", submitted);

    // 7. 优雅关闭
    info!("🛑 Shutting down system...");
    service.shutdown(ShutdownMode::Drain).await;

    // 8. 输出最终统计
    print_final_statistics(&pipeline.monitor().snapshot(), sink.sent_count());

    info!("🏁 Vehicle Message Core system example completed");
    Ok(())
}

/// 模拟多辆车持续上报，混合新旧两种消息格式
async fn simulate_vehicles(tx: tokio::sync::mpsc::Sender<bytes::Bytes>) {
    let message_types = ["tracking", "route", "error_info", "traj", "moving_obj", "vcc", "device"];

    for i in 0..2_000u64 {
        let message_type = message_types[(i % message_types.len() as u64) as usize];
        let vin = format!("VIN_{:03}", i % 16);

        let raw = if i % 4 == 0 {
            let legacy = serde_json::json!({
                "service": message_type,
                "params": {
                    "vin": vin,
                    "timestamp": unix_timestamp(),
                    "speed": 30.0 + (i % 40) as f64,
                },
            });
            bytes::Bytes::from(legacy.to_string())
        } else {
            let message = VehicleMessage::new(message_type, vin, unix_timestamp())
                .with_field("x", i as f64 * 0.1)
                .with_field("y", i as f64 * 0.2)
                .with_field("speed", 30.0 + (i % 40) as f64);
            match message.to_canonical_bytes() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Failed to encode simulated message: {}", e);
                    continue;
                }
            }
        };

        if tx.send(raw).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
}

/// 打印最终统计信息
fn print_final_statistics(snapshot: &StatsSnapshot, published: usize) {
    let total = snapshot.lifetime.total();
    let drop_rate = if total.received > 0 {
        total.dropped() as f64 / total.received as f64
    } else {
        0.0
    };

    println!("\n🏆 Final System Statistics:");
    println!("═══════════════════════════════════════");
    println!("📨 Messages Received:    {:>10}", total.received);
    println!("✅ Messages Processed:   {:>10}", total.processed);
    println!("🎲 Dropped (sampling):   {:>10}", total.dropped_sampling);
    println!("📦 Dropped (queue full): {:>10}", total.dropped_priority);
    println!("♻️  Dropped (duplicate):  {:>10}", total.dropped_duplicate);
    println!("❌ Dropped (error):      {:>10}", total.dropped_error);
    println!("📊 Drop Rate:            {:>9.2}%", drop_rate * 100.0);
    println!("📤 Published Payloads:   {:>10}", published);
    println!("🪟 Windows Completed:    {:>10}", snapshot.windows_completed);

    for priority in MessagePriority::ALL {
        let counters = snapshot.lifetime.priority(priority);
        println!(
            "   {:<8} received {:>6}, processed {:>6}",
            priority.as_str(),
            counters.received,
            counters.processed
        );
    }

    println!("🏅 Health:               {}", snapshot.health.status.as_str());
    println!("═══════════════════════════════════════\n");
}
