use crate::config::ProcessorConfig;
use crate::error::{Result, VehicleError};
use crate::performance::spawn_health_reporter;
use crate::pipeline::{FailureCause, MessagePipeline, ProcessingOutcome};
use crate::transport::PayloadSource;
use crate::types::*;

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// 关闭方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// 处理完队列中剩余的消息
    Drain,
    /// 剩余消息在下一个阶段边界被取消（仍计入统计）
    Cancel,
}

/// 单个工作者的分优先级消息通道
struct WorkerQueues {
    critical: mpsc::Sender<VehicleMessage>,
    normal: mpsc::Sender<VehicleMessage>,
    low: mpsc::Sender<VehicleMessage>,
}

impl WorkerQueues {
    fn sender(&self, priority: MessagePriority) -> &mpsc::Sender<VehicleMessage> {
        match priority {
            MessagePriority::Critical => &self.critical,
            MessagePriority::Normal => &self.normal,
            MessagePriority::Low => &self.low,
        }
    }
}

/// 消息处理服务：按车辆分区的并发工作者 + 后台维护任务
///
/// 同一车辆的消息总是进入同一个工作者，因此同一优先级内保持提交顺序。
pub struct ProcessingService {
    pipeline: Arc<MessagePipeline>,
    partitions: RwLock<Vec<WorkerQueues>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    housekeeping: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    is_running: Arc<AtomicBool>,
}

impl ProcessingService {
    /// 启动处理服务（需在 tokio 运行时内调用）
    pub fn start(pipeline: Arc<MessagePipeline>, config: &ProcessorConfig) -> Self {
        let ingress = &config.ingress;
        let is_running = Arc::new(AtomicBool::new(true));

        info!(
            "Starting processing service with {} workers (queues: critical={}, normal={}, low={})",
            ingress.workers,
            ingress.queue_capacity.critical,
            ingress.queue_capacity.normal,
            ingress.queue_capacity.low
        );

        let mut partitions = Vec::with_capacity(ingress.workers);
        let mut workers = Vec::with_capacity(ingress.workers);
        for id in 0..ingress.workers {
            let (critical_tx, critical_rx) = mpsc::channel(ingress.queue_capacity.critical);
            let (normal_tx, normal_rx) = mpsc::channel(ingress.queue_capacity.normal);
            let (low_tx, low_rx) = mpsc::channel(ingress.queue_capacity.low);

            partitions.push(WorkerQueues {
                critical: critical_tx,
                normal: normal_tx,
                low: low_tx,
            });
            workers.push(Self::spawn_worker(
                id,
                pipeline.clone(),
                critical_rx,
                normal_rx,
                low_rx,
            ));
        }

        let mut housekeeping = vec![
            pipeline.transport().spawn_reconnect_task(is_running.clone()),
            spawn_health_reporter(
                pipeline.monitor().clone(),
                config.health.report_interval,
                is_running.clone(),
            ),
        ];
        if let Some(window) = ingress.dedup_window {
            housekeeping.push(Self::spawn_cache_cleanup_task(
                pipeline.clone(),
                window,
                is_running.clone(),
            ));
        }

        Self {
            pipeline,
            partitions: RwLock::new(partitions),
            workers: Mutex::new(workers),
            housekeeping: Mutex::new(housekeeping),
            is_running,
        }
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    /// 检查服务是否正在运行
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 提交消息；对应优先级的队列已满时立即拒绝，不阻塞调用方
    pub fn submit(&self, mut message: VehicleMessage) -> Result<()> {
        let priority = message.classify(self.pipeline.rules());
        let partitions = self.partitions.read();

        if partitions.is_empty() {
            drop(partitions);
            self.pipeline
                .monitor()
                .record_dropped(DropReason::Error(ErrorKind::Cancelled), priority);
            return Err(VehicleError::ServiceStopped);
        }

        let index = partition_for(&message.vehicle_id, partitions.len());
        match partitions[index].sender(priority).try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                drop(partitions);
                self.pipeline
                    .monitor()
                    .record_dropped(DropReason::Priority, priority);
                warn!(
                    "Queue full for priority {}, type: {}, vehicle: {}",
                    priority, message.message_type, message.vehicle_id
                );
                Err(VehicleError::QueueFull(priority))
            }
            Err(TrySendError::Closed(_)) => {
                drop(partitions);
                self.pipeline
                    .monitor()
                    .record_dropped(DropReason::Error(ErrorKind::Cancelled), priority);
                Err(VehicleError::ServiceStopped)
            }
        }
    }

    /// 提交原始字节消息
    pub fn submit_bytes(&self, raw: &[u8]) -> Result<()> {
        let message = match self.pipeline.decode(raw) {
            Ok(message) => message,
            Err(e) => {
                self.pipeline.reject(e.clone(), MessagePriority::default());
                return Err(e.into());
            }
        };
        self.submit(message)
    }

    /// 从入站源持续读取并提交，源关闭或服务停止时返回已提交数量
    pub async fn pump(&self, source: &dyn PayloadSource) -> Result<u64> {
        info!("Started message receiver");
        let mut submitted = 0u64;

        while self.is_running() {
            match source.recv().await {
                Ok(Some(raw)) => match self.submit_bytes(&raw) {
                    Ok(()) => submitted += 1,
                    Err(VehicleError::Validation(e)) => debug!("Rejected inbound message: {}", e),
                    Err(e) if e.is_recoverable() => debug!("Inbound message dropped: {}", e),
                    Err(e) => return Err(e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Message receiving error: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Message receiver stopped after {} messages", submitted);
        Ok(submitted)
    }

    /// 停止服务并等待工作者退出
    pub async fn shutdown(&self, mode: ShutdownMode) {
        info!("Stopping processing service ({:?})", mode);

        if mode == ShutdownMode::Cancel {
            self.pipeline.cancel();
        }
        // 关闭发送端，工作者处理完剩余消息后退出
        self.partitions.write().clear();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }

        self.is_running.store(false, Ordering::Release);
        for task in std::mem::take(&mut *self.housekeeping.lock()) {
            task.abort();
        }
        self.pipeline.transport().disconnect().await;

        info!("Processing service stopped");
    }

    /// 生成处理任务，Critical 队列优先于 Normal，Normal 优先于 Low
    fn spawn_worker(
        id: usize,
        pipeline: Arc<MessagePipeline>,
        mut critical_rx: mpsc::Receiver<VehicleMessage>,
        mut normal_rx: mpsc::Receiver<VehicleMessage>,
        mut low_rx: mpsc::Receiver<VehicleMessage>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Started worker {}", id);

            loop {
                let message = tokio::select! {
                    biased;
                    Some(message) = critical_rx.recv() => message,
                    Some(message) = normal_rx.recv() => message,
                    Some(message) = low_rx.recv() => message,
                    else => break,
                };

                let message_type = message.message_type.clone();
                match pipeline.process(message).await {
                    ProcessingOutcome::Failed(FailureCause::Transport(e)) => {
                        debug!("Worker {}: {} dispatch failed: {}", id, message_type, e);
                    }
                    ProcessingOutcome::Failed(FailureCause::Serialization(e)) => {
                        error!("Worker {}: failed to encode {} message: {}", id, message_type, e);
                    }
                    _ => {}
                }
            }

            info!("Worker {} stopped", id);
        })
    }

    /// 生成缓存清理任务
    fn spawn_cache_cleanup_task(
        pipeline: Arc<MessagePipeline>,
        window: Duration,
        is_running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Started cache cleanup task");

            while is_running.load(Ordering::Acquire) {
                sleep(window).await;

                if let Some(cache) = pipeline.dedup() {
                    let removed = cache.purge_expired(Instant::now());
                    if removed > 0 {
                        debug!("Cleaned {} expired cache entries", removed);
                    }
                }
            }

            info!("Cache cleanup task stopped");
        })
    }
}

fn partition_for(vehicle_id: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    vehicle_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}
