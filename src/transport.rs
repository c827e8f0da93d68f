use crate::config::{BackoffConfig, TransportConfig};
use crate::error::TransportError;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// 发布端抽象：接收 (topic, payload)，由外部传输实现（nanomsg PUB 等）
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<(), TransportError>;

    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn disconnect(&self) {}
}

/// 入站字节源；返回 `Ok(None)` 表示源已关闭
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn recv(&self) -> Result<Option<Bytes>, TransportError>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 已连接但最近连续发送失败
    Degraded,
}

impl ConnectionState {
    pub fn can_send(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// 传输适配器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub timeouts: u64,
    pub not_connected: u64,
    pub connection_attempts: u64,
    pub reconnections: u64,
}

#[derive(Default)]
struct TransportCounters {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    timeouts: AtomicU64,
    not_connected: AtomicU64,
    connection_attempts: AtomicU64,
    reconnections: AtomicU64,
}

/// 指数退避（带上限）
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self { config, current }
    }

    /// 返回本次等待时间并推进到下一次
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.mul_f64(self.config.multiplier);
        self.current = next.min(self.config.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }
}

/// 传输适配器：管理连接状态，在超时约束下发送负载
///
/// 状态迁移在写锁内完成；Connected/Degraded 状态下允许并发发送。
pub struct TransportAdapter {
    config: TransportConfig,
    sink: Arc<dyn PayloadSink>,
    state: RwLock<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    consecutive_failures: AtomicU32,
    counters: TransportCounters,
    ever_connected: AtomicBool,
    state_changed: Notify,
}

impl TransportAdapter {
    pub fn new(config: TransportConfig, sink: Arc<dyn PayloadSink>) -> Self {
        Self {
            config,
            sink,
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
            counters: TransportCounters::default(),
            ever_connected: AtomicBool::new(false),
            state_changed: Notify::new(),
        }
    }

    /// 获取连接状态
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// 获取统计信息
    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            not_connected: c.not_connected.load(Ordering::Relaxed),
            connection_attempts: c.connection_attempts.load(Ordering::Relaxed),
            reconnections: c.reconnections.load(Ordering::Relaxed),
        }
    }

    /// 仅当当前状态属于 `from` 时迁移到 `to`
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let mut state = self.state.write();
        if !from.contains(&*state) {
            return false;
        }
        if *state != to {
            debug!("Transport state {:?} -> {:?}", *state, to);
            *state = to;
            drop(state);
            self.state_changed.notify_waiters();
        }
        true
    }

    /// 建立连接；已连接时直接返回
    pub async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;

        if self.state().can_send() {
            return Ok(());
        }
        self.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting);
        self.counters.connection_attempts.fetch_add(1, Ordering::Relaxed);

        let result = match timeout(self.config.connect_timeout, self.sink.connect(&self.config.endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.connect_timeout)),
        };

        match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.transition(&[ConnectionState::Connecting], ConnectionState::Connected);
                if self.ever_connected.swap(true, Ordering::AcqRel) {
                    self.counters.reconnections.fetch_add(1, Ordering::Relaxed);
                }
                info!("Successfully connected to: {}", self.config.endpoint);
                Ok(())
            }
            Err(e) => {
                self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
                warn!(
                    "Connection attempt to {} failed [{}]: {}",
                    self.config.endpoint,
                    e.kind(),
                    e
                );
                Err(e)
            }
        }
    }

    /// 主动断开
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.transition(
            &[ConnectionState::Connected, ConnectionState::Degraded, ConnectionState::Connecting],
            ConnectionState::Disconnected,
        );
        self.sink.disconnect().await;
        info!("Transport disconnected from: {}", self.config.endpoint);
    }

    /// 发送负载；未连接时立即失败，否则最多阻塞 send_timeout
    pub async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.state().can_send() {
            self.counters.not_connected.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::NotConnected);
        }

        let size = payload.len() as u64;
        let result = match timeout(self.config.send_timeout, self.sink.send(topic, payload)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.send_timeout)),
        };

        match result {
            Ok(()) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(size, Ordering::Relaxed);
                if self.consecutive_failures.swap(0, Ordering::Relaxed) > 0 {
                    self.transition(&[ConnectionState::Degraded], ConnectionState::Connected);
                }
                Ok(())
            }
            Err(e) => {
                self.on_send_failure(&e);
                Err(e)
            }
        }
    }

    fn on_send_failure(&self, err: &TransportError) {
        self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        debug!("Send failed [{}]: {}", err.kind(), err);

        match err {
            TransportError::NotConnected => {
                self.counters.not_connected.fetch_add(1, Ordering::Relaxed);
                if self.transition(
                    &[ConnectionState::Connected, ConnectionState::Degraded],
                    ConnectionState::Disconnected,
                ) {
                    warn!("Sink reported lost connection, scheduling reconnect");
                }
            }
            TransportError::Timeout(_) | TransportError::Refused(_) => {
                if matches!(err, TransportError::Timeout(_)) {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.degraded_after_failures
                    && self.transition(&[ConnectionState::Connected], ConnectionState::Degraded)
                {
                    warn!("Transport degraded after {} consecutive send failures", failures);
                }
            }
        }
    }

    /// 生成重连任务：断开时按指数退避重试，独立于消息处理
    pub fn spawn_reconnect_task(
        self: &Arc<Self>,
        is_running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);

        tokio::spawn(async move {
            info!("Started connection manager");
            let mut backoff = ExponentialBackoff::new(adapter.config.reconnect_backoff.clone());
            let idle_check = adapter.config.reconnect_backoff.max;

            while is_running.load(Ordering::Acquire) {
                // 先登记等待再读状态，读取之后的迁移不会漏掉通知
                let notified = adapter.state_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match adapter.state() {
                    ConnectionState::Disconnected => match adapter.connect().await {
                        Ok(()) => backoff.reset(),
                        Err(e) => {
                            let delay = backoff.next_delay();
                            error!("Failed to connect: {}, retrying in {:?}", e, delay);
                            sleep(delay).await;
                        }
                    },
                    _ => {
                        // 等待状态变化，定期醒来检查运行标志
                        let _ = timeout(idle_check, notified).await;
                    }
                }
            }

            info!("Connection manager stopped");
        })
    }
}

/// 内存发布端，记录所有发送的负载；可注入连接与发送故障
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<(String, Bytes)>>,
    refuse_connect: AtomicBool,
    send_failure: Mutex<Option<TransportError>>,
    send_delay: Mutex<Option<Duration>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::Release);
    }

    /// 之后的发送全部以该错误失败；None 恢复正常
    pub fn set_send_failure(&self, failure: Option<TransportError>) {
        *self.send_failure.lock() = failure;
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock() = delay;
    }

    pub fn sent(&self) -> Vec<(String, Bytes)> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl PayloadSink for MemorySink {
    async fn connect(&self, endpoint: &str) -> Result<(), TransportError> {
        if self.refuse_connect.load(Ordering::Acquire) {
            return Err(TransportError::Refused(format!("{} unavailable", endpoint)));
        }
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if let Some(failure) = self.send_failure.lock().clone() {
            return Err(failure);
        }
        self.sent.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

/// 基于通道的入站字节源
pub struct ChannelSource {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                receiver: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl PayloadSource for ChannelSource {
    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.receiver.lock().await.recv().await)
    }
}
