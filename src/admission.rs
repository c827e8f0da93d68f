use crate::config::SamplingConfig;
use crate::performance::LoadSnapshot;
use crate::types::{MessagePriority, VehicleMessage};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// 准入决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    DropSampling,
    /// 保留给基于优先级的准入规则，采样器本身不会产生
    DropPriority,
}

enum SamplingRng {
    Entropy,
    Seeded(Mutex<StdRng>),
}

/// 准入控制器（采样器）
///
/// Critical 消息永远接受。Normal/Low 按配置采样率抽样；
/// 负载快照显示系统已降级时，Low 采样率降为0，Normal 乘以退避系数。
pub struct AdmissionController {
    normal_rate: f64,
    low_rate: f64,
    degraded_normal_backoff: f64,
    rng: SamplingRng,
}

impl AdmissionController {
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => SamplingRng::Seeded(Mutex::new(StdRng::seed_from_u64(seed))),
            None => SamplingRng::Entropy,
        };

        Self {
            normal_rate: config.normal_rate,
            low_rate: config.low_rate,
            degraded_normal_backoff: config.degraded_normal_backoff,
            rng,
        }
    }

    /// 对一条消息做准入决策；`load` 为空表示监控尚未完成第一个窗口
    pub fn decide(&self, message: &VehicleMessage, load: Option<&LoadSnapshot>) -> AdmissionDecision {
        let priority = message.priority();
        if priority == MessagePriority::Critical {
            return AdmissionDecision::Accept;
        }

        let rate = self.effective_rate(priority, load);
        let accepted = if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            self.draw() < rate
        };

        if accepted {
            AdmissionDecision::Accept
        } else {
            debug!(
                "Sampling drop: type={}, priority={}, rate={:.3}",
                message.message_type, priority, rate
            );
            AdmissionDecision::DropSampling
        }
    }

    /// 在给定负载下某优先级的实际采样率
    pub fn effective_rate(&self, priority: MessagePriority, load: Option<&LoadSnapshot>) -> f64 {
        let degraded = load.map(|l| l.degraded).unwrap_or(false);

        match priority {
            MessagePriority::Critical => 1.0,
            MessagePriority::Normal if degraded => self.normal_rate * self.degraded_normal_backoff,
            MessagePriority::Normal => self.normal_rate,
            MessagePriority::Low if degraded => 0.0,
            MessagePriority::Low => self.low_rate,
        }
    }

    fn draw(&self) -> f64 {
        match &self.rng {
            SamplingRng::Entropy => rand::thread_rng().gen::<f64>(),
            SamplingRng::Seeded(rng) => rng.lock().gen::<f64>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(normal_rate: f64, low_rate: f64, seed: Option<u64>) -> AdmissionController {
        AdmissionController::new(&SamplingConfig {
            normal_rate,
            low_rate,
            degraded_normal_backoff: 0.5,
            seed,
        })
    }

    fn message(priority: MessagePriority) -> VehicleMessage {
        VehicleMessage::new("diagnostic", "VIN_1", 1.0).with_priority(priority)
    }

    #[test]
    fn test_critical_always_accepted() {
        let loads = [None, Some(LoadSnapshot::healthy()), Some(LoadSnapshot::degraded())];
        for rate in [0.0, 0.3, 1.0] {
            let ctl = controller(rate, rate, Some(1));
            for load in loads.iter() {
                for _ in 0..200 {
                    assert_eq!(
                        ctl.decide(&message(MessagePriority::Critical), load.as_ref()),
                        AdmissionDecision::Accept
                    );
                }
            }
        }
    }

    #[test]
    fn test_rate_extremes() {
        let ctl = controller(1.0, 0.0, None);
        for _ in 0..100 {
            assert_eq!(ctl.decide(&message(MessagePriority::Normal), None), AdmissionDecision::Accept);
            assert_eq!(
                ctl.decide(&message(MessagePriority::Low), None),
                AdmissionDecision::DropSampling
            );
        }
    }

    #[test]
    fn test_degraded_backpressure() {
        let ctl = controller(0.8, 0.6, Some(3));
        let degraded = LoadSnapshot::degraded();
        let healthy = LoadSnapshot::healthy();

        assert_eq!(ctl.effective_rate(MessagePriority::Low, Some(&degraded)), 0.0);
        assert!((ctl.effective_rate(MessagePriority::Normal, Some(&degraded)) - 0.4).abs() < 1e-9);
        assert_eq!(ctl.effective_rate(MessagePriority::Low, Some(&healthy)), 0.6);
        assert_eq!(ctl.effective_rate(MessagePriority::Normal, None), 0.8);

        for _ in 0..500 {
            assert_eq!(
                ctl.decide(&message(MessagePriority::Low), Some(&degraded)),
                AdmissionDecision::DropSampling
            );
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let a = controller(0.5, 0.5, Some(42));
        let b = controller(0.5, 0.5, Some(42));
        let msg = message(MessagePriority::Normal);

        let run_a: Vec<_> = (0..64).map(|_| a.decide(&msg, None)).collect();
        let run_b: Vec<_> = (0..64).map(|_| b.decide(&msg, None)).collect();
        assert_eq!(run_a, run_b);
    }

    #[test]
    fn test_sampling_rate_is_respected() {
        let ctl = controller(0.5, 0.1, Some(7));
        let accepted = (0..10_000)
            .filter(|_| ctl.decide(&message(MessagePriority::Low), None) == AdmissionDecision::Accept)
            .count();
        assert!((700..=1300).contains(&accepted), "accepted {}", accepted);
    }
}
