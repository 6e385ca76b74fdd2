//! 重试退避表（RetrySchedule）
//!
//! 将“已重试次数”映射为下一次重试前的等待时长：
//! - 次数超出配置长度时复用最后一项；
//! - 未配置时使用固定的短退避；
//! - 结果对次数单调不减（配置中的下降项按此前最大值抬平）。
//!
use std::time::Duration;

/// 未配置退避策略时的固定间隔
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(policy: impl IntoIterator<Item = Duration>) -> Self {
        let mut ceiling = Duration::ZERO;
        let intervals: Vec<Duration> = policy
            .into_iter()
            .map(|d| {
                ceiling = ceiling.max(d);
                ceiling
            })
            .collect();

        if intervals.is_empty() {
            return Self::fixed(DEFAULT_RETRY_INTERVAL);
        }
        Self { intervals }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self {
            intervals: vec![interval],
        }
    }

    pub fn next_interval(&self, attempt_count: u32) -> Duration {
        let index = (attempt_count as usize).min(self.intervals.len() - 1);
        self.intervals[index]
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

impl From<Option<Vec<Duration>>> for RetrySchedule {
    fn from(policy: Option<Vec<Duration>>) -> Self {
        policy.map(Self::new).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn reuses_last_interval_beyond_policy() {
        let schedule = RetrySchedule::new([secs(1), secs(5), secs(30)]);
        assert_eq!(schedule.next_interval(0), secs(1));
        assert_eq!(schedule.next_interval(1), secs(5));
        assert_eq!(schedule.next_interval(2), secs(30));
        assert_eq!(schedule.next_interval(3), secs(30));
        assert_eq!(schedule.next_interval(u32::MAX), secs(30));
    }

    #[test]
    fn default_policy_when_missing_or_empty() {
        assert_eq!(RetrySchedule::from(None).next_interval(0), DEFAULT_RETRY_INTERVAL);
        assert_eq!(RetrySchedule::new(Vec::new()).next_interval(7), DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    fn monotonic_even_for_decreasing_policy() {
        let schedule = RetrySchedule::new([secs(10), secs(2), secs(20), secs(5)]);
        for n in 0..8 {
            assert!(schedule.next_interval(n) <= schedule.next_interval(n + 1));
        }
        assert_eq!(schedule.intervals(), &[secs(10), secs(10), secs(20), secs(20)]);
    }
}
