use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// 当前批次的来源阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPhase {
    FailureRetry,
    #[default]
    Normal,
}

impl BatchPhase {
    /// 每次取批次前切换阶段
    pub fn next(self) -> Self {
        match self {
            BatchPhase::Normal => BatchPhase::FailureRetry,
            BatchPhase::FailureRetry => BatchPhase::Normal,
        }
    }

    /// 恢复阶段没有可重放的消息时回落到正常阶段，避免饿死正常吞吐
    pub fn settle(self, retry_batch_len: usize) -> Self {
        match self {
            BatchPhase::FailureRetry if retry_batch_len == 0 => BatchPhase::Normal,
            phase => phase,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::FailureRetry => "failure_retry",
            BatchPhase::Normal => "normal",
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 周期刷新计时
#[derive(Debug, Clone)]
pub struct RefreshTimer {
    interval: Duration,
    last: Option<Instant>,
}

impl RefreshTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn has_refreshed(&self) -> bool {
        self.last.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_alternate_starting_with_failure_retry() {
        let first = BatchPhase::default().next();
        assert_eq!(first, BatchPhase::FailureRetry);
        assert_eq!(first.next(), BatchPhase::Normal);
    }

    #[test]
    fn empty_retry_batch_falls_back_to_normal() {
        assert_eq!(BatchPhase::FailureRetry.settle(0), BatchPhase::Normal);
        assert_eq!(BatchPhase::FailureRetry.settle(3), BatchPhase::FailureRetry);
        assert_eq!(BatchPhase::Normal.settle(0), BatchPhase::Normal);
    }

    #[test]
    fn every_call_ends_in_a_phase_that_can_deliver() {
        // 任意起点、任意重放结果下，一次调用最终落在的阶段要么有重放批次，要么是正常阶段
        let mut phase = BatchPhase::default();
        for retry_len in [0, 2, 0, 0, 5, 0] {
            phase = phase.next().settle(retry_len);
            assert!(phase == BatchPhase::Normal || retry_len > 0);
        }
    }

    #[test]
    fn refresh_timer() {
        let start = Instant::now();
        let mut timer = RefreshTimer::new(Duration::from_secs(60));
        assert!(!timer.has_refreshed());
        assert!(timer.is_due(start));

        timer.mark(start);
        assert!(!timer.is_due(start + Duration::from_secs(59)));
        assert!(timer.is_due(start + Duration::from_secs(60)));
    }
}
