//! 时钟抽象
//!
//! 签发、轮换和验证都依赖当前时间，通过 [`Clock`] 注入以便测试推进时间。

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// 时间来源
pub trait Clock: Send + Sync {
    /// 当前时间
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟，精度为秒
#[derive(Debug, Clone)]
pub struct ManualClock {
    seconds: Arc<AtomicI64>,
}

impl ManualClock {
    /// 从给定的 Unix 秒开始
    pub fn new(unix_seconds: i64) -> Self {
        Self {
            seconds: Arc::new(AtomicI64::new(unix_seconds)),
        }
    }

    /// 向前推进
    pub fn advance(&self, by: Duration) {
        self.seconds.fetch_add(by.num_seconds(), Ordering::SeqCst);
    }

    /// 设置为指定时间
    pub fn set(&self, unix_seconds: i64) {
        self.seconds.store(unix_seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.seconds.load(Ordering::SeqCst);
        DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// 共享时钟句柄
pub type SharedClock = Arc<dyn Clock>;

/// 默认系统时钟句柄
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now().timestamp(), 1_000);
        clock.advance(Duration::seconds(300));
        assert_eq!(clock.now().timestamp(), 1_300);

        // 克隆共享同一时间
        let other = clock.clone();
        other.set(5_000);
        assert_eq!(clock.now().timestamp(), 5_000);
    }
}
