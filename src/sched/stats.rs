//! Per-task execution statistics

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bounded ring of recent execution times kept per task.
const RECENT_DURATIONS: usize = 16;

/// Bounded ring of recent error messages kept per task.
const RECENT_ERRORS: usize = 8;

/// Success/error counters plus bounded rings of recent outcomes.
#[derive(Default)]
pub struct TaskStatistics {
    success_count: AtomicU64,
    error_count: AtomicU64,
    recent_durations: Mutex<VecDeque<Duration>>,
    recent_errors: Mutex<VecDeque<String>>,
}

impl TaskStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, took: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let mut durations = self.recent_durations.lock();
        if durations.len() == RECENT_DURATIONS {
            durations.pop_front();
        }
        durations.push_back(took);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut errors = self.recent_errors.lock();
        if errors.len() == RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(message.into());
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn recent_durations(&self) -> Vec<Duration> {
        self.recent_durations.lock().iter().copied().collect()
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.recent_errors.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TaskStatistics::new();
        stats.record_success(Duration::from_millis(5));
        stats.record_success(Duration::from_millis(7));
        stats.record_error("boom");

        assert_eq!(stats.success_count(), 2);
        assert_eq!(stats.error_count(), 1);
        assert_eq!(stats.recent_durations().len(), 2);
        assert_eq!(stats.recent_errors(), vec!["boom".to_string()]);
    }

    #[test]
    fn rings_stay_bounded() {
        let stats = TaskStatistics::new();
        for i in 0..40 {
            stats.record_success(Duration::from_millis(i));
            stats.record_error(format!("err {i}"));
        }

        let durations = stats.recent_durations();
        assert_eq!(durations.len(), RECENT_DURATIONS);
        assert_eq!(*durations.last().unwrap(), Duration::from_millis(39));

        let errors = stats.recent_errors();
        assert_eq!(errors.len(), RECENT_ERRORS);
        assert_eq!(errors.last().unwrap(), "err 39");
    }
}
