//! Sliding-window counter of completed actions.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Width of the trailing window.
const WINDOW: Duration = Duration::from_secs(60);

/// Append-only buffer of action-completion times for one campaign.
///
/// Kept only in memory and rebuilt empty on restart; the worst case is a
/// brief burst above the per-minute limit right after a restart.
#[derive(Debug, Default)]
pub struct RateWindow {
    entries: Mutex<Vec<Instant>>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed action at the current time.
    pub fn record(&self) {
        self.lock().push(Instant::now());
    }

    /// Actions completed within the trailing 60 seconds. Compacts expired
    /// entries as a side effect, so no separate cleanup pass is needed.
    pub fn count_in_last_minute(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|at| now.duration_since(*at) < WINDOW);
        entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_recent_actions() {
        let window = RateWindow::new();
        assert_eq!(window.count_in_last_minute(), 0);

        window.record();
        window.record();
        assert_eq!(window.count_in_last_minute(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_sixty_seconds() {
        let window = RateWindow::new();
        window.record();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(window.count_in_last_minute(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(window.count_in_last_minute(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counting_compacts_the_buffer() {
        let window = RateWindow::new();
        for _ in 0..100 {
            window.record();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        window.record();

        assert_eq!(window.count_in_last_minute(), 1);
        assert_eq!(window.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_ages_count_only_recent() {
        let window = RateWindow::new();
        window.record();
        tokio::time::advance(Duration::from_secs(30)).await;
        window.record();
        tokio::time::advance(Duration::from_secs(31)).await;

        // First entry is 61s old, second is 31s old.
        assert_eq!(window.count_in_last_minute(), 1);
    }
}
