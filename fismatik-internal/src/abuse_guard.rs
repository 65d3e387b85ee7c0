//! Duplicate-submission guard.
//!
//! Tracks, per user, the fingerprints of recent receipt submissions inside a sliding window and
//! flags a user who keeps sending the same text. State is in-process only and lost on restart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AbuseGuardConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SubmissionRecord {
    fingerprint: String,
    at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Allowed,
    Blocked,
}

#[derive(Debug)]
pub struct AbuseGuard {
    history: DashMap<String, VecDeque<SubmissionRecord>>,
    window: Duration,
    max_duplicates: usize,
    max_entries_per_user: usize,
    prefix_chars: usize,
}

/// Coarse content digest: the first `prefix_chars` characters with whitespace runs collapsed,
/// plus the character count of the whole text.
pub fn fingerprint(text: &str, prefix_chars: usize) -> String {
    let prefix: String = text.chars().take(prefix_chars).collect();
    let normalized = prefix.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{normalized}::len={}", text.chars().count())
}

impl AbuseGuard {
    pub fn new(config: &AbuseGuardConfig) -> Self {
        Self {
            history: DashMap::new(),
            window: config.window(),
            max_duplicates: config.max_duplicates,
            max_entries_per_user: config.max_entries_per_user.max(1),
            prefix_chars: config.fingerprint_prefix_chars,
        }
    }

    pub fn check(&self, user_id: &str, text: &str) -> GuardVerdict {
        self.check_at(user_id, text, Instant::now())
    }

    /// Records a submission at `now` and reports whether the user crossed the duplicate threshold
    pub fn check_at(&self, user_id: &str, text: &str, now: Instant) -> GuardVerdict {
        if user_id.is_empty() || text.is_empty() {
            return GuardVerdict::Allowed;
        }
        let fingerprint = fingerprint(text, self.prefix_chars);

        let mut entry = self.history.entry(user_id.to_string()).or_default();
        let records = entry.value_mut();
        while records
            .front()
            .is_some_and(|record| now.saturating_duration_since(record.at) > self.window)
        {
            records.pop_front();
        }
        records.push_back(SubmissionRecord {
            fingerprint: fingerprint.clone(),
            at: now,
        });
        while records.len() > self.max_entries_per_user {
            records.pop_front();
        }

        let repeats = records
            .iter()
            .filter(|record| record.fingerprint == fingerprint)
            .count();
        if repeats >= self.max_duplicates {
            GuardVerdict::Blocked
        } else {
            GuardVerdict::Allowed
        }
    }

    /// Drops users whose newest submission fell out of the window
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.history.len();
        self.history.retain(|_, records| {
            records
                .back()
                .is_some_and(|newest| now.saturating_duration_since(newest.at) <= self.window)
        });
        before.saturating_sub(self.history.len())
    }

    pub fn tracked_users(&self) -> usize {
        self.history.len()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = guard.sweep_at(Instant::now());
                        if removed > 0 {
                            tracing::debug!("Abuse guard sweep removed {removed} idle users");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> AbuseGuard {
        AbuseGuard::new(&AbuseGuardConfig::default())
    }

    const TEXT: &str = "MIGROS TICARET A.S.\nTOPLAM 123,45\nKDV 12,34";

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        assert_eq!(fingerprint("  a \n\t b  ", 200), "a b::len=10");
        assert_eq!(fingerprint("a b", 200), "a b::len=3");
        // Same prefix, different length: distinct fingerprints
        let long_a = format!("{}{}", "x".repeat(200), "tail");
        let long_b = format!("{}{}", "x".repeat(200), "other tail");
        assert_ne!(fingerprint(&long_a, 200), fingerprint(&long_b, 200));
        assert!(fingerprint(&long_a, 200).starts_with(&"x".repeat(200)));
    }

    #[test]
    fn test_fourth_duplicate_is_blocked_and_window_resets() {
        let guard = guard();
        let start = Instant::now();
        for i in 0..3 {
            assert_eq!(
                guard.check_at("u1", TEXT, start + Duration::from_millis(i * 500)),
                GuardVerdict::Allowed
            );
        }
        assert_eq!(
            guard.check_at("u1", TEXT, start + Duration::from_millis(1500)),
            GuardVerdict::Blocked
        );
        assert_eq!(
            guard.check_at("u1", TEXT, start + Duration::from_secs(12)),
            GuardVerdict::Allowed
        );
    }

    #[test]
    fn test_whitespace_variants_count_as_duplicates() {
        let guard = guard();
        let now = Instant::now();
        assert_eq!(guard.check_at("u1", "a  b c d e f", now), GuardVerdict::Allowed);
        assert_eq!(guard.check_at("u1", "a b  c d e f", now), GuardVerdict::Allowed);
        assert_eq!(guard.check_at("u1", "a b c  d e f", now), GuardVerdict::Allowed);
        assert_eq!(guard.check_at("u1", "a b c d  e f", now), GuardVerdict::Blocked);
    }

    #[test]
    fn test_users_and_texts_are_independent() {
        let guard = guard();
        let now = Instant::now();
        for _ in 0..3 {
            guard.check_at("u1", TEXT, now);
        }
        assert_eq!(guard.check_at("u2", TEXT, now), GuardVerdict::Allowed);
        assert_eq!(guard.check_at("u1", "another receipt", now), GuardVerdict::Allowed);
        assert_eq!(guard.check_at("u1", TEXT, now), GuardVerdict::Blocked);
    }

    #[test]
    fn test_empty_inputs_are_not_recorded() {
        let guard = guard();
        assert_eq!(guard.check("", TEXT), GuardVerdict::Allowed);
        assert_eq!(guard.check("u1", ""), GuardVerdict::Allowed);
        assert_eq!(guard.tracked_users(), 0);
    }

    #[test]
    fn test_per_user_cap_drops_oldest() {
        let guard = AbuseGuard::new(&AbuseGuardConfig {
            max_entries_per_user: 2,
            ..Default::default()
        });
        let now = Instant::now();
        // With only two retained entries the threshold of four can never be reached.
        for _ in 0..10 {
            assert_eq!(guard.check_at("u1", TEXT, now), GuardVerdict::Allowed);
        }
    }

    #[test]
    fn test_sweep_removes_idle_users() {
        let guard = guard();
        let start = Instant::now();
        guard.check_at("idle", TEXT, start);
        guard.check_at("active", TEXT, start + Duration::from_secs(8));
        assert_eq!(guard.sweep_at(start + Duration::from_secs(10)), 1);
        assert_eq!(guard.tracked_users(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let guard = Arc::new(guard());
        let (tx, rx) = watch::channel(false);
        let handle = guard.spawn_sweeper(Duration::from_millis(10), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
