//! Per-source throttling, escalating bans and the global ban breaker.
//!
//! Every source address gets a fixed counting window. Exceeding the window
//! budget bans the source for a fixed duration regardless of later window
//! rollovers. When more sources are banned at once than the configured
//! threshold, a global ban rejects every non-whitelisted source until it
//! lapses. Whitelisted sources (static list plus learned agent addresses)
//! bypass all of it.

use crate::config::RateLimitPolicy;
use crate::metrics::counters;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request may proceed.
    Allowed,
    /// The source itself is banned.
    Banned {
        /// Time until the ban lifts.
        retry_after: Duration,
    },
    /// A global ban is in effect.
    GlobalBan {
        /// Time until the global ban lifts.
        retry_after: Duration,
    },
}

impl Verdict {
    /// Returns `true` for [`Verdict::Allowed`].
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Advisory wait before retrying, if rejected.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::Banned { retry_after } | Self::GlobalBan { retry_after } => Some(*retry_after),
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Banned { .. } => "banned",
            Self::GlobalBan { .. } => "global_ban",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceState {
    Counting { count: u32, window_start: Instant },
    Banned { until: Instant },
}

#[derive(Debug)]
struct SourceEntry {
    state: SourceState,
    last_seen: Instant,
}

impl SourceEntry {
    fn is_banned_at(&self, now: Instant) -> bool {
        matches!(self.state, SourceState::Banned { until } if now < until)
    }
}

#[derive(Debug, Clone, Copy)]
enum GlobalBan {
    Inactive,
    Active { until: Instant },
}

/// Rate limiter and ban engine shared by the listener and the HTTP front-end.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    entries: DashMap<IpAddr, SourceEntry>,
    static_whitelist: HashSet<IpAddr>,
    learned_whitelist: DashSet<IpAddr>,
    global: Mutex<GlobalBan>,
}

impl RateLimiter {
    /// Creates a limiter with the given policy and static whitelist.
    #[must_use]
    pub fn new(policy: RateLimitPolicy, whitelist: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
            static_whitelist: whitelist.into_iter().collect(),
            learned_whitelist: DashSet::new(),
            global: Mutex::new(GlobalBan::Inactive),
        }
    }

    /// Records one request from `ip` and decides whether it may proceed.
    pub fn check(&self, ip: IpAddr) -> Verdict {
        self.check_at(ip, Instant::now())
    }

    /// [`RateLimiter::check`] against an explicit clock reading.
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Verdict {
        if self.is_whitelisted(&ip) {
            return Verdict::Allowed;
        }

        if let Some(retry_after) = self.global_ban_remaining(now) {
            counters::rate_limited_total("global_ban");
            return Verdict::GlobalBan { retry_after };
        }

        let (verdict, newly_banned) = self.record(ip, now);
        if newly_banned {
            tracing::info!(ip = %ip, ban_ms = self.policy.ban_duration.as_millis() as u64, "source banned");
            self.evaluate_global_ban(now);
        }
        if !verdict.is_allowed() {
            counters::rate_limited_total(verdict.reason());
        }
        verdict
    }

    /// Current standing of `ip` without counting a request: whitelist, then
    /// global ban, then individual ban.
    pub fn standing(&self, ip: IpAddr) -> Verdict {
        self.standing_at(ip, Instant::now())
    }

    /// [`RateLimiter::standing`] against an explicit clock reading.
    pub fn standing_at(&self, ip: IpAddr, now: Instant) -> Verdict {
        if self.is_whitelisted(&ip) {
            return Verdict::Allowed;
        }
        if let Some(retry_after) = self.global_ban_remaining(now) {
            return Verdict::GlobalBan { retry_after };
        }
        match self.entries.get(&ip).map(|entry| entry.state) {
            Some(SourceState::Banned { until }) if now < until => Verdict::Banned {
                retry_after: until - now,
            },
            _ => Verdict::Allowed,
        }
    }

    // The entry guard must be released before the global breaker iterates
    // the map, or the shard lock would deadlock.
    fn record(&self, ip: IpAddr, now: Instant) -> (Verdict, bool) {
        let mut entry = self.entries.entry(ip).or_insert_with(|| SourceEntry {
            state: SourceState::Counting {
                count: 0,
                window_start: now,
            },
            last_seen: now,
        });
        entry.last_seen = now;

        match entry.state {
            SourceState::Banned { until } if now < until => (
                Verdict::Banned {
                    retry_after: until - now,
                },
                false,
            ),
            SourceState::Banned { .. } => {
                entry.state = SourceState::Counting {
                    count: 1,
                    window_start: now,
                };
                (Verdict::Allowed, false)
            }
            SourceState::Counting { window_start, .. }
                if now.duration_since(window_start) >= self.policy.window =>
            {
                entry.state = SourceState::Counting {
                    count: 1,
                    window_start: now,
                };
                (Verdict::Allowed, false)
            }
            SourceState::Counting {
                count,
                window_start,
            } => {
                let count = count.saturating_add(1);
                if count > self.policy.max_requests {
                    entry.state = SourceState::Banned {
                        until: now + self.policy.ban_duration,
                    };
                    (
                        Verdict::Banned {
                            retry_after: self.policy.ban_duration,
                        },
                        true,
                    )
                } else {
                    entry.state = SourceState::Counting {
                        count,
                        window_start,
                    };
                    (Verdict::Allowed, false)
                }
            }
        }
    }

    fn global_ban_remaining(&self, now: Instant) -> Option<Duration> {
        let mut global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        match *global {
            GlobalBan::Active { until } if now < until => Some(until - now),
            GlobalBan::Active { .. } => {
                *global = GlobalBan::Inactive;
                tracing::info!("global ban lifted");
                None
            }
            GlobalBan::Inactive => None,
        }
    }

    fn evaluate_global_ban(&self, now: Instant) {
        let banned = self.banned_count_at(now);
        if banned <= self.policy.global_threshold {
            return;
        }
        let until = now + self.policy.global_ban_duration;
        let mut global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*global, GlobalBan::Inactive) {
            tracing::warn!(
                banned,
                threshold = self.policy.global_threshold,
                "global ban raised"
            );
            counters::global_bans_total();
        }
        *global = GlobalBan::Active { until };
    }

    /// Returns `true` while the global ban is in effect.
    #[must_use]
    pub fn is_globally_banned_at(&self, now: Instant) -> bool {
        self.global_ban_remaining(now).is_some()
    }

    /// Number of sources under an individual ban at `now`.
    #[must_use]
    pub fn banned_count_at(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.is_banned_at(now))
            .count()
    }

    /// Adds a learned address (the authenticated agent) to the whitelist.
    pub fn whitelist(&self, ip: IpAddr) {
        if self.learned_whitelist.insert(ip) {
            tracing::debug!(ip = %ip, "address whitelisted");
        }
        self.entries.remove(&ip);
    }

    /// Returns `true` if `ip` bypasses all throttling.
    #[must_use]
    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.static_whitelist.contains(ip) || self.learned_whitelist.contains(ip)
    }

    /// Evicts entries that are unbanned and inactive for longer than the
    /// configured number of windows. Returns how many were removed.
    pub fn purge_at(&self, now: Instant) -> usize {
        let max_idle = self.policy.window * self.policy.purge_after_windows;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.is_banned_at(now) || now.duration_since(entry.last_seen) <= max_idle
        });
        before.saturating_sub(self.entries.len())
    }

    /// Starts the periodic eviction sweep. The task ends once the limiter
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.policy.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.purge_at(Instant::now());
                if removed > 0 {
                    tracing::debug!(removed, remaining = limiter.len(), "rate-limit sweep");
                }
            }
        })
    }

    /// Number of tracked source entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no source is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The policy this limiter enforces.
    #[must_use]
    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}
