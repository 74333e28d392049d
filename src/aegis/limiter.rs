use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

/// Sliding-window capacities. Swappable at runtime via config reload; each
/// admission check reads the current snapshot.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub max_connections: usize,
    pub conn_window: Duration,
    pub max_packets: usize,
    pub packet_window: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            conn_window: Duration::from_secs(60),
            max_packets: 100,
            packet_window: Duration::from_secs(1),
        }
    }
}

/// Why an admission check said no.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Reject {
    #[error("connections globally disallowed")]
    Disabled,
    #[error("ip is blocked")]
    Blocked,
    #[error("connection quota exceeded")]
    ConnQuota,
    #[error("packet quota exceeded")]
    PacketQuota,
}

impl Reject {
    pub fn as_label(&self) -> &'static str {
        match self {
            Reject::Disabled => "disabled",
            Reject::Blocked => "blocked",
            Reject::ConnQuota => "conn_quota",
            Reject::PacketQuota => "packet_quota",
        }
    }
}

#[derive(Debug, Default)]
struct RateRecord {
    connections: VecDeque<Instant>,
    packets: VecDeque<Instant>,
}

/// Purge-then-check-then-append over one timestamp deque. The window is
/// half-open: an entry exactly `window` old is already outside it.
fn allow(times: &mut VecDeque<Instant>, now: Instant, window: Duration, cap: usize) -> bool {
    while let Some(t) = times.front() {
        if now.duration_since(*t) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
    if times.len() >= cap {
        return false;
    }
    times.push_back(now);
    true
}

/// Process-wide admission state: per-IP sliding-window rate records, the
/// block list, per-IP live-connection counts, and the global accept switch.
///
/// Every connection's client-to-backend task hits this concurrently; each
/// per-IP mutation happens under its DashMap shard lock, so a single
/// `allow_*` call is atomic with respect to its purge/check/append sequence.
pub struct Limiter {
    settings: ArcSwap<LimiterSettings>,
    records: DashMap<String, RateRecord>,
    blocked: DashSet<String>,
    active: DashMap<String, u64>,
    accepting: AtomicBool,
}

impl Limiter {
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
            records: DashMap::new(),
            blocked: DashSet::new(),
            active: DashMap::new(),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn update_settings(&self, settings: LimiterSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Full accept-time decision: kill switch, then block list, then the
    /// connection window. Quota rejection does not record the attempt.
    pub fn check_accept(&self, ip: &str) -> Result<(), Reject> {
        self.check_accept_at(ip, Instant::now())
    }

    fn check_accept_at(&self, ip: &str, now: Instant) -> Result<(), Reject> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(Reject::Disabled);
        }
        if self.is_blocked(ip) {
            return Err(Reject::Blocked);
        }
        let s = self.settings.load();
        let mut rec = self.records.entry(ip.to_string()).or_default();
        if allow(&mut rec.connections, now, s.conn_window, s.max_connections) {
            Ok(())
        } else {
            Err(Reject::ConnQuota)
        }
    }

    /// Per-frame decision: a mid-session block wins over any quota standing.
    /// Called once per decoded frame, never per raw chunk.
    pub fn check_frame(&self, ip: &str) -> Result<(), Reject> {
        self.check_frame_at(ip, Instant::now())
    }

    fn check_frame_at(&self, ip: &str, now: Instant) -> Result<(), Reject> {
        if self.is_blocked(ip) {
            return Err(Reject::Blocked);
        }
        let s = self.settings.load();
        let mut rec = self.records.entry(ip.to_string()).or_default();
        if allow(&mut rec.packets, now, s.packet_window, s.max_packets) {
            Ok(())
        } else {
            Err(Reject::PacketQuota)
        }
    }

    /// Idempotent. Returns false if the IP was already blocked.
    pub fn block(&self, ip: &str) -> bool {
        self.blocked.insert(ip.trim().to_string())
    }

    /// Idempotent. Returns false if the IP was not blocked.
    pub fn unblock(&self, ip: &str) -> bool {
        self.blocked.remove(ip.trim()).is_some()
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked.contains(ip)
    }

    pub fn list_blocked(&self) -> Vec<String> {
        let mut out: Vec<String> = self.blocked.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    pub fn set_accepting(&self, enabled: bool) {
        self.accepting.store(enabled, Ordering::Relaxed);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Track a live connection for `ip`; the returned guard decrements the
    /// count when the connection's relay pair finishes.
    pub fn track(self: &Arc<Self>, ip: &str) -> ActiveConnGuard {
        *self.active.entry(ip.to_string()).or_insert(0) += 1;
        ActiveConnGuard {
            limiter: self.clone(),
            ip: ip.to_string(),
        }
    }

    pub fn connection_counts(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .active
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort();
        out
    }

    /// Drop rate records that have aged out entirely and have no live
    /// connection. Run from the periodic maintenance task, not the relay.
    pub fn evict_idle(&self) {
        let s = self.settings.load();
        let now = Instant::now();
        self.records.retain(|ip, rec| {
            while let Some(t) = rec.connections.front() {
                if now.duration_since(*t) >= s.conn_window {
                    rec.connections.pop_front();
                } else {
                    break;
                }
            }
            while let Some(t) = rec.packets.front() {
                if now.duration_since(*t) >= s.packet_window {
                    rec.packets.pop_front();
                } else {
                    break;
                }
            }
            let live = self.active.get(ip).map(|c| *c > 0).unwrap_or(false);
            live || !rec.connections.is_empty() || !rec.packets.is_empty()
        });
        self.active.retain(|_, c| *c > 0);
    }
}

pub struct ActiveConnGuard {
    limiter: Arc<Limiter>,
    ip: String,
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        if let Some(mut c) = self.limiter.active.get_mut(&self.ip) {
            *c = c.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_conn: usize, conn_secs: u64, max_pkt: usize, pkt_secs: u64) -> Arc<Limiter> {
        Arc::new(Limiter::new(LimiterSettings {
            max_connections: max_conn,
            conn_window: Duration::from_secs(conn_secs),
            max_packets: max_pkt,
            packet_window: Duration::from_secs(pkt_secs),
        }))
    }

    #[test]
    fn three_attempts_in_five_seconds_accept_two() {
        let l = limiter(2, 60, 100, 1);
        let t0 = Instant::now();
        assert!(l.check_accept_at("10.0.0.1", t0).is_ok());
        assert!(l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(2)).is_ok());
        assert_eq!(
            l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(5)),
            Err(Reject::ConnQuota)
        );
    }

    #[test]
    fn connection_window_slides() {
        let l = limiter(2, 60, 100, 1);
        let t0 = Instant::now();
        assert!(l.check_accept_at("10.0.0.1", t0).is_ok());
        assert!(l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(1)).is_ok());
        assert!(l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(30)).is_err());
        // t0 falls out exactly at t0+60 (half-open window).
        assert!(l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn rejected_attempt_is_not_recorded() {
        let l = limiter(1, 60, 100, 1);
        let t0 = Instant::now();
        assert!(l.check_accept_at("10.0.0.1", t0).is_ok());
        for i in 1..10 {
            assert!(l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(i)).is_err());
        }
        // Only the accepted attempt counts; the window clears when it ages out.
        assert!(l.check_accept_at("10.0.0.1", t0 + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn ips_are_limited_independently() {
        let l = limiter(1, 60, 100, 1);
        let t0 = Instant::now();
        assert!(l.check_accept_at("10.0.0.1", t0).is_ok());
        assert!(l.check_accept_at("10.0.0.2", t0).is_ok());
        assert!(l.check_accept_at("10.0.0.1", t0).is_err());
    }

    #[test]
    fn packet_window_is_independent_of_connections() {
        let l = limiter(1, 60, 3, 1);
        let t0 = Instant::now();
        assert!(l.check_accept_at("10.0.0.1", t0).is_ok());
        for _ in 0..3 {
            assert!(l.check_frame_at("10.0.0.1", t0).is_ok());
        }
        assert_eq!(
            l.check_frame_at("10.0.0.1", t0),
            Err(Reject::PacketQuota)
        );
        assert!(l.check_frame_at("10.0.0.1", t0 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn block_wins_over_zero_usage() {
        let l = limiter(5, 60, 100, 1);
        assert!(l.block("10.0.0.9"));
        assert_eq!(l.check_accept("10.0.0.9"), Err(Reject::Blocked));
        assert_eq!(l.check_frame("10.0.0.9"), Err(Reject::Blocked));
    }

    #[test]
    fn block_unblock_are_idempotent() {
        let l = limiter(5, 60, 100, 1);
        assert!(l.block("10.0.0.9"));
        assert!(!l.block("10.0.0.9"));
        assert_eq!(l.list_blocked(), vec!["10.0.0.9".to_string()]);
        assert!(l.unblock("10.0.0.9"));
        assert!(!l.unblock("10.0.0.9"));
        assert!(l.list_blocked().is_empty());
        assert!(l.check_accept("10.0.0.9").is_ok());
    }

    #[test]
    fn kill_switch_rejects_everyone() {
        let l = limiter(5, 60, 100, 1);
        l.set_accepting(false);
        assert_eq!(l.check_accept("10.0.0.1"), Err(Reject::Disabled));
        l.set_accepting(true);
        assert!(l.check_accept("10.0.0.1").is_ok());
    }

    #[test]
    fn active_counts_follow_guard_lifetime() {
        let l = limiter(5, 60, 100, 1);
        let g1 = l.track("10.0.0.1");
        let g2 = l.track("10.0.0.1");
        assert_eq!(l.connection_counts(), vec![("10.0.0.1".to_string(), 2)]);
        drop(g1);
        assert_eq!(l.connection_counts(), vec![("10.0.0.1".to_string(), 1)]);
        drop(g2);
        assert!(l.connection_counts().is_empty());
    }

    #[test]
    fn evict_idle_drops_aged_records() {
        let l = limiter(5, 0, 100, 0);
        assert!(l.check_accept("10.0.0.1").is_ok());
        l.evict_idle();
        assert!(l.records.is_empty());
    }
}
