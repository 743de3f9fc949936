// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-connection and per-request admission controls.
//!
//! Connection-time checks: blacklist, whitelist (when non-empty), and a
//! per-IP connection ceiling held for the lifetime of the connection.
//! Request-time check: a trailing-edge gate admitting at most one request
//! per second per IP, independent of the gate's token bucket. Both limiter
//! layers sit in the same hot path on purpose; each has its own knob.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// Why a connection or request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    Blacklisted,
    NotWhitelisted,
    TooManyConnections,
}

impl std::fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blacklisted => write!(f, "blacklisted"),
            Self::NotWhitelisted => write!(f, "not whitelisted"),
            Self::TooManyConnections => write!(f, "too many connections"),
        }
    }
}

impl AdmissionRejection {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Blacklisted => "blacklist",
            Self::NotWhitelisted => "whitelist",
            Self::TooManyConnections => "conn_per_ip",
        }
    }
}

/// Holds one per-IP connection count slot; dropping it decrements.
pub struct IpConnectionGuard {
    ip: IpAddr,
    counts: Arc<DashMap<IpAddr, usize>>,
}

impl Drop for IpConnectionGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(&self.ip, |_, count| *count == 0);
    }
}

/// DDoS admission state shared by all connections.
pub struct AdmissionControl {
    max_conn_per_ip: usize,
    rate_limit_per_ip: u64,
    blacklist: HashSet<IpAddr>,
    whitelist: HashSet<IpAddr>,
    conn_counts: Arc<DashMap<IpAddr, usize>>,
    last_request: DashMap<IpAddr, Instant>,
}

impl AdmissionControl {
    /// `max_conn_per_ip` of zero means unlimited; `rate_limit_per_ip` of
    /// zero disables the per-IP request gate.
    pub fn new(
        max_conn_per_ip: usize,
        rate_limit_per_ip: u64,
        blacklist: impl IntoIterator<Item = IpAddr>,
        whitelist: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            max_conn_per_ip,
            rate_limit_per_ip,
            blacklist: blacklist.into_iter().collect(),
            whitelist: whitelist.into_iter().collect(),
            conn_counts: Arc::new(DashMap::new()),
            last_request: DashMap::new(),
        }
    }

    /// Connection-time admission. A granted connection holds its per-IP
    /// slot until the guard drops.
    pub fn admit_connection(&self, ip: IpAddr) -> Result<IpConnectionGuard, AdmissionRejection> {
        let rejection = self.connection_rejection(ip);
        if let Some(rejection) = rejection {
            crate::metrics::record_admission_rejection(rejection.metric_label());
            return Err(rejection);
        }

        if self.max_conn_per_ip > 0 {
            let mut count = self.conn_counts.entry(ip).or_insert(0);
            if *count >= self.max_conn_per_ip {
                drop(count);
                crate::metrics::record_admission_rejection(
                    AdmissionRejection::TooManyConnections.metric_label(),
                );
                return Err(AdmissionRejection::TooManyConnections);
            }
            *count += 1;
        }

        Ok(IpConnectionGuard {
            ip,
            counts: self.conn_counts.clone(),
        })
    }

    fn connection_rejection(&self, ip: IpAddr) -> Option<AdmissionRejection> {
        if self.blacklist.contains(&ip) {
            return Some(AdmissionRejection::Blacklisted);
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(&ip) {
            return Some(AdmissionRejection::NotWhitelisted);
        }
        None
    }

    /// Trailing-edge per-IP request gate: the first request from an IP is
    /// always admitted; later requests only once a full second has passed
    /// since the previous admitted one. A rejected request does not move
    /// the window.
    pub fn check_request_rate(&self, ip: IpAddr) -> bool {
        if self.rate_limit_per_ip == 0 {
            return true;
        }

        let now = Instant::now();
        match self.last_request.get(&ip).map(|at| *at) {
            Some(last) if now.duration_since(last) < std::time::Duration::from_secs(1) => {
                crate::metrics::record_admission_rejection("ip_rate");
                false
            }
            _ => {
                self.last_request.insert(ip, now);
                true
            }
        }
    }

    /// Current connection count for an IP (monitoring only).
    #[must_use]
    pub fn connections_for(&self, ip: IpAddr) -> usize {
        self.conn_counts.get(&ip).map_or(0, |count| *count)
    }
}
