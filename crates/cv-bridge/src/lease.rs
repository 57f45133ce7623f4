//! Backend lease election: at most one live SSE responder per pair. A
//! backend that holds the lease answers `server-events`; a second backend
//! connecting to the same pair is either queued behind it or pre-empts it,
//! depending on `takeover`, and the displaced holder is told over its own
//! signal sink rather than just dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cv_domain::{Error, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sent to a lease holder's signal sink when it is displaced by a takeover.
#[derive(Debug, Clone)]
pub enum LeaseSignal {
    Revoked,
}

struct Lease {
    holder_id: Uuid,
    acquired_at: Instant,
    ttl: Duration,
    signal: mpsc::Sender<LeaseSignal>,
}

/// `pair_id -> current lease`, guarded by a single `RwLock`. Expired leases
/// are reaped lazily on the next `acquire`/`status` call for that pair —
/// there is no background sweeper, since a pair with no traffic has no
/// reason to burn a timer.
pub struct LeaseTable {
    leases: RwLock<HashMap<String, Lease>>,
    default_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    Free,
}

impl LeaseTable {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            default_ttl: Duration::from_millis(default_ttl_ms),
        }
    }

    fn is_expired(lease: &Lease) -> bool {
        lease.acquired_at.elapsed() > lease.ttl
    }

    pub fn status(&self, pair_id: &str) -> LeaseStatus {
        let held = self
            .leases
            .read()
            .get(pair_id)
            .map(|l| !Self::is_expired(l))
            .unwrap_or(false);
        if held {
            LeaseStatus::Held
        } else {
            LeaseStatus::Free
        }
    }

    /// Attempts to acquire the lease for `pair_id`. If it is free (never
    /// held, expired, or previously released) the caller becomes the
    /// holder. If it is held by someone else: `takeover=false` returns
    /// `Error::BackendDenied`; `takeover=true` revokes the current holder
    /// (best-effort signal send, ignored if their receiver is gone) and
    /// replaces it.
    pub fn acquire(
        &self,
        pair_id: &str,
        signal: mpsc::Sender<LeaseSignal>,
        takeover: bool,
    ) -> Result<Uuid> {
        let mut leases = self.leases.write();
        if let Some(existing) = leases.get(pair_id) {
            if !Self::is_expired(existing) {
                if !takeover {
                    return Err(Error::BackendDenied);
                }
                let _ = existing.signal.try_send(LeaseSignal::Revoked);
            }
        }

        let holder_id = Uuid::new_v4();
        leases.insert(
            pair_id.to_string(),
            Lease {
                holder_id,
                acquired_at: Instant::now(),
                ttl: self.default_ttl,
                signal,
            },
        );
        Ok(holder_id)
    }

    /// Releases the lease iff `holder_id` is still the current holder.
    /// Returns `Error::BackendNotHeld` if someone else holds it (or it was
    /// already released), so a stale caller can't release a lease it no
    /// longer owns.
    pub fn release(&self, pair_id: &str, holder_id: Uuid) -> Result<()> {
        let mut leases = self.leases.write();
        match leases.get(pair_id) {
            Some(l) if l.holder_id == holder_id => {
                leases.remove(pair_id);
                Ok(())
            }
            _ => Err(Error::BackendNotHeld),
        }
    }

    /// Extends the current holder's TTL window (a heartbeat). Returns
    /// `Error::BackendNotHeld` if `holder_id` no longer holds the lease.
    pub fn renew(&self, pair_id: &str, holder_id: Uuid) -> Result<()> {
        let mut leases = self.leases.write();
        match leases.get_mut(pair_id) {
            Some(l) if l.holder_id == holder_id && !Self::is_expired(l) => {
                l.acquired_at = Instant::now();
                Ok(())
            }
            _ => Err(Error::BackendNotHeld),
        }
    }

    /// Resumes a refreshed `server-events` stream presenting a still-valid
    /// `lease_id` without going through `acquire`'s election: swaps in the
    /// new stream's signal sink (the old one is gone along with its
    /// dropped SSE connection) and renews the TTL. Returns
    /// `Error::BackendNotHeld` if `lease_id` is unknown or expired, in
    /// which case the caller must re-`acquire` instead.
    pub fn rebind(
        &self,
        pair_id: &str,
        lease_id: Uuid,
        signal: mpsc::Sender<LeaseSignal>,
    ) -> Result<()> {
        let mut leases = self.leases.write();
        match leases.get_mut(pair_id) {
            Some(l) if l.holder_id == lease_id && !Self::is_expired(l) => {
                l.signal = signal;
                l.acquired_at = Instant::now();
                Ok(())
            }
            _ => Err(Error::BackendNotHeld),
        }
    }
}
