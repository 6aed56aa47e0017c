//! Call state machine: six observable states. Some implementations split
//! Ringing and Connected further into internal pre/post-SDP sub-states;
//! this crate collapses those since no externally visible operation ever
//! needs to distinguish them.
//!
//! States are a tagged variant rather than a class hierarchy; shared
//! behavior (idempotent re-entry, on-activation firing exactly once)
//! lives in [`crate::ua::Ua`]'s transition function rather than in
//! per-state types.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaStateKind {
    Idle,
    Trying,
    Ringing,
    Connected,
    Disconnected,
    Dead,
}

impl fmt::Display for UaStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UaStateKind::Idle => "Idle",
            UaStateKind::Trying => "Trying",
            UaStateKind::Ringing => "Ringing",
            UaStateKind::Connected => "Connected",
            UaStateKind::Disconnected => "Disconnected",
            UaStateKind::Dead => "Dead",
        })
    }
}

impl UaStateKind {
    /// Canonical transitions (UAC and UAS mirrored onto the same six
    /// states). Re-entering the current state is always rejected here;
    /// [`crate::ua::Ua::transition_to`] treats that as a no-op rather than
    /// calling this.
    pub fn can_transition_to(self, next: UaStateKind) -> bool {
        use UaStateKind::*;
        matches!(
            (self, next),
            (Idle, Trying)
                | (Trying, Ringing)
                | (Trying, Connected)
                | (Trying, Disconnected)
                | (Ringing, Connected)
                | (Ringing, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Dead)
        )
    }
}
