//! Relaying changes from discarded data to the data that stays authoritative.
//!
//! When a fresh reload turns out equivalent to the cached state, the cache
//! keeps the old objects and drops the new ones. Participants may still hold
//! the new objects and report changes on them; the forwarding links set up
//! here re-emit those changes on the retained objects, and through them on
//! the retained snapshot. Links live as long as the snapshot that owns them,
//! or until the discarded object is dropped.

use crate::data::ParticipantData;
use crate::snapshot::StateSnapshot;
use std::sync::Arc;
use tracing::debug;

/// Forward events of each superseded data object to its survivor. Links are
/// owned by `owner`.
pub fn forward_data(
    owner: &StateSnapshot,
    pairs: &[(Arc<ParticipantData>, Arc<ParticipantData>)],
) -> usize {
    let mut linked = 0;
    for (superseded, surviving) in pairs {
        if Arc::ptr_eq(superseded, surviving) {
            continue;
        }
        let target = Arc::downgrade(surviving);
        owner.link(superseded.subscribe(move |event| {
            if let Some(surviving) = target.upgrade() {
                surviving.relay(event);
            }
        }));
        linked += 1;
    }
    if linked > 0 {
        debug!("Forwarding {} data objects into snapshot {}", linked, owner.id());
    }
    linked
}
