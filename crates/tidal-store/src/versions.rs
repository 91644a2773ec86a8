//! Version-sequence helpers shared by the backends and the history manager.

use tidal_types::{Oid, Tid, VersionInfo};

use crate::error::{StoreError, StoreResult};

/// Pick the version effective strictly before `before`.
///
/// `tids` must be sorted ascending and free of duplicates. Returns the index
/// of the chosen version and the tid of the version that superseded it.
pub fn resolve_before(tids: &[Tid], before: Tid) -> Option<(usize, Option<Tid>)> {
    let idx = tids.partition_point(|tid| *tid < before);
    if idx == 0 {
        return None;
    }
    let chosen = idx - 1;
    Some((chosen, tids.get(chosen + 1).copied()))
}

/// Check that a newest-first listing forms a contiguous version chain.
///
/// Every version must link to the next older one through `prev_tid`. When the
/// listing reaches the oldest retained version (`reached_oldest`), that
/// version must either be a creation or link to a tid pruned by a pack,
/// i.e. one older than `packed_before`.
pub fn verify_chain(
    oid: Oid,
    listing: &[VersionInfo],
    reached_oldest: bool,
    packed_before: Option<Tid>,
) -> StoreResult<()> {
    for pair in listing.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        if newer.tid <= older.tid {
            return Err(StoreError::Corruption(format!(
                "{oid}: versions out of order ({} listed before {})",
                newer.tid, older.tid
            )));
        }
        if newer.prev_tid != Some(older.tid) {
            return Err(StoreError::Corruption(format!(
                "{oid}: version {} follows {:?} but the next stored version is {}",
                newer.tid, newer.prev_tid, older.tid
            )));
        }
    }

    if reached_oldest {
        if let Some(oldest) = listing.last() {
            match (oldest.prev_tid, packed_before) {
                (None, _) => {}
                (Some(prev), Some(boundary)) if prev < boundary => {}
                (Some(prev), _) => {
                    return Err(StoreError::Corruption(format!(
                        "{oid}: version {} follows {prev}, which is missing",
                        oldest.tid
                    )));
                }
            }
        }
    }

    Ok(())
}
