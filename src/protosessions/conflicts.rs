use crate::hits::Hit;

/// Outcome of resolving one conflicting hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Append the hit to the proto-session it now points at
    Save,
    /// Drop the owner's stored proto-session and requeue all of its hits
    /// together with this one
    Evict,
}

/// What to do with a hit whose identifier already belongs to another
/// proto-session
pub trait ConflictStrategy: Send + Sync {
    fn resolve(&self, hit: &mut Hit, owner: &str) -> Resolution;

    fn name(&self) -> &'static str;
}

/// Move the hit into the owner's proto-session
#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteIdAndUpdateInPlace;

impl ConflictStrategy for RewriteIdAndUpdateInPlace {
    fn resolve(&self, hit: &mut Hit, owner: &str) -> Resolution {
        hit.authoritative_client_id = owner.to_string();
        Resolution::Save
    }

    fn name(&self) -> &'static str {
        "rewrite_id_and_update_in_place"
    }
}

/// Rebuild the owner's proto-session from the queue instead of patching it.
///
/// The hit is pointed at the owner, then the owner's stored hits are read
/// back, requeued with the hit and removed from the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictWholeProtoSession;

impl ConflictStrategy for EvictWholeProtoSession {
    fn resolve(&self, hit: &mut Hit, owner: &str) -> Resolution {
        hit.authoritative_client_id = owner.to_string();
        Resolution::Evict
    }

    fn name(&self) -> &'static str {
        "evict_whole_protosession"
    }
}
