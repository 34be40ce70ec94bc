use std::fmt::Debug;

use crate::typedef::FrameId;

/// The kind of access being recorded. Accepted by the replacer but ignored
/// by the LRU-K policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessType {
    #[default]
    Unknown,
    Lookup,
    Scan,
    Index,
}

pub trait Replacer: Send + Sync + Debug {
    /// Record the event that the given frame id is accessed at the current
    /// timestamp. Creates a new entry if the frame id has not been seen before.
    fn record_access(&self, frame_id: FrameId, access_type: AccessType);

    /// Toggles whether a frame may be chosen as an eviction victim.
    /// Panics if the frame id is not tracked.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Attempts to evict a frame based on the replacement policy.
    /// Returns `Some(frame_id)` if a victim was found, otherwise `None`.
    fn evict(&self) -> Option<FrameId>;

    /// Stops tracking a frame. No-op for unknown frames; panics if the frame
    /// is tracked but not evictable.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames in the replacer.
    fn size(&self) -> usize;
}
