use crate::flag::Flag;
use crate::segment::Segment;

/// Store is the read-only view of flag data that evaluation runs against.
///
/// The data store hands out immutable [crate::Snapshot]s implementing this trait, so a whole
/// evaluation, prerequisites included, sees one consistent set of items. Deleted items are never
/// returned.
pub trait Store {
    /// Retrieve the flag with key `flag_key`.
    fn flag(&self, flag_key: &str) -> Option<&Flag>;

    /// Retrieve the segment with key `segment_key`.
    fn segment(&self, segment_key: &str) -> Option<&Segment>;
}
