pub mod buf;

mod ids;
mod tag;

pub use ids::{GenerationId, GroupId, StorageTeamId};
pub use tag::{locality, Tag};

/// A commit version assigned by the sequencer.
///
/// Versions are monotonic per log group and strictly increasing across
/// commits; `0` means "nothing yet".
pub type Version = u64;

/// Ordering of messages *within* one version for one storage team.
///
/// Assigned by the commit proxy, starting at 1 per version.
pub type Subsequence = u32;

/// The recovery epoch (aka recovery count) a generation belongs to.
pub type LogEpoch = u64;
