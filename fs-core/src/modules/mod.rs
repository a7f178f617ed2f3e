//! AuroraFS feature modules
//!
//! Block codecs, the deduplication ledger, snapshots, scrub and the
//! journal collaborator. Each is gated by a superblock feature bit except
//! the codec layer and the reference ledger, which every volume uses.

pub mod checksums;
pub mod codec;
pub mod dedup;
pub mod journaling;
pub mod snapshot;

// Re-export scrub types
pub use checksums::{RebuildReport, ScrubReport};

// Re-export dedup types
pub use dedup::{DedupEntry, DedupIndex, DedupStats};

// Re-export journaling types
pub use journaling::{Journal, MemoryJournal, Transaction, TransactionState, TxnId};

// Re-export snapshot types
pub use snapshot::{SnapshotInfo, SnapshotTable};
