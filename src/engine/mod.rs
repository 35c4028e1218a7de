// ABOUTME: Synchronization engine - detection, diffing, applying, scheduling, coordination
// ABOUTME: Re-exports the types callers of the engine work with

pub mod applier;
pub mod coordinator;
pub mod detector;
pub mod differ;
pub mod scheduler;
pub mod signature;
pub mod state;

pub use applier::ApplyOutcome;
pub use coordinator::{
    BidirectionalCoordinator, BidirectionalReport, Direction, LockRegistry, LockToken, TableLocks,
};
pub use detector::{has_changes, DatabaseSignature, Detection};
pub use differ::ChangeSet;
pub use scheduler::{sync, RunStatus, SyncEngine, SyncReport, TableResult};
pub use signature::RowSignature;
pub use state::{StateStore, SyncStateRecord};
