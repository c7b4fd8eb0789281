pub mod artifact;
pub mod clock;
pub mod components;
pub mod coordinator;
pub mod crypto;
pub mod failover;
pub mod lock;
pub mod manifest;
pub mod notifications;
pub mod platform;
pub mod registry;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod transport;
pub mod verifier;

pub use coordinator::{BackupCoordinator, BackupRun};
pub use failover::{FailoverController, FailoverEvent, FailoverOutcome};
pub use manifest::{BackupManifest, BackupMode, ManifestRef, ManifestStatus};
pub use restore::{RestoreOrchestrator, RestorePhase, RestoreSession};
pub use retention::{PruneReport, RetentionManager};
