pub mod coordinator;
pub mod sweeper;

// Re-export key types
pub use coordinator::{RecoveryConfig, RecoveryCoordinator, RecoveryOutcome};
pub use sweeper::{SweeperConfig, TimeoutSweeper};
