//! Entry file swap: capture backups, install a target profile's payload
//! files, and restore from backups when a switch unwinds.

pub mod engine;
pub mod manifest;

pub use engine::{
    backup_entry_files, plan_swap, restore_entry_files, swap_entry_files, PlannedEntry, SwapPlan,
};
pub use manifest::{file_sha256, BackupManifest, EntryBackup};
