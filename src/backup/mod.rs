// Backup and Restore - selection, transfer, retention and the workflow tying them together

/// Keep-last-N pruning of remote backups
pub mod retention;
/// Shell-glob table selection
pub mod selector;
/// Tree and archive upload/download strategies
pub mod transfer;
/// Data model shared by the workflow steps
pub mod types;
/// Freeze, upload, download, create-tables, restore and clean
pub mod workflow;

pub use retention::RetentionPolicy;
pub use selector::{select_for_freeze, select_for_restore, SelectionError, TablePattern};
pub use transfer::{strategy_for, ArchiveTransfer, TransferStrategy, TreeTransfer};
pub use types::{
    BackupCatalog, BackupObject, BackupPartition, BackupTable, BackupTableId, CleanupResult,
    CreateTablesResult, DownloadResult, FreezeResult, RestoreResult, RestoreTable, Table,
    TableOutcome, UploadResult,
};
pub use workflow::BackupWorkflow;
