//! Idempotent bulk loader for seeding the store from declarative configuration.
//!
//! Components, leaves first:
//!
//! 1. **Statistics** (`stats`) - counters shared by every step of one run
//! 2. **Batch writer** (`batch`) - chunked multi-row inserts with a conflict policy
//! 3. **Existence probe** (`existence`) - match counting with conflict detection
//! 4. **Upsert resolver** (`upsert`) - insert, update or skip keyed by match columns
//! 5. **Transactions** (`transaction`) - one serialized write scope per handle
//! 6. **Integrity** (`integrity`) - post-load counts, foreign keys, uniqueness
//! 7. **Coordination** (`coordinator`) - drives a whole bootstrap run
//!
//! Every writer takes `&mut SqliteConnection`, which both a pooled connection and
//! a [`TransactionScope`] provide, so the same call works in or out of a transaction.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use festival_bootstrap::loader::{Bootstrapper, BootstrapOptions};
//! use festival_bootstrap::models::JsonFileSource;
//!
//! let loader = Bootstrapper::new(db, BootstrapOptions::default());
//! let run = loader.run(&JsonFileSource::new("festival.json")).await;
//!
//! println!("{}", run.summary());
//! std::process::exit(run.exit_code().into());
//! ```

pub mod batch;
pub mod coordinator;
pub mod data_structures;
pub mod existence;
pub mod integrity;
pub mod settings;
pub mod sql;
pub mod stats;
pub mod transaction;
pub mod upsert;

// Re-export main types
pub use batch::{BatchInsertOptions, ConflictAction, DEFAULT_CHUNK_SIZE, safe_batch_insert};
pub use coordinator::{BootstrapOptions, BootstrapRun, Bootstrapper, LoadReport};
pub use data_structures::{
    BatchInsertResult, ExistenceResult, Record, Row, SqlValue, UpsertAction, UpsertResult,
};
pub use existence::{check_record_exists, ensure_unambiguous};
pub use integrity::{IntegrityExpectations, IntegrityReport, verify_integrity};
pub use stats::{OperationStats, StatsSnapshot};
pub use transaction::{TransactionCoordinator, TransactionOptions, TransactionScope};
pub use upsert::{UpsertOptions, safe_upsert};
