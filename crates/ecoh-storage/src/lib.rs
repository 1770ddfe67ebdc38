//! Snapshot storage + polite HTTP fetch utilities for ecoh.

pub mod diagnostics;
pub mod fetch;
pub mod snapshot;

pub use diagnostics::{
    DiagLevel, DiagnosticLine, DiagnosticSink, FileDiagnostics, MemoryDiagnostics,
    NoopDiagnostics, ScopedLog,
};
pub use fetch::{
    classify_reqwest_error, BackoffPolicy, FetchError, FetchOutcome, HttpClientConfig,
    JitterWindow, PoliteFetcher, RawResponse, RetryDisposition, DEFAULT_USER_AGENT,
};
pub use snapshot::{
    MergeMode, MergeOutcome, SnapshotError, SnapshotId, SnapshotStore, POINT_DATA_DIR,
};

pub const CRATE_NAME: &str = "ecoh-storage";
