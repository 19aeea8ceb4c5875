#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Error (common error types)
pub mod error;

/// Key-value stores over a CRDT append-only array
pub mod kv;

/// Cell and row layers over the LWW store
pub mod store;

/// Schema capabilities for tables and kv definitions
pub mod schema;

/// Schema-validated table and kv accessors
pub mod table;

/// Workspace client and extension builder
pub mod workspace;

/// Per-file content documents and their pool
pub mod content;

/// Collaborative virtual filesystem
pub mod fs;

mod value;

pub use content::{
    ContentDoc, ContentDocPool, ContentKind, ProviderContext, ProviderLifecycle, VersionInfo,
};
pub use error::{EpicenterError, FsError, FsErrorCode, Result, SchemaError, ValidationError};
pub use fs::{
    CpOptions, DirEntry, FileContent, FileKind, FileRow, FileStat, FileSystem, FsEvent, FsResult,
    MkdirOptions, RmOptions,
};
pub use kv::{EntryChange, LwwEntry, ObserverHandle, TimeSource, YKeyValue, YKeyValueLww};
pub use schema::{KvSchema, RowRecord, TableSchema, TypedSchema, Versioned};
pub use store::{CellAction, CellChange, CellStore, RowStore};
pub use table::{GetResult, KvHelper, OneOrMany, TableHelper};
pub use workspace::{
    BoxFuture, ExtensionContext, Extensions, Lifecycle, WorkspaceBuilder, WorkspaceClient,
    WorkspaceDefinition, create_workspace,
};
