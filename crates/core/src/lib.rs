//! stowage-core: storage-space transfers without a specific SDK
//!
//! This crate provides:
//! - Configuration and profile management
//! - Storage spaces, their access policy and object paths
//! - The `ChunkTransport` and `ObjectStore` traits implemented by backends
//! - Byte sources and sinks
//! - The transfer engine with progress, cancellation and observers
//! - `DataClient`, the request layer most callers start from
//!
//! Backends live in their own crates (see `stowage-s3`), so everything here can
//! be tested against in-memory transports.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod path;
pub mod profile;
pub mod space;
pub mod traits;
pub mod transfer;

pub use auth::Authorization;
pub use client::{ClientConfig, DataClient, Storage};
pub use config::{Config, ConfigManager, Defaults};
pub use error::{Error, Result};
pub use io::{ByteSink, ByteSource, FileSink, MemorySink, MemorySource, ReaderSource};
pub use path::{ObjectPath, parse_object_path};
pub use profile::{Profile, ProfileManager, RetryConfig, TimeoutConfig};
pub use space::{Access, Operation, Space};
pub use traits::{
    Backend, ChunkRead, ChunkTransport, DownloadSession, ObjectInfo, ObjectStore,
    PARTS_METADATA_KEY, SessionHandle, UploadMetadata, split_part_key,
};
pub use transfer::{
    DownloadRequest, TransferConfig, TransferEngine, TransferEvent, TransferHandler,
    TransferProgress, TransferStatus, UploadRequest,
};
