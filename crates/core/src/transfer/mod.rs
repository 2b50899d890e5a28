//! Chunked, observable, cancellable transfers
//!
//! [`TransferEngine`] starts uploads and downloads on the tokio runtime and
//! returns a [`TransferHandler`] for each straight away. The handler reports
//! status and progress, waits for completion, cancels, pauses, and accepts
//! observer callbacks.

mod engine;
mod handler;
mod observer;
mod progress;
mod registry;
mod status;
mod task;

pub use engine::{DownloadRequest, TransferConfig, TransferEngine, UploadRequest};
pub use handler::{TransferHandler, TransferSnapshot};
pub use observer::{Callback, CallbackToken, TransferEvent};
pub use progress::{ProgressTracker, TransferProgress};
pub use registry::{TransferRegistry, TransferSummary};
pub use status::{Direction, TransferId, TransferStatus};
