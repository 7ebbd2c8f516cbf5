//! Overcast Transfer - upload/download scheduling
//!
//! - **Jobs** - [`TransferJob`] tracks one upload or download from QUEUED to a terminal state
//! - **Queues** - [`TransferQueue`] runs one job at a time per provider and direction, in FIFO order
//! - **Manager** - [`TransferManager`] validates requests, plans folder transfers and owns both queues
//! - **Provider port** - [`TransferProvider`] plus the [`TransferCallback`] surface providers report through

pub mod events;
pub mod job;
pub mod manager;
pub mod provider;
pub mod queue;

pub use events::{TransferCallback, TransferEvent};
pub use job::{
    TransferChannel, TransferDirection, TransferJob, TransferListener, TransferState,
    TransferUpdate,
};
pub use manager::TransferManager;
pub use provider::{DownloadRequest, TransferProvider, UploadRequest};
pub use queue::TransferQueue;
