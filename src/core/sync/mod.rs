//! Network side of store-and-forward: upload queued records, pull commands.
//! No store lock is held while a request is in flight.

pub mod flush;
pub mod http;
pub mod poller;
pub mod transport;

use crate::core::inbox::InboxError;
use crate::core::outbox::OutboxError;
use crate::core::policy::PolicyError;

pub use flush::{FlushReport, FlushWorker};
pub use http::HttpTransport;
pub use poller::{CommandPoller, PollReport};
pub use transport::{RecordAck, Transport, TransportError, UploadBatch, WireRecord};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Inbox(#[from] InboxError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}
