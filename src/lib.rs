pub mod api;
pub mod config;
pub mod http_client;
pub mod sentiment;
pub mod status;
pub mod sync;

pub use api::{ApiClient, CredentialProvider, StatusTransport, TransportError};
pub use sentiment::{analyze, SentimentReport};
pub use status::{SubjectKind, TrainingStatus, TrainingStatusEvent};
pub use sync::{StatusSynchronizer, SyncFault, SyncSettings};
