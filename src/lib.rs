pub mod config;
pub mod connector;
pub mod credentials;
pub mod db;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod sink;
pub mod state;
pub mod token;
pub mod window;

pub use connector::{Connector, NormalizedRecord, RestConnector};
pub use credentials::{AuthScheme, CredentialBundle};
pub use error::SyncError;
pub use orchestrator::{SyncOrchestrator, SyncReport};
