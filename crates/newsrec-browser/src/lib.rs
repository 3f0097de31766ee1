//! Remote browser sessions: vendor API client, identity rotation, the
//! session broker and the page abstraction the scraper drives.

mod broker;
mod page;
mod rotation;
mod vendor;

use thiserror::Error;

pub use broker::{
    build_attempt_matrix, edition_countries, AcquireContext, BrokerConfig, BrowserLease,
    SessionBroker, SessionIdentity, DEFAULT_MAX_MATRIX_ATTEMPTS,
};
pub use page::{BrowserPage, CdpPage, CdpSession};
pub use rotation::{
    select_index, FileRotationStore, InMemoryRotationStore, RotationMode, RotationState,
    RotationStore,
};
pub use vendor::{
    CreateSessionRequest, ListedSession, SessionPage, SessionProvider, VendorClient, VendorSession,
};

pub const CRATE_NAME: &str = "newsrec-browser";

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("network error: {0}")]
    Network(String),

    #[error("vendor API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("connecting to browser endpoint failed: {0}")]
    Connect(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("navigation to {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("page script failed: {0}")]
    Script(String),

    #[error("all {attempts} session configurations failed; last error: {last}")]
    Exhausted { attempts: usize, last: String },

    #[error("rotation state: {0}")]
    RotationState(String),
}

impl BrowserError {
    /// 401/403 from the vendor means bad credentials; retrying other identities is pointless.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Api { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for BrowserError {
    fn from(err: reqwest::Error) -> Self {
        BrowserError::Network(err.to_string())
    }
}
