use thiserror::Error;

/// Failures of the mDNS browsing layer.
///
/// Resolution problems for a single service are not errors at this level:
/// the entry is dropped from the server list and browsing goes on.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),
    #[error("Invalid service type '{0}'")]
    InvalidServiceType(String),
    #[error("Cannot spawn discovery thread: {0}")]
    Thread(String),
}

/// Failures while fetching the album or media catalogue.
///
/// A catalogue fetch is all-or-nothing: any of these means no list was
/// produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogueError {
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Server answered HTTP {0}")]
    Status(u16),
    #[error("Malformed catalogue response: {0}")]
    Decode(String),
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
    #[error("Catalogue fetch cancelled")]
    Cancelled,
}

impl CatalogueError {
    pub(crate) fn network(err: reqwest::Error) -> Self {
        CatalogueError::Network(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        CatalogueError::Decode(err.to_string())
    }

    /// Network and server-side failures can be retried by the user.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogueError::Network(_) | CatalogueError::Status(_))
    }
}

/// Terminal failures of a single asset fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("timed out waiting for server-side generation ({attempts} attempts)")]
    GenerationTimeout { attempts: u32 },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("Undecodable asset: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Invalid asset request: {0}")]
    InvalidAddress(String),
    #[error("Asset fetch cancelled")]
    Cancelled,
}

impl From<std::io::Error> for AssetError {
    fn from(err: std::io::Error) -> Self {
        AssetError::Io(err.to_string())
    }
}

/// Failures reported by the collaborators (local store, player, picker).
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("Invalid name '{0}'")]
    InvalidName(String),
    #[error("Operation '{0}' is not supported")]
    Unsupported(String),
    #[error("Player error: {0}")]
    Player(String),
}

impl CollaboratorError {
    pub fn unsupported(operation: &str) -> Self {
        CollaboratorError::Unsupported(operation.to_string())
    }
}
