use crate::ResourceId;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification callers can match on without reading messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Discovery,
    List,
    Watch,
    Cancelled,
    Invalid,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("discover resources: {0:#}")]
    Discovery(#[source] anyhow::Error),
    #[error("list {resource}: {source:#}")]
    List {
        resource: ResourceId,
        #[source]
        source: anyhow::Error,
    },
    #[error("watch {resource}: {source:#}")]
    Watch {
        resource: ResourceId,
        #[source]
        source: anyhow::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid resource key: {0} (expect version/resource or group/version/resource)")]
    InvalidResource(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn discovery(source: impl Into<anyhow::Error>) -> Self { Self::Discovery(source.into()) }

    pub fn list(resource: &ResourceId, source: impl Into<anyhow::Error>) -> Self {
        Self::List { resource: resource.clone(), source: source.into() }
    }

    pub fn watch(resource: &ResourceId, source: impl Into<anyhow::Error>) -> Self {
        Self::Watch { resource: resource.clone(), source: source.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Discovery(_) => ErrorKind::Discovery,
            Self::List { .. } => ErrorKind::List,
            Self::Watch { .. } => ErrorKind::Watch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidResource(_) => ErrorKind::Invalid,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Resource the failure concerns, when there is one.
    pub fn resource(&self) -> Option<&ResourceId> {
        match self {
            Self::List { resource, .. } | Self::Watch { resource, .. } => Some(resource),
            _ => None,
        }
    }
}
