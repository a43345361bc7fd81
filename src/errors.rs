use crate::object::{ObjectId, ObjectKind};

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the core.
///
/// Local retries are confined to alternate routes (alternate object
/// directories, other packs); corruption is fatal to the current
/// operation and taints the offending pack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed object id: {0}")]
    MalformedId(String),

    #[error("corrupt: {0}")]
    Corruption(String),

    #[error("missing object {0}")]
    MissingObject(ObjectId),

    #[error("object {id} is a {got:?}, not a {want:?}")]
    IncorrectObjectType {
        id: ObjectId,
        want: ObjectKind,
        got: ObjectKind,
    },

    #[error("cannot lock {0}")]
    LockFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An object could be obtained through several routes and all of
    /// them failed.
    #[error("all routes failed ({} causes)", .0.len())]
    CompoundFailure(Vec<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// True when the underlying cause is an absent file rather than a
    /// real I/O failure, so callers can fall through to another route.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::MissingObject(_) => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
