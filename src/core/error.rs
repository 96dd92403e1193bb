use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Validation results surfaced directly to the caller
    NoSuchObject,
    EntryAlreadyExists,
    NotAllowedOnNonLeaf,
    NamingViolation,
    Referral,
    InvalidArgument,
    // Search and control handling
    AdminLimitExceeded,
    InsufficientAccessRights,
    UnavailableCriticalExtension,
    ConstraintViolation,
    VirtualListViewError,
    UnwillingToPerform,
    // Operation was canceled at a safe point
    Canceled,
    // Storage and runtime failures
    Io,
    Parse,
    Storage,
    OutOfMemory,
    InvalidState,
    Internal,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn no_such_object(dn: impl fmt::Display) -> Self {
        Error::new(ErrorKind::NoSuchObject, format!("entry {} does not exist", dn))
    }

    pub fn already_exists(dn: impl fmt::Display) -> Self {
        Error::new(ErrorKind::EntryAlreadyExists, format!("entry {} already exists", dn))
    }

    /// Referral error; the context carries the referral URLs separated by spaces
    pub fn referral(urls: &[String]) -> Self {
        Error::new(ErrorKind::Referral, urls.join(" "))
    }

    pub fn canceled() -> Self {
        Error::new(ErrorKind::Canceled, "operation canceled".to_string())
    }

    pub fn storage(context: String) -> Self {
        Error::new(ErrorKind::Storage, context)
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// True for errors that describe the request rather than the backend state
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NoSuchObject
                | ErrorKind::EntryAlreadyExists
                | ErrorKind::NotAllowedOnNonLeaf
                | ErrorKind::NamingViolation
                | ErrorKind::Referral
                | ErrorKind::InvalidArgument
        )
    }

    /// URLs carried by a referral error
    pub fn referral_urls(&self) -> Vec<String> {
        if self.kind != ErrorKind::Referral {
            return Vec::new();
        }
        self.context.split_whitespace().map(String::from).collect()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: format!("JSON error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
