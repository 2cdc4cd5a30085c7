use crate::rpc::JsonRpcError;
use crate::wc::ErrorResponse;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// Operation invoked before the owning module finished `init()`. Fatal to
    /// the call, never retried.
    NotInitialized(String),
    /// Lookup miss on a topic/id/tag. Carries the component name and the
    /// offending key.
    NoMatchingKey(String, String),
    /// Malformed input: bad URI, missing params, malformed namespace.
    MissingOrInvalid(String),
    /// The entity existed but its expiry has passed. Raising this deletes the
    /// entity as a side effect.
    Expired(String),
    /// Approved/updated namespaces fail the conformance check against the
    /// proposal's required namespaces.
    NonConformingNamespaces(String),
    /// Attempted to hydrate persisted state over already-populated in-memory
    /// state. Aborts initialization.
    RestoreWillOverride(String),
    UserDisconnected,
    UnsupportedAccounts(String),
    UnauthorizedMethod(String),
    UnauthorizedEvent(String),

    InvalidUri,
    SymKeyNotMentioned,
    RelayProtocolNotMentioned,
    PathEndNotFound,

    /// JSON-RPC error returned by the relay itself.
    RelayRpc(JsonRpcError),
    /// Protocol-level error response received from the peer.
    Peer(ErrorResponse),

    Internal(String),
    ParseInt(std::num::ParseIntError),
    SerdeJson(serde_json::Error),
    FromHex(hex::FromHexError),
    Aead(chacha20poly1305::aead::Error),
    Base64(base64ct::Error),
    FromUtf8(std::string::FromUtf8Error),
    SystemTime(std::time::SystemTimeError),
    Anyhow(anyhow::Error),
}

impl Error {
    /// Error code carried in the JSON-RPC error response sent to the peer
    /// when a request fails validation at the handler boundary.
    pub fn code(&self) -> i64 {
        match self {
            Error::UnauthorizedMethod(_) => 3001,
            Error::UnauthorizedEvent(_) => 3002,
            Error::UnsupportedAccounts(_) => 5103,
            Error::NonConformingNamespaces(_) => 5104,
            Error::UserDisconnected => 6000,
            Error::Expired(_) => 7001,
            _ => 1000,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Error::NotInitialized(module) => {
                format!("{module} module not initialized")
            }
            Error::NoMatchingKey(module, key) => {
                format!("No matching key in {module}: {key}")
            }
            Error::MissingOrInvalid(context) => {
                format!("Missing or invalid: {context}")
            }
            Error::Expired(target) => format!("Expired: {target}"),
            Error::NonConformingNamespaces(context) => {
                format!("Non conforming namespaces: {context}")
            }
            Error::RestoreWillOverride(module) => {
                format!("Restore will override in-memory state of {module}")
            }
            Error::UserDisconnected => "User disconnected.".to_string(),
            Error::UnsupportedAccounts(accounts) => {
                format!("Unsupported accounts: {accounts}")
            }
            Error::UnauthorizedMethod(method) => {
                format!("Unauthorized method: {method}")
            }
            Error::UnauthorizedEvent(event) => {
                format!("Unauthorized event: {event}")
            }
            other => format!("{other:?}"),
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.reason(),
            data: None,
        }
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Internal(e)
    }
}

impl From<JsonRpcError> for Error {
    fn from(e: JsonRpcError) -> Self {
        Error::RelayRpc(e)
    }
}

impl From<ErrorResponse> for Error {
    fn from(e: ErrorResponse) -> Self {
        Error::Peer(e)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::ParseInt(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerdeJson(e)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::FromHex(e)
    }
}

impl From<chacha20poly1305::aead::Error> for Error {
    fn from(e: chacha20poly1305::aead::Error) -> Self {
        Error::Aead(e)
    }
}

impl From<base64ct::Error> for Error {
    fn from(e: base64ct::Error) -> Self {
        Error::Base64(e)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Error::FromUtf8(e)
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(e: std::time::SystemTimeError) -> Self {
        Error::SystemTime(e)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Anyhow(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for Error {}
