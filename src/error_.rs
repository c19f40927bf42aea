// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io;

use thiserror::Error as ThisError;

use crate::value::Value;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors that can occur while using the connection provider.
///
/// **Important Notes on Usage:**
///  * Error messages are *not* considered part of the API.
///    They may change at any time and don't follow semantic versioning.
///  * The only string in errors that can be (somewhat<sup>1</sup>) reliably
///    used is [`ServerError::code()`].
///
/// <sup>1</sup>The code is received from the server and therefore might still
/// change depending on the server version.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Used when experiencing a connectivity error.
    /// E.g., not able to connect, a broken socket, not able to fetch routing
    /// information.
    #[error("service unavailable: {message}{}",
            source.as_ref().map(|err| format!(" caused by: {err}")).unwrap_or_default())]
    #[non_exhaustive]
    ServiceUnavailable {
        message: String,
        source: Option<io::Error>,
    },

    /// Used when a server that used to be an eligible routing target no
    /// longer is (connection lost to a cluster member, write attempted
    /// against a server that stopped accepting writes, no routing target
    /// left for the requested access mode).
    ///
    /// Retrying the work will make the driver fetch a fresh routing table and
    /// usually succeed.
    #[error("session expired: {message}{}",
            source.as_ref().map(|err| format!(" caused by: {err}")).unwrap_or_default())]
    #[non_exhaustive]
    SessionExpired {
        message: String,
        source: Option<io::Error>,
    },

    /// Used when the provider encounters an error caused by user input.
    /// For example, a custom address resolver returning no addresses or
    /// contradictory configuration.
    #[error("invalid configuration: {message}")]
    #[non_exhaustive]
    InvalidConfig { message: String },

    /// Used when the server returns an error.
    #[error("{error}")]
    #[non_exhaustive]
    Server { error: Box<ServerError> },

    /// Used when connection acquisition timed out.
    #[error("{message}")]
    #[non_exhaustive]
    Timeout { message: String },

    /// Used when a user-provided callback failed.
    ///
    /// See [`UserCallbackError`] for more information.
    #[error("{error}")]
    #[non_exhaustive]
    UserCallback { error: UserCallbackError },

    /// Used when an operation requires a capability the negotiated protocol
    /// version or the server does not offer (e.g., switching users on a
    /// connection that cannot re-authenticate).
    #[error("unsupported operation: {message}")]
    #[non_exhaustive]
    Unsupported { message: String },

    /// If you encounter this error, there's either a bug in the driver or the
    /// server. An unexpected message or message content was received from the
    /// server.
    #[error(
        "the driver encountered a protocol violation, \
        this is likely a bug in the driver or the server: {message}"
    )]
    #[non_exhaustive]
    Protocol { message: String },
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Server { error } => error.is_retryable(),
            Error::ServiceUnavailable { .. } | Error::SessionExpired { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn session_expired<S: Into<String>>(message: S) -> Self {
        Self::SessionExpired {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn protocol_error<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub(crate) fn connection_acquisition_timeout<S: AsRef<str>>(during: S) -> Self {
        Self::Timeout {
            message: format!("connection acquisition timed out while {}", during.as_ref()),
        }
    }

    pub(crate) fn pool_closed() -> Self {
        Self::service_unavailable("the connection pool was closed")
    }

    /// Rewrite a connectivity error into the session-expired flavor, keeping
    /// the io cause. Used by the routing provider where losing a server only
    /// invalidates the current routing view.
    pub(crate) fn into_session_expired(self) -> Self {
        match self {
            Error::ServiceUnavailable { message, source } => {
                Error::SessionExpired { message, source }
            }
            _ => self,
        }
    }

    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self {
            Error::Server { error } => error.fatal_during_discovery(),
            Error::InvalidConfig { .. } => true,
            Error::UserCallback { .. } => true,
            Error::Unsupported { .. } => true,
            _ => false,
        }
    }
}

const UNKNOWN_SERVER_CODE: &str = "Neo.DatabaseError.General.UnknownError";
const UNKNOWN_SERVER_MESSAGE: &str = "An unknown error occurred.";

/// An error returned by the server as a FAILURE response.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerError {
    pub code: String,
    pub message: String,
    retryable_overwrite: bool,
}

impl ServerError {
    pub fn new(code: String, message: String) -> Self {
        Self {
            code,
            message,
            retryable_overwrite: false,
        }
    }

    pub(crate) fn from_meta(mut meta: HashMap<String, Value>) -> Self {
        let code = match meta.remove("code") {
            Some(Value::String(code)) => code,
            _ => UNKNOWN_SERVER_CODE.into(),
        };
        let message = match meta.remove("message") {
            Some(Value::String(message)) => message,
            _ => UNKNOWN_SERVER_MESSAGE.into(),
        };
        Self::new(code, message)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn classification(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or("")
    }

    pub fn category(&self) -> &str {
        self.code.split('.').nth(2).unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.code.split('.').nth(3).unwrap_or("")
    }

    pub(crate) fn is_retryable(&self) -> bool {
        self.retryable_overwrite
            || match self.code() {
                "Neo.ClientError.Security.AuthorizationExpired"
                | "Neo.ClientError.Cluster.NotALeader"
                | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase" => true,
                _ => self.classification() == "TransientError",
            }
    }

    /// Errors that abort a routing-table refresh instead of letting the
    /// provider try the next router.
    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self.code() {
            "Neo.ClientError.Database.DatabaseNotFound"
            | "Neo.ClientError.Transaction.InvalidBookmark"
            | "Neo.ClientError.Transaction.InvalidBookmarkMixture"
            | "Neo.ClientError.Statement.TypeError"
            | "Neo.ClientError.Statement.ArgumentError"
            | "Neo.ClientError.Request.Invalid" => true,
            code => {
                code.starts_with("Neo.ClientError.Security.")
                    && code != "Neo.ClientError.Security.AuthorizationExpired"
            }
        }
    }

    pub(crate) fn deactivates_server(&self) -> bool {
        self.code.as_str() == "Neo.TransientError.General.DatabaseUnavailable"
    }

    pub(crate) fn invalidates_writer(&self) -> bool {
        matches!(
            self.code(),
            "Neo.ClientError.Cluster.NotALeader"
                | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
        )
    }

    pub(crate) fn is_security_error(&self) -> bool {
        self.code.starts_with("Neo.ClientError.Security.")
    }

    pub(crate) fn unauthenticates_all_connections(&self) -> bool {
        self.code == "Neo.ClientError.Security.AuthorizationExpired"
    }

    /// The routing procedure is missing, i.e., the server is not part of a
    /// cluster.
    pub(crate) fn means_routing_unsupported(&self) -> bool {
        self.code == "Neo.ClientError.Procedure.ProcedureNotFound"
    }

    /// Errors that make `verify_authentication` report `false` instead of
    /// failing.
    pub(crate) fn indicates_invalid_auth(&self) -> bool {
        matches!(
            self.code(),
            "Neo.ClientError.Security.Unauthorized"
                | "Neo.ClientError.Security.TokenExpired"
                | "Neo.ClientError.Security.CredentialsExpired"
        )
    }

    pub(crate) fn overwrite_retryable(&mut self) {
        self.retryable_overwrite = true;
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error: {} (code: {})", self.message, self.code)
    }
}

impl From<ServerError> for Error {
    fn from(error: ServerError) -> Self {
        Error::Server {
            error: Box::new(error),
        }
    }
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum UserCallbackError {
    /// The configured [`AddressResolver`](crate::address::AddressResolver)
    /// returned an error.
    #[error("resolver callback failed: {0}")]
    Resolver(BoxError),
    /// The configured [`AuthManager`](crate::auth::AuthManager) returned an
    /// error.
    #[error("AuthManager failed: {0}")]
    AuthManager(BoxError),
}

impl UserCallbackError {
    pub fn user_error(&self) -> &dyn StdError {
        match self {
            UserCallbackError::Resolver(err) | UserCallbackError::AuthManager(err) => err.as_ref(),
        }
    }

    pub fn into_user_error(self) -> BoxError {
        match self {
            UserCallbackError::Resolver(err) | UserCallbackError::AuthManager(err) => err,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
