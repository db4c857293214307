use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use thiserror::Error;
use tonic::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all driver operations.
///
/// Each variant carries the resource it refers to where one exists, so the
/// gRPC layer can surface precise failures and the cloud layer can decide
/// retryability without string matching.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("'{resource}' already exists: {message}")]
    AlreadyExists { resource: String, message: String },

    #[error("'{resource}' not found: {message}")]
    NotFound { resource: String, message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    #[error("operation already in flight for '{resource}'")]
    OperationPending { resource: String },

    #[error("deadline exceeded: {message}")]
    DeadlineExceeded { message: String },

    #[error("failed API (message: {message:?}, retryable: {retryable:?})")]
    API { message: String, retryable: bool },

    #[error("failed for other reasons (message: {message:?}, retryable: {retryable:?})")]
    Other { message: String, retryable: bool },
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Returns if the error is retryable at the cloud layer.
    #[inline]
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Error::API { retryable, .. } | Error::Other { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Error::AlreadyExists {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Other {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Maps driver errors onto the gRPC status taxonomy.
impl From<Error> for Status {
    fn from(e: Error) -> Self {
        let msg = e.message();
        match e {
            Error::InvalidArgument { .. } => Status::invalid_argument(msg),
            Error::AlreadyExists { .. } => Status::already_exists(msg),
            Error::NotFound { .. } => Status::not_found(msg),
            Error::ResourceExhausted { .. } => Status::resource_exhausted(msg),
            Error::FailedPrecondition { .. } => Status::failed_precondition(msg),
            Error::OperationPending { .. } => Status::aborted(msg),
            Error::DeadlineExceeded { .. } => Status::deadline_exceeded(msg),
            Error::API { .. } | Error::Other { .. } => Status::internal(msg),
        }
    }
}

/// Returns true when the SDK error failed in transport, before any service
/// verdict, and is safe to repeat.
#[inline]
pub fn is_sdk_err_retryable<E, R>(e: &SdkError<E, R>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::DispatchFailure(ctx) => ctx
            .as_connector_error()
            .map(|c| c.is_timeout() || c.is_io())
            .unwrap_or(false),
        _ => false,
    }
}

/// Extracts the EC2 error code (e.g. "RequestLimitExceeded") when the SDK
/// error carries a service response.
#[inline]
pub fn sdk_err_code<E, R>(e: &SdkError<E, R>) -> Option<String>
where
    E: ProvideErrorMetadata,
{
    match e {
        SdkError::ServiceError(ctx) => ctx.err().code().map(|c| c.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let st: Status = Error::invalid_argument("bad fsType").into();
        assert_eq!(st.code(), tonic::Code::InvalidArgument);

        let st: Status = Error::not_found("vol-0123", "no such volume").into();
        assert_eq!(st.code(), tonic::Code::NotFound);

        let st: Status = Error::OperationPending {
            resource: "vol-0123".to_string(),
        }
        .into();
        assert_eq!(st.code(), tonic::Code::Aborted);

        let st: Status = Error::API {
            message: "throttled".to_string(),
            retryable: true,
        }
        .into();
        assert_eq!(st.code(), tonic::Code::Internal);
    }

    #[test]
    fn retryable_accessor() {
        assert!(Error::API {
            message: String::new(),
            retryable: true
        }
        .retryable());
        assert!(!Error::invalid_argument("x").retryable());
    }
}
