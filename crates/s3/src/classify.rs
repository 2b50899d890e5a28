//! Mapping of S3 SDK errors onto `stowage_core::Error`
//!
//! The transfer engine only retries `Error::Network`, so this is where
//! transient and permanent failures get told apart.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use stowage_core::Error;

/// Error codes S3-compatible stores use for quota and capacity limits
const QUOTA_CODES: &[&str] = &[
    "QuotaExceeded",
    "XMinioStorageFull",
    "StorageFull",
    "InsufficientStorage",
    "TooManyBuckets",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NoSuchUpload", "NotFound"];

const THROTTLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

/// Classify an SDK error; `context` names the object involved
pub fn classify<E>(err: &SdkError<E, HttpResponse>, context: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("{context}: {}", DisplayErrorContext(err));
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => Error::Network(message),
        SdkError::ResponseError(_) => Error::Network(message),
        SdkError::ConstructionFailure(_) => Error::General(message),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            classify_status(status, err.code(), message)
        }
    }
}

/// Classification by HTTP status and S3 error code
pub fn classify_status(status: Option<u16>, code: Option<&str>, message: String) -> Error {
    if let Some(code) = code {
        if NOT_FOUND_CODES.contains(&code) {
            return Error::NotFound(message);
        }
        if QUOTA_CODES.contains(&code) {
            return Error::QuotaExceeded(message);
        }
        if THROTTLE_CODES.contains(&code) {
            return Error::Network(message);
        }
        if matches!(code, "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") {
            return Error::Auth(message);
        }
    }

    match status {
        Some(401 | 403) => Error::Auth(message),
        Some(404) => Error::NotFound(message),
        Some(507) => Error::QuotaExceeded(message),
        Some(408 | 429) => Error::Network(message),
        Some(s) if s >= 500 => Error::Network(message),
        Some(409) => Error::Conflict(message),
        Some(_) => Error::General(message),
        // No response at all means the request never completed.
        None => Error::Network(message),
    }
}

/// Whether a ranged read failed only because the offset is past the end
pub fn is_range_not_satisfiable<E>(err: &SdkError<E, HttpResponse>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.code() == Some("InvalidRange")
        || err.raw_response().map(|r| r.status().as_u16()) == Some(416)
}
