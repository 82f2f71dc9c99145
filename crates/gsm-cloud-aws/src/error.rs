//! Mapping of EC2 SDK errors onto provider errors

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use gsm_cloud::ProviderError;

/// Error codes EC2 documents as retryable
const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Unavailable",
    "InsufficientInstanceCapacity",
];

/// Convert an SDK error for an operation on `resource` `id`
pub(crate) fn map_sdk_error<E, R>(
    resource: &'static str,
    id: &str,
    err: SdkError<E, R>,
) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ProviderError::Transient(DisplayErrorContext(&err).to_string())
        }
        _ => classify(
            err.code(),
            err.message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
            resource,
            id,
        ),
    }
}

pub(crate) fn classify(
    code: Option<&str>,
    message: String,
    resource: &'static str,
    id: &str,
) -> ProviderError {
    match code {
        Some(code) if TRANSIENT_CODES.contains(&code) => {
            ProviderError::Transient(format!("{}: {}", code, message))
        }
        Some(code) if code.ends_with(".NotFound") => ProviderError::not_found(resource, id),
        Some(code) => ProviderError::api(code, message),
        None => ProviderError::api("Unknown", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(classify(Some("RequestLimitExceeded"), "slow down".into(), "instance", "i-1")
            .is_transient());
        assert!(
            classify(Some("InvalidInstanceID.NotFound"), "gone".into(), "instance", "i-1")
                .is_not_found()
        );
        assert!(classify(
            Some("InvalidAllocationID.NotFound"),
            "gone".into(),
            "address",
            "eipalloc-1"
        )
        .is_not_found());

        match classify(Some("DependencyViolation"), "in use".into(), "security group", "sg-1") {
            ProviderError::Api { code, .. } => assert_eq!(code, "DependencyViolation"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
