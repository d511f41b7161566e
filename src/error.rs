//! Error types shared by every enrollment stage.

use thiserror::Error;

/// Result type alias using [`EnrollKitError`].
pub type Result<T> = std::result::Result<T, EnrollKitError>;

/// Represents errors that can occur while enrolling certificates.
///
/// Every stage of the per-request pipeline reports through this enum. The batch
/// runner catches these at the request boundary, so none of them abort a batch.
#[derive(Debug, Error)]
pub enum EnrollKitError {
    /// The provider-name hint does not resolve to an installed provider
    /// supporting key-exchange keys.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// No algorithm of the provider qualifies as a hash algorithm.
    #[error("Hash algorithm not found for provider: {0}")]
    HashAlgorithmUnavailable(String),

    /// A provider-binding call failed while building the CSR.
    #[error("Failed to build CSR for container {container}: {source}")]
    CsrBuildFailed {
        container: String,
        #[source]
        source: Box<EnrollKitError>,
    },

    /// The CA response did not carry a `ReqID=<digits>&` fragment.
    #[error("Request identifier not found in CA response")]
    RequestIdNotFound,

    /// Network-level failure talking to the CA.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The CA answered with a non-success HTTP status.
    #[error("CA responded with status {status}")]
    CaStatus { status: u16 },

    /// The CA returned an empty certificate body.
    #[error("CA returned an empty certificate")]
    EmptyCertificate,

    /// The issued certificate could not be bound to its private key.
    #[error("Failed to install certificate: {0}")]
    InstallFailed(String),

    /// The key container is not present where the provider says it lives.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// The container's physical layout could not be determined.
    #[error("Unsupported container layout: {0}")]
    ContainerLayoutUnsupported(String),

    /// Error reported by the cryptographic-provider binding.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Error during data encoding.
    #[error("Failed to encode data: {0}")]
    EncodingError(String),

    /// Error during data decoding.
    #[error("Failed to decode data: {0}")]
    DecodingError(String),

    /// Error due to invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or unreadable batch configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnrollKitError {
    /// Wraps a provider failure raised while building the CSR of `container`.
    pub fn csr_build(container: impl Into<String>, source: EnrollKitError) -> Self {
        Self::CsrBuildFailed {
            container: container.into(),
            source: Box::new(source),
        }
    }

    /// Create a provider error with the given message.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Returns `true` for I/O errors of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ContainerNotFound(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<der::Error> for EnrollKitError {
    /// Converts a `der::Error` into an `EnrollKitError`.
    fn from(err: der::Error) -> Self {
        EnrollKitError::DecodingError(err.to_string())
    }
}

impl From<base64::DecodeError> for EnrollKitError {
    fn from(err: base64::DecodeError) -> Self {
        EnrollKitError::DecodingError(err.to_string())
    }
}

impl From<rsa::Error> for EnrollKitError {
    fn from(err: rsa::Error) -> Self {
        EnrollKitError::Provider(err.to_string())
    }
}

impl From<pkcs8::Error> for EnrollKitError {
    fn from(err: pkcs8::Error) -> Self {
        EnrollKitError::EncodingError(err.to_string())
    }
}

impl From<pkcs8::spki::Error> for EnrollKitError {
    fn from(err: pkcs8::spki::Error) -> Self {
        EnrollKitError::EncodingError(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for EnrollKitError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        EnrollKitError::Provider(err.to_string())
    }
}

impl From<reqwest::Error> for EnrollKitError {
    fn from(err: reqwest::Error) -> Self {
        EnrollKitError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for EnrollKitError {
    fn from(err: serde_json::Error) -> Self {
        EnrollKitError::Config(err.to_string())
    }
}

impl From<walkdir::Error> for EnrollKitError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => EnrollKitError::Io(io),
            None => EnrollKitError::Io(std::io::Error::other("filesystem loop detected")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_build_keeps_container_and_source() {
        let err = EnrollKitError::csr_build("TEST_1", EnrollKitError::provider("no slot"));
        assert_eq!(
            err.to_string(),
            "Failed to build CSR for container TEST_1: Provider error: no slot"
        );
    }

    #[test]
    fn not_found_detection() {
        let io = EnrollKitError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_not_found());
        assert!(EnrollKitError::ContainerNotFound("x".into()).is_not_found());
        assert!(!EnrollKitError::RequestIdNotFound.is_not_found());
    }
}
