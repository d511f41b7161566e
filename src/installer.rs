//! Binds an issued certificate to the private key that requested it.

use tracing::debug;

use crate::cert::strip_pem_framing;
use crate::error::{EnrollKitError, Result};
use crate::provider::{CryptoProvider, InstallPolicy};

/// Installs the CA response into the user's enrollment context.
///
/// PEM header and footer lines are removed first. On failure the container is
/// left in place; the caller decides whether to delete it.
pub fn install(provider: &dyn CryptoProvider, response: &str) -> Result<()> {
    let body = strip_pem_framing(response);
    provider
        .install_response(&body, &InstallPolicy::default())
        .map_err(|e| match e {
            EnrollKitError::InstallFailed(_) => e,
            other => EnrollKitError::InstallFailed(other.to_string()),
        })?;
    debug!("certificate installed");
    Ok(())
}
