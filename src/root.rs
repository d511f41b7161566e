//! Trust bootstrap for the CA's root certificate.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::cert::thumbprint_from_base64;
use crate::config::Settings;
use crate::enrollment::EnrollmentClient;
use crate::error::Result;
use crate::provider::{CertStore, CryptoProvider};

/// File the root certificate is saved to, inside the output folder.
pub const ROOT_CERTIFICATE_FILE: &str = "cryptopro_ca.cer";

/// Downloads the root certificate, saves it and, unless `skip_store` is set,
/// adds it to the trusted roots when absent.
///
/// Does nothing when `skip_root` is set. Failures are logged and never stop
/// the batch.
pub async fn bootstrap(
    client: &EnrollmentClient,
    provider: &dyn CryptoProvider,
    settings: &Settings,
) {
    if settings.skip_root {
        return;
    }
    if let Err(e) = try_bootstrap(client, provider, settings).await {
        error!("root certificate bootstrap failed: {e}");
    }
}

async fn try_bootstrap(
    client: &EnrollmentClient,
    provider: &dyn CryptoProvider,
    settings: &Settings,
) -> Result<()> {
    let body = client.fetch_root().await?;
    let path = save(&settings.output_folder, &body)?;
    info!("root certificate saved to {}", path.display());

    if settings.skip_store {
        return Ok(());
    }

    let thumbprint = thumbprint_from_base64(&body)?;
    if provider.certificate_exists(&thumbprint, CertStore::Root)? {
        debug!(thumbprint, "root certificate already trusted");
        return Ok(());
    }
    provider.add_certificate(CertStore::Root, &body)?;
    info!(thumbprint, "root certificate installed");
    Ok(())
}

fn save(output_folder: &Path, body: &str) -> Result<PathBuf> {
    fs::create_dir_all(output_folder)?;
    let path = output_folder.join(ROOT_CERTIFICATE_FILE);
    fs::write(&path, body)?;
    Ok(path)
}
