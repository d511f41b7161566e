//! Per-request enrollment workflow and batch aggregation.
//!
//! Each request runs resolve → CSR → submit → install → materialize on its own.
//! A failing stage ends that request with an error log; the batch continues
//! and the request contributes no entry to `info.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::cert::thumbprint_from_base64;
use crate::config::{BatchFile, Settings};
use crate::csr::{CsrBuilder, CsrDocument};
use crate::enrollment::EnrollmentClient;
use crate::error::Result;
use crate::installer;
use crate::provider::resolver;
use crate::provider::{CertStore, CryptoProvider, KeyContainer};
use crate::request::{EnrollmentRequest, validate_container_name};
use crate::root;
use crate::storage::{KeyStorage, Materializer};

/// Summary file written to the output folder after a batch.
pub const INFO_FILE: &str = "info.json";

/// Result of one successful request, as recorded in `info.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    /// External container name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    /// Provider-reported container name; absent when the container was removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_pin: Option<String>,
    /// Extracted container folder, relative to the request's output folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_folder: Option<String>,
    pub exportable: bool,
}

/// Writes `outcomes` as a tab-indented JSON array to `<output_folder>/info.json`.
pub fn write_info(output_folder: &Path, outcomes: &[RequestOutcome]) -> Result<PathBuf> {
    let mut data = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut data, formatter);
    outcomes.serialize(&mut serializer)?;

    fs::create_dir_all(output_folder)?;
    let path = output_folder.join(INFO_FILE);
    fs::write(&path, data)?;
    Ok(path)
}

/// Drives requests through the provider and the CA.
pub struct Pipeline<'a> {
    provider: &'a dyn CryptoProvider,
    client: &'a EnrollmentClient,
    storage: &'a KeyStorage,
    settings: &'a Settings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        provider: &'a dyn CryptoProvider,
        client: &'a EnrollmentClient,
        storage: &'a KeyStorage,
        settings: &'a Settings,
    ) -> Self {
        Self {
            provider,
            client,
            storage,
            settings,
        }
    }

    /// Processes `requests` in order and writes `info.json`.
    ///
    /// # Returns
    /// Outcomes of the requests that succeeded, in input order.
    pub async fn run_batch(&self, requests: &[EnrollmentRequest]) -> Result<Vec<RequestOutcome>> {
        fs::create_dir_all(&self.settings.output_folder)?;

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            if let Some(outcome) = self.process(request).await {
                outcomes.push(outcome);
            }
        }

        let path = write_info(&self.settings.output_folder, &outcomes)?;
        info!(
            succeeded = outcomes.len(),
            total = requests.len(),
            "batch finished, summary written to {}",
            path.display()
        );
        Ok(outcomes)
    }

    /// Runs one request to completion. Failures are logged and yield `None`.
    pub async fn process(&self, request: &EnrollmentRequest) -> Option<RequestOutcome> {
        let name = request.container_name();
        if let Err(e) = validate_container_name(name) {
            error!(container = name, "{e}");
            return None;
        }

        let csr = match self.build_csr(request) {
            Ok(csr) => csr,
            Err(e) => {
                error!(container = name, "cannot generate certificate request: {e}");
                return None;
            }
        };

        match self.enroll(request, &csr).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(container = name, "enrollment failed: {e}");
                if self.settings.skip_store {
                    self.discard_container(&csr.container);
                }
                None
            }
        }
    }

    fn build_csr(&self, request: &EnrollmentRequest) -> Result<CsrDocument> {
        let resolved = resolver::resolve(
            self.provider,
            request.provider_name.as_deref(),
            &self.settings.hash_selection,
        )?;
        CsrBuilder::new(self.provider).build(request, &resolved)
    }

    fn request_folder(&self, name: &str) -> Result<PathBuf> {
        let folder = if self.settings.flat {
            self.settings.output_folder.clone()
        } else {
            self.settings.output_folder.join(name)
        };
        fs::create_dir_all(&folder)?;
        Ok(folder)
    }

    async fn enroll(
        &self,
        request: &EnrollmentRequest,
        csr: &CsrDocument,
    ) -> Result<RequestOutcome> {
        let name = request.container_name();
        let folder = self.request_folder(name)?;
        fs::write(folder.join(format!("{name}.csr")), &csr.base64)?;

        let materializer = Materializer::new(self.provider, self.storage);

        if self.settings.skip_csr_request {
            let container_folder = match materializer.extract(name, &folder) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(container = name, "cannot copy container: {e}");
                    None
                }
            };
            let outcome = self.outcome(request, &csr.container, None, container_folder.as_deref());
            if self.settings.skip_store {
                self.discard_container(&csr.container);
            }
            info!(container = name, "container created");
            return Ok(outcome);
        }

        let certificate = self.client.submit(&csr.base64).await?;
        fs::write(folder.join(format!("{name}.cer")), &certificate)?;

        installer::install(self.provider, &certificate)?;

        let container_folder = match materializer.extract(name, &folder) {
            Ok(path) => Some(path),
            Err(e) => {
                error!(container = name, "cannot copy container: {e}");
                None
            }
        };
        if request.container.exportable {
            if let Err(e) = materializer.export_pfx(request, &folder) {
                error!(container = name, "cannot export PKCS#12: {e}");
            }
        }

        let thumbprint = match thumbprint_from_base64(&certificate) {
            Ok(thumbprint) => Some(thumbprint),
            Err(e) => {
                error!(container = name, "cannot compute thumbprint: {e}");
                None
            }
        };

        let outcome = self.outcome(
            request,
            &csr.container,
            thumbprint.clone(),
            container_folder.as_deref(),
        );

        if self.settings.skip_store {
            if let Some(thumbprint) = &thumbprint {
                if let Err(e) = self.provider.delete_certificate(thumbprint, CertStore::My) {
                    debug!(container = name, "cannot delete certificate: {e}");
                }
            }
            self.discard_container(&csr.container);
        }

        info!(container = name, "container and certificate installed");
        Ok(outcome)
    }

    fn outcome(
        &self,
        request: &EnrollmentRequest,
        container: &KeyContainer,
        thumbprint: Option<String>,
        container_folder: Option<&Path>,
    ) -> RequestOutcome {
        RequestOutcome {
            name: request.container_name().to_string(),
            thumbprint,
            container_name: (!self.settings.skip_store).then(|| container.reported_name.clone()),
            container_pin: request.container.pin.clone().filter(|pin| !pin.is_empty()),
            container_folder: container_folder
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned()),
            exportable: request.container.exportable,
        }
    }

    /// Best-effort removal; failures are only worth a debug line.
    fn discard_container(&self, container: &KeyContainer) {
        if let Err(e) = self.provider.delete_container(container) {
            debug!(container = %container.name, "cannot delete container: {e}");
        }
    }
}

/// Runs a whole batch: root bootstrap, every request, then `info.json`.
pub async fn run(
    batch: &BatchFile,
    settings: &Settings,
    provider: &dyn CryptoProvider,
    storage: &KeyStorage,
) -> Result<Vec<RequestOutcome>> {
    fs::create_dir_all(&settings.output_folder)?;
    let client = EnrollmentClient::new(settings.ca_url.clone(), settings.timeout)?;

    root::bootstrap(&client, provider, settings).await;

    Pipeline::new(provider, &client, storage, settings)
        .run_batch(&batch.requests)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let outcome = RequestOutcome {
            name: "TEST_1".into(),
            exportable: false,
            ..RequestOutcome::default()
        };
        assert_eq!(
            serde_json::to_string(&outcome).unwrap(),
            r#"{"name":"TEST_1","exportable":false}"#
        );
    }

    #[test]
    fn keys_are_camel_case() {
        let outcome = RequestOutcome {
            name: "TEST_1".into(),
            thumbprint: Some("ab".into()),
            container_name: Some(r"\\.\HDIMAGE\TEST_1".into()),
            container_pin: Some("1234".into()),
            container_folder: Some("abcdefgh.000".into()),
            exportable: true,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        for key in [
            "name",
            "thumbprint",
            "containerName",
            "containerPin",
            "containerFolder",
            "exportable",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn info_file_is_a_tab_indented_array() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = vec![RequestOutcome {
            name: "TEST_1".into(),
            ..RequestOutcome::default()
        }];
        let path = write_info(dir.path(), &outcomes).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n\t{"));
        let parsed: Vec<RequestOutcome> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, outcomes);
    }

    #[test]
    fn empty_batch_writes_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_info(dir.path(), &[]).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "[]");
    }
}
