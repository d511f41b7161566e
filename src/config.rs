//! Batch configuration.
//!
//! A batch file is JSON with a `requests` array and an optional `params`
//! object:
//!
//! ```json
//! {
//!   "requests": [
//!     { "dn": { "CN": "Test User" }, "container": { "exportable": true, "pin": "1234" } }
//!   ],
//!   "params": { "outputFolder": "certs", "skipRoot": true, "ca": { "url": "ca.example.com" } }
//! }
//! ```
//!
//! Values present in `params` win over command-line flags. The merged result is
//! an immutable [`Settings`] threaded through the whole run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{EnrollKitError, Result};
use crate::provider::resolver::HashSelection;
use crate::request::EnrollmentRequest;

/// Default CA host when neither the batch file nor the command line names one.
pub const DEFAULT_CA_URL: &str = "testgost2012.cryptopro.ru";

/// Default output folder.
pub const DEFAULT_OUTPUT_FOLDER: &str = "test_certs";

/// Default HTTP deadline per CA call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Parsed batch file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFile {
    pub requests: Vec<EnrollmentRequest>,
    #[serde(default)]
    pub params: BatchParams,
}

/// `params` section of a batch file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchParams {
    pub flat: Option<bool>,
    pub skip_root: Option<bool>,
    pub skip_store: Option<bool>,
    #[serde(rename = "skipCSRRequest")]
    pub skip_csr_request: Option<bool>,
    pub output_folder: Option<PathBuf>,
    #[serde(default)]
    pub ca: CaParams,
    pub timeout_secs: Option<u64>,
    pub key_storage_root: Option<PathBuf>,
    pub hash_selection: Option<HashSelection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaParams {
    pub url: Option<String>,
}

impl BatchFile {
    /// Reads and parses a batch file. Container names left empty are
    /// synthesized here, before any pipeline starts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            EnrollKitError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let mut batch: BatchFile = serde_json::from_str(data)?;
        batch.requests = batch
            .requests
            .into_iter()
            .map(EnrollmentRequest::normalized)
            .collect::<Result<_>>()?;
        Ok(batch)
    }
}

/// Fallback values, normally taken from command-line flags.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub flat: bool,
    pub skip_root: bool,
    pub skip_store: bool,
    pub skip_csr_request: bool,
    pub output_folder: PathBuf,
    pub ca_url: String,
    pub timeout_secs: u64,
    pub key_storage_root: Option<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            flat: false,
            skip_root: false,
            skip_store: false,
            skip_csr_request: false,
            output_folder: PathBuf::from(DEFAULT_OUTPUT_FOLDER),
            ca_url: DEFAULT_CA_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            key_storage_root: None,
        }
    }
}

/// Run-wide settings after merging the batch file over the defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Write artifacts straight into `output_folder` instead of one folder per container.
    pub flat: bool,
    pub skip_root: bool,
    /// Remove containers and certificates from the provider once exported.
    pub skip_store: bool,
    /// Stop after CSR generation and container extraction.
    pub skip_csr_request: bool,
    pub output_folder: PathBuf,
    pub ca_url: Url,
    pub timeout: Duration,
    pub key_storage_root: Option<PathBuf>,
    pub hash_selection: HashSelection,
}

impl Settings {
    pub fn merge(params: &BatchParams, defaults: &Defaults) -> Result<Self> {
        let output_folder = params
            .output_folder
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| defaults.output_folder.clone());
        let ca = params
            .ca
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| defaults.ca_url.clone());

        Ok(Self {
            flat: params.flat.unwrap_or(defaults.flat),
            skip_root: params.skip_root.unwrap_or(defaults.skip_root),
            skip_store: params.skip_store.unwrap_or(defaults.skip_store),
            skip_csr_request: params.skip_csr_request.unwrap_or(defaults.skip_csr_request),
            output_folder,
            ca_url: parse_ca_url(&ca)?,
            timeout: Duration::from_secs(params.timeout_secs.unwrap_or(defaults.timeout_secs)),
            key_storage_root: params
                .key_storage_root
                .clone()
                .or_else(|| defaults.key_storage_root.clone()),
            hash_selection: params.hash_selection.clone().unwrap_or_default(),
        })
    }

    /// Settings for talking to `ca_url` with everything else defaulted.
    pub fn for_ca(ca_url: &str, output_folder: impl Into<PathBuf>) -> Result<Self> {
        let defaults = Defaults {
            ca_url: ca_url.to_string(),
            output_folder: output_folder.into(),
            ..Defaults::default()
        };
        Self::merge(&BatchParams::default(), &defaults)
    }
}

/// Accepts either a bare host (`ca.example.com`, implying HTTPS) or a full base
/// URL such as `http://127.0.0.1:8080`.
pub fn parse_ca_url(value: &str) -> Result<Url> {
    let value = value.trim().trim_end_matches('/');
    let candidate = if value.contains("://") {
        value.to_string()
    } else {
        format!("https://{value}")
    };
    let mut url = Url::parse(&candidate)
        .map_err(|e| EnrollKitError::Config(format!("invalid CA url '{value}': {e}")))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(EnrollKitError::Config(format!("invalid CA url '{value}'")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
