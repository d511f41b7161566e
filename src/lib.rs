//! # EnrollKit - Batch X.509 Enrollment Against a CA Web Enrollment Endpoint
//!
//! EnrollKit issues certificates in bulk. For every requested identity it
//! generates a key pair inside a cryptographic provider, builds a PKCS#10
//! request, submits it to the CA's `/certsrv` pages, installs the issued
//! certificate next to its private key and copies the key container out to
//! disk, optionally as a PKCS#12 file.
//!
//! ## Workflow
//!
//! Each request goes through the same stages:
//!
//! - **Resolve**: pick the provider and its hash algorithm ([`provider::resolver`])
//! - **Build**: provision the container and sign the request ([`csr`])
//! - **Submit**: POST the request and download the certificate ([`enrollment`])
//! - **Install**: bind the certificate to the key ([`installer`])
//! - **Materialize**: copy the container and export PKCS#12 ([`storage`])
//! - **Aggregate**: record the outcome in `info.json` ([`pipeline`])
//!
//! A failing stage ends its own request only; the batch continues.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use enrollkit::config::{BatchFile, Defaults, Settings};
//! use enrollkit::provider::software::SoftwareProvider;
//! use enrollkit::storage::KeyStorage;
//!
//! # async fn run() -> Result<(), enrollkit::error::EnrollKitError> {
//! let batch = BatchFile::load("csr.json")?;
//! let settings = Settings::merge(&batch.params, &Defaults::default())?;
//!
//! let storage = KeyStorage::detect(settings.key_storage_root.clone())?;
//! let provider = SoftwareProvider::builder().storage(storage.clone()).build();
//!
//! let outcomes = enrollkit::pipeline::run(&batch, &settings, &provider, &storage).await?;
//! println!("{} certificates issued", outcomes.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every stage reports through [`error::EnrollKitError`]:
//!
//! ```rust
//! use enrollkit::enrollment::extract_request_id;
//! use enrollkit::error::EnrollKitError;
//!
//! let page = "<a href=\"certnew.cer?ReqID=17&Enc=b64\">";
//! let id = extract_request_id(page).ok_or(EnrollKitError::RequestIdNotFound);
//! assert_eq!(id.unwrap(), "17");
//! ```
//!
//! ## Module Organization
//!
//! - [`provider`]: Capability interface of the cryptographic provider and the software binding
//! - [`csr`]: PKCS#10 request construction
//! - [`enrollment`]: CA web enrollment client
//! - [`installer`]: Certificate installation
//! - [`storage`]: Key-container layouts and materialization
//! - [`pipeline`]: Per-request workflow and `info.json`
//! - [`root`]: Root certificate bootstrap
//! - [`cert`]: Thumbprints, PEM framing, extensions and distinguished names
//! - [`config`]: Batch file and run settings
//! - [`error`]: Error types

pub mod cert;
pub mod config;
pub mod csr;
pub mod enrollment;
pub mod error;
pub mod installer;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod root;
pub mod storage;
