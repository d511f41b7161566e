//! Client for the CA web enrollment pages (`/certsrv`).
//!
//! Submission is a form POST to `certfnsh.asp`. The CA answers with an HTML
//! page linking to the issued certificate as `certnew.cer?ReqID=<n>&…`; the
//! certificate is then downloaded in base64 encoding.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::{Url, form_urlencoded};

use crate::error::{EnrollKitError, Result};

const SUBMIT_PATH: &str = "certsrv/certfnsh.asp";
const RETRIEVE_PATH: &str = "certsrv/certnew.cer";

static REQUEST_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ReqID=\d*&").expect("static regex"));

/// Returns the digits of the first `ReqID=<digits>&` fragment in `body`.
///
/// A fragment with no digits yields an empty string, which the CA rejects on
/// retrieval.
pub fn extract_request_id(body: &str) -> Option<&str> {
    REQUEST_ID
        .find(body)
        .map(|m| &body[m.start() + "ReqID=".len()..m.end() - 1])
}

/// HTTP client bound to one CA.
#[derive(Debug, Clone)]
pub struct EnrollmentClient {
    base: Url,
    timeout: Duration,
    http: reqwest::Client,
}

impl EnrollmentClient {
    /// Creates a client for the CA at `base`. `timeout` bounds every call.
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base,
            timeout,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| EnrollKitError::Config(format!("invalid CA url: {e}")))
    }

    /// Submits a base64 request and downloads the issued certificate.
    ///
    /// # Arguments
    /// * `csr_base64` - Base64 of the DER request.
    ///
    /// # Returns
    /// The raw response body of the certificate download, base64 and possibly
    /// PEM framed.
    pub async fn submit(&self, csr_base64: &str) -> Result<String> {
        let url = self.endpoint(SUBMIT_PATH)?;
        debug!("POST {}", url);

        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("Mode", "newreq")
            .append_pair("ThumbPrint", "")
            .append_pair("TargetStoreFlags", "0")
            .append_pair("SaveCert", "yes")
            .append_pair("CertRequest", csr_base64)
            .finish();
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form)
            .send()
            .await?;
        let page = check_status(response)?.text().await?;

        let request_id = extract_request_id(&page).ok_or(EnrollKitError::RequestIdNotFound)?;
        debug!(request_id, "CA accepted request");

        self.download(request_id, false).await
    }

    /// Downloads the CA's own certificate.
    pub async fn fetch_root(&self) -> Result<String> {
        self.download("CACert", true).await
    }

    async fn download(&self, request_id: &str, renewal: bool) -> Result<String> {
        let mut url = self.endpoint(RETRIEVE_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("ReqID", request_id);
            if renewal {
                query.append_pair("Renewal", "-1");
            }
            query.append_pair("Enc", "b64");
        }
        debug!("GET {}", url);

        let response = self.http.get(url).timeout(self.timeout).send().await?;
        let body = check_status(response)?.text().await?;
        if body.trim().is_empty() {
            return Err(EnrollKitError::EmptyCertificate);
        }
        Ok(body)
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(EnrollKitError::CaStatus {
            status: status.as_u16(),
        })
    }
}
