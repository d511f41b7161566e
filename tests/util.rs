#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use base64::prelude::*;
use const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION;
use der::asn1::{BitString, UtcTime};
use der::{Decode, Encode};
use rand_core::OsRng;
use rsa::pkcs1v15::SigningKey as RsaSigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
use x509_cert::certificate::{CertificateInner, TbsCertificateInner};
use x509_cert::name::Name;
use x509_cert::request::CertReq;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};

use enrollkit::cert::params::DistinguishedName;
use enrollkit::config::Settings;
use enrollkit::provider::software::{ContainerMedia, SoftwareProvider};
use enrollkit::storage::KeyStorage;
use enrollkit::storage::registry::MemoryHive;

pub const SUBMIT_PATH: &str = "/certsrv/certfnsh.asp";
pub const RETRIEVE_PATH: &str = "/certsrv/certnew.cer";

/// Subjects whose common name starts with this are refused by the stub CA.
pub const REJECTED_PREFIX: &str = "reject";

/// Subjects whose common name starts with this get an empty submission page.
pub const SILENT_PREFIX: &str = "silent";

/// What the stub CA does with a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Issued(u32),
    Denied,
    Silent,
}

pub const TEST_KEY_BITS: u32 = 1024;

fn sha256_with_rsa() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: SHA_256_WITH_RSA_ENCRYPTION,
        parameters: None,
    }
}

fn validity() -> Validity {
    let now = SystemTime::now();
    Validity {
        not_before: Time::UtcTime(UtcTime::from_system_time(now).unwrap()),
        not_after: Time::UtcTime(
            UtcTime::from_system_time(now + Duration::from_secs(365 * 24 * 3600)).unwrap(),
        ),
    }
}

fn pem_crlf(der: &[u8]) -> String {
    let pem = pem::Pem::new("CERTIFICATE", der);
    pem::encode_config(
        &pem,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::CRLF),
    )
}

/// Self-signed RSA issuer that signs whatever public key a request carries.
pub struct TestCa {
    key: RsaPrivateKey,
    name: Name,
    cert_der: Vec<u8>,
    next_id: AtomicU32,
    issued: Mutex<BTreeMap<u32, Vec<u8>>>,
    requests: Mutex<Vec<CertReq>>,
}

impl TestCa {
    pub fn generate() -> Self {
        let key = RsaPrivateKey::new(&mut OsRng, TEST_KEY_BITS as usize).unwrap();
        let name = DistinguishedName::new()
            .with("CN", "Test Enrollment CA")
            .with("O", "EnrollKit")
            .to_x509_name()
            .unwrap();
        let spki = SubjectPublicKeyInfoOwned::from_key(RsaPublicKey::from(&key)).unwrap();
        let mut ca = Self {
            key,
            name: name.clone(),
            cert_der: Vec::new(),
            next_id: AtomicU32::new(1),
            issued: Mutex::new(BTreeMap::new()),
            requests: Mutex::new(Vec::new()),
        };
        ca.cert_der = ca.sign(name, spki, 1);
        ca
    }

    fn sign(&self, subject: Name, spki: SubjectPublicKeyInfoOwned, serial: u32) -> Vec<u8> {
        let tbs: TbsCertificateInner = TbsCertificateInner {
            version: x509_cert::Version::V3,
            serial_number: SerialNumber::new(&[0x01, (serial & 0xff) as u8]).unwrap(),
            signature: sha256_with_rsa(),
            issuer: self.name.clone(),
            validity: validity(),
            subject,
            subject_public_key_info: spki,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };
        let signer: RsaSigningKey<Sha256> = RsaSigningKey::new(self.key.clone());
        let signature = signer.sign(&tbs.to_der().unwrap()).to_vec();
        CertificateInner {
            tbs_certificate: tbs,
            signature_algorithm: sha256_with_rsa(),
            signature: BitString::from_bytes(&signature).unwrap(),
        }
        .to_der()
        .unwrap()
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn certificate_pem(&self) -> String {
        pem_crlf(&self.cert_der)
    }

    /// Decides on a base64 request, issuing a certificate when it is accepted.
    /// Malformed requests are denied.
    pub fn accept(&self, csr_base64: &str) -> Decision {
        let Some(request) = BASE64_STANDARD
            .decode(csr_base64.trim())
            .ok()
            .and_then(|der| CertReq::from_der(&der).ok())
        else {
            return Decision::Denied;
        };
        let common_name = DistinguishedName::from_x509_name(&request.info.subject)
            .ok()
            .and_then(|subject| {
                subject
                    .iter()
                    .find(|(attribute, _)| *attribute == "CN")
                    .map(|(_, value)| value.to_string())
            })
            .unwrap_or_default();
        self.requests.lock().unwrap().push(request.clone());
        if common_name.starts_with(REJECTED_PREFIX) {
            return Decision::Denied;
        }
        if common_name.starts_with(SILENT_PREFIX) {
            return Decision::Silent;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 100;
        let cert = self.sign(request.info.subject.clone(), request.info.public_key.clone(), id);
        self.issued.lock().unwrap().insert(id, cert);
        Decision::Issued(id)
    }

    pub fn issued(&self, id: u32) -> Option<Vec<u8>> {
        self.issued.lock().unwrap().get(&id).cloned()
    }

    /// Requests received so far, refused ones included.
    pub fn requests(&self) -> Vec<CertReq> {
        self.requests.lock().unwrap().clone()
    }
}

struct SubmitResponder(Arc<TestCa>);

impl Respond for SubmitResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let csr = url::form_urlencoded::parse(&request.body)
            .find(|(key, _)| key == "CertRequest")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        match self.0.accept(&csr) {
            Decision::Issued(id) => ResponseTemplate::new(200).set_body_string(format!(
                "<html><body>Certificate Issued \
                 <a href=\"certnew.cer?ReqID={id}&amp;Enc=b64\">Download</a> \
                 <a href=\"certnew.cer?ReqID={id}&amp;Enc=bin\">DER</a></body></html>"
            )),
            Decision::Denied => ResponseTemplate::new(200)
                .set_body_string("<html><body>Your certificate request was denied.</body></html>"),
            Decision::Silent => ResponseTemplate::new(200),
        }
    }
}

struct RetrieveResponder(Arc<TestCa>);

impl Respond for RetrieveResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let request_id = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "ReqID")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        if request_id == "CACert" {
            return ResponseTemplate::new(200).set_body_string(self.0.certificate_pem());
        }
        match request_id.parse().ok().and_then(|id| self.0.issued(id)) {
            Some(der) => ResponseTemplate::new(200).set_body_string(pem_crlf(&der)),
            None => ResponseTemplate::new(404),
        }
    }
}

/// Mock CA web enrollment server for integration tests.
pub struct StubCa {
    server: MockServer,
    ca: Arc<TestCa>,
}

impl StubCa {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let ca = Arc::new(TestCa::generate());
        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(SubmitResponder(ca.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RETRIEVE_PATH))
            .respond_with(RetrieveResponder(ca.clone()))
            .mount(&server)
            .await;
        Self { server, ca }
    }

    /// A server answering every call with `status`.
    pub async fn failing(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        Self {
            server,
            ca: Arc::new(TestCa::generate()),
        }
    }

    /// A server answering every submission with `submit_page` and every
    /// download with `certificate_body`, both with status 200.
    pub async fn scripted(submit_page: &str, certificate_body: &str) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(submit_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RETRIEVE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(certificate_body))
            .mount(&server)
            .await;
        Self {
            server,
            ca: Arc::new(TestCa::generate()),
        }
    }

    pub fn url(&self) -> String {
        self.server.uri()
    }

    pub fn ca(&self) -> &TestCa {
        &self.ca
    }

    pub fn inner(&self) -> &MockServer {
        &self.server
    }
}

/// Provider storing folder containers under `key_root`.
pub fn folder_provider(key_root: &Path) -> (SoftwareProvider, KeyStorage) {
    let storage = KeyStorage::builder()
        .root(key_root)
        .hive(Arc::new(MemoryHive::default()))
        .build();
    let provider = SoftwareProvider::builder()
        .storage(storage.clone())
        .key_length(TEST_KEY_BITS)
        .build();
    (provider, storage)
}

/// Provider storing containers as registry values.
pub fn registry_provider() -> (SoftwareProvider, KeyStorage, Arc<MemoryHive>) {
    let hive = Arc::new(MemoryHive::default());
    let storage = KeyStorage::builder()
        .root("/nonexistent")
        .hive(hive.clone())
        .registry_prefix("SOFTWARE")
        .build();
    let provider = SoftwareProvider::builder()
        .storage(storage.clone())
        .registry(hive.clone())
        .media(ContainerMedia::Registry)
        .key_length(TEST_KEY_BITS)
        .build();
    (provider, storage, hive)
}

/// Settings pointed at `ca_url` writing into `output`, root bootstrap off.
pub fn settings(ca_url: &str, output: &Path) -> Settings {
    let mut settings = Settings::for_ca(ca_url, output).unwrap();
    settings.skip_root = true;
    settings.timeout = Duration::from_secs(10);
    settings
}
