//! Capability interface over the local cryptographic service provider.
//!
//! The enrollment workflow never touches key material itself. It drives a
//! [`CryptoProvider`] binding that enumerates providers and algorithms,
//! provisions key containers, signs PKCS#10 requests, installs CA responses
//! and exports PKCS#12 files. [`software::SoftwareProvider`] is the bundled
//! binding; native bindings implement the same trait.

pub mod resolver;
pub mod software;

use std::fmt;
use std::path::Path;

use const_oid::ObjectIdentifier;

use crate::cert::params::ExtensionParam;
use crate::error::Result;
use crate::request::KeySpec;

/// An installed provider as reported by the binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: String,
    /// Numeric provider type code (`PROV_*`).
    pub type_code: u32,
    /// Key specs the provider can create containers for.
    pub key_specs: Vec<KeySpec>,
    /// Default key length in bits of the provider's key-exchange algorithm.
    pub default_key_length: u32,
}

/// Interface type of an algorithm (`XCN_CRYPT_*_INTERFACE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlgorithmInterface {
    Cipher,
    Hash,
    AsymmetricEncryption,
    SecretAgreement,
    Signature,
    Rng,
    KeyDerivation,
}

impl AlgorithmInterface {
    /// Maps a CertEnroll interface code. Unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Cipher),
            2 => Some(Self::Hash),
            3 => Some(Self::AsymmetricEncryption),
            4 => Some(Self::SecretAgreement),
            5 => Some(Self::Signature),
            6 => Some(Self::Rng),
            7 => Some(Self::KeyDerivation),
            _ => None,
        }
    }
}

/// One algorithm exposed by a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlgorithmInfo {
    pub interface: AlgorithmInterface,
    pub friendly_name: String,
    /// Dotted OID, empty when the provider does not publish one.
    pub oid: String,
}

/// `major.minor.build` version triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Builds of the provider itself and of the scripting plug-in in front of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingVersions {
    pub csp: Version,
    pub plugin: Version,
}

/// Everything the binding needs to provision a private-key container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyContainerSpec {
    pub name: String,
    pub provider_name: String,
    pub provider_type: u32,
    pub key_length: u32,
    pub key_spec: KeySpec,
    pub exportable: bool,
    pub protection: u32,
    pub pin: Option<String>,
    /// Machine-wide key set instead of the current user's.
    pub machine_context: bool,
}

/// A provider-managed private-key container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyContainer {
    /// Name chosen by the caller.
    pub name: String,
    /// Fully qualified name reported by the provider, for example
    /// `\\.\HDIMAGE\TEST_1` or `\\.\REGISTRY\TEST_1`.
    pub reported_name: String,
    /// Internal unique identifier assigned by the provider.
    pub unique_name: String,
}

/// A PKCS#10 request ready to be signed by the container's key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestTemplate {
    /// Subject in X.500 string form (`CN="x";O="y"`).
    pub subject: String,
    pub extensions: Vec<ExtensionParam>,
    pub hash_algorithm: ObjectIdentifier,
}

/// Enrollment context an issued certificate is installed into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnrollmentContext {
    User,
    Machine,
}

/// How a CA response is handed to the binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallPolicy {
    pub context: EnrollmentContext,
    /// Accept a chain whose root is not in the trust store.
    pub allow_untrusted_root: bool,
}

impl Default for InstallPolicy {
    fn default() -> Self {
        Self {
            context: EnrollmentContext::User,
            allow_untrusted_root: true,
        }
    }
}

/// Certificate stores of the current user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CertStore {
    /// Personal certificates.
    My,
    /// Trusted roots.
    Root,
}

/// Capability interface of a cryptographic-provider binding.
///
/// A binding is one process-wide session. Implementations are not required to
/// be reentrant; the workflow calls them from a single task.
pub trait CryptoProvider {
    /// Installed providers.
    fn providers(&self) -> Result<Vec<ProviderInfo>>;

    /// Algorithms exposed by the named provider, in enumeration order.
    fn algorithms(&self, provider_name: &str) -> Result<Vec<AlgorithmInfo>>;

    /// Provider name used when a request carries no hint.
    fn default_provider_name(&self) -> &str;

    fn versions(&self) -> Result<BindingVersions>;

    /// Creates a new key container and generates its key pair.
    fn provision(&self, spec: &KeyContainerSpec) -> Result<KeyContainer>;

    /// Builds and signs a PKCS#10 request with the container's key.
    /// Returns the DER encoding.
    fn create_request(&self, container: &KeyContainer, template: &RequestTemplate)
    -> Result<Vec<u8>>;

    /// Installs a base64 CA response, binding it to the private key that
    /// produced the request.
    fn install_response(&self, response_base64: &str, policy: &InstallPolicy) -> Result<()>;

    /// Looks a container up by its external name.
    fn container(&self, name: &str) -> Result<KeyContainer>;

    fn delete_container(&self, container: &KeyContainer) -> Result<()>;

    /// Writes a PKCS#12 file holding the container's key and certificate.
    fn export_pfx(&self, container: &KeyContainer, path: &Path, pin: Option<&str>) -> Result<()>;

    fn certificate_exists(&self, thumbprint: &str, store: CertStore) -> Result<bool>;

    /// Adds a base64 certificate to a store.
    fn add_certificate(&self, store: CertStore, certificate_base64: &str) -> Result<()>;

    fn delete_certificate(&self, thumbprint: &str, store: CertStore) -> Result<()>;
}
