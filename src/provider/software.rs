//! Software provider binding.
//!
//! Generates RSA keys with RustCrypto and keeps them in the same two physical
//! layouts a hardware-less CSP uses: a `xxxxxxxx.000` folder under the key
//! storage root, or binary values of a registry key. Certificate stores are
//! held in memory for the life of the binding.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bon::Builder;
use const_oid::ObjectIdentifier;
use const_oid::db::rfc5912::{
    ID_SHA_1, ID_SHA_256, ID_SHA_384, ID_SHA_512, SHA_1_WITH_RSA_ENCRYPTION,
    SHA_256_WITH_RSA_ENCRYPTION, SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
};
use der::Encode;
use der::asn1::{Any, BitString, SetOfVec};
use rand_core::OsRng;
use rsa::pkcs1v15::SigningKey as RsaSigningKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use tracing::debug;
use x509_cert::attr::Attribute;
use x509_cert::ext::Extension;
use x509_cert::request::{CertReq, CertReqInfo};
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use super::{
    AlgorithmInfo, AlgorithmInterface, BindingVersions, CertStore, CryptoProvider,
    EnrollmentContext, InstallPolicy, KeyContainer, KeyContainerSpec, ProviderInfo,
    RequestTemplate, Version,
};
use crate::cert::params::DistinguishedName;
use crate::cert::{Certificate, thumbprint};
use crate::error::{EnrollKitError, Result};
use crate::request::KeySpec;
use crate::storage::registry::MemoryHive;
use crate::storage::{KeyStorage, random_folder_name};

/// Provider supporting key-exchange and signature keys.
pub const SOFTWARE_PROVIDER_NAME: &str = "EnrollKit Software RSA Provider";

/// Signature-only provider.
pub const SOFTWARE_SIGNATURE_PROVIDER_NAME: &str = "EnrollKit Software RSA Signature Provider";

/// `PROV_RSA_AES`
pub const PROV_RSA_AES: u32 = 24;

/// `PROV_RSA_SIG`
pub const PROV_RSA_SIG: u32 = 2;

/// `extensionRequest` (PKCS#9)
const ID_EXTENSION_REQ: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

const NAME_FILE: &str = "name.key";
const PRIMARY_FILE: &str = "primary.key";
const CERTIFICATE_FILE: &str = "certificate.cer";

/// Where new containers are created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContainerMedia {
    /// `xxxxxxxx.000` folders under the key-storage root.
    #[default]
    Folder,
    /// Binary values under the container's registry key.
    Registry,
}

#[derive(Debug)]
enum Location {
    Folder(PathBuf),
    Registry(String),
}

struct Record {
    container: KeyContainer,
    key: RsaPrivateKey,
    exportable: bool,
    location: Location,
    certificate: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, Record>,
    stores: BTreeMap<CertStore, BTreeMap<String, Vec<u8>>>,
}

/// RustCrypto-backed [`CryptoProvider`].
///
/// ```no_run
/// use enrollkit::provider::software::SoftwareProvider;
/// use enrollkit::storage::KeyStorage;
///
/// let storage = KeyStorage::detect(None).unwrap();
/// let provider = SoftwareProvider::builder().storage(storage).build();
/// ```
#[derive(Builder)]
pub struct SoftwareProvider {
    storage: KeyStorage,
    /// Writable hive backing registry-resident containers. Must be the hive
    /// `storage` reads from.
    registry: Option<Arc<MemoryHive>>,
    #[builder(default)]
    media: ContainerMedia,
    /// RSA modulus size of new keys.
    #[builder(default = 2048)]
    key_length: u32,
    #[builder(default = BindingVersions {
        csp: Version::new(5, 0, 13300),
        plugin: Version::new(2, 0, 15260),
    })]
    versions: BindingVersions,
    #[builder(skip)]
    state: Mutex<State>,
}

impl SoftwareProvider {
    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| EnrollKitError::provider("provider state lock poisoned"))
    }

    fn registry(&self) -> Result<&MemoryHive> {
        self.registry
            .as_deref()
            .ok_or_else(|| EnrollKitError::provider("no registry hive configured"))
    }

    fn catalogue(&self) -> Vec<ProviderInfo> {
        vec![
            ProviderInfo {
                name: SOFTWARE_PROVIDER_NAME.to_string(),
                type_code: PROV_RSA_AES,
                key_specs: vec![KeySpec::KeyExchange, KeySpec::Signature],
                default_key_length: self.key_length,
            },
            ProviderInfo {
                name: SOFTWARE_SIGNATURE_PROVIDER_NAME.to_string(),
                type_code: PROV_RSA_SIG,
                key_specs: vec![KeySpec::Signature],
                default_key_length: self.key_length,
            },
        ]
    }

    fn new_folder(&self) -> PathBuf {
        loop {
            let candidate = self.storage.root().join(random_folder_name());
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    fn persist(&self, location: &Location, item: &str, data: &[u8]) -> Result<()> {
        match location {
            Location::Folder(folder) => Ok(fs::write(folder.join(item), data)?),
            Location::Registry(key_path) => self.registry()?.write_binary(key_path, item, data),
        }
    }

    /// Creates the container's storage and writes `items` into it. A failed
    /// write removes whatever was created.
    fn write_container(&self, location: &Location, items: &[(&str, &[u8])]) -> Result<()> {
        if let Location::Folder(folder) = location {
            fs::create_dir_all(folder)?;
        }
        let written = items
            .iter()
            .try_for_each(|(item, data)| self.persist(location, item, data));
        if written.is_err() {
            self.discard(location);
        }
        written
    }

    fn discard(&self, location: &Location) {
        let removed = match location {
            Location::Folder(folder) => fs::remove_dir_all(folder).map_err(EnrollKitError::from),
            Location::Registry(key_path) => {
                self.registry().and_then(|hive| hive.delete_key(key_path))
            }
        };
        if let Err(e) = removed {
            debug!(location = ?location, "cannot remove partial container: {e}");
        }
    }

    fn is_trusted(&self, state: &State, certificate: &Certificate) -> Result<bool> {
        let issuer = &certificate.inner.tbs_certificate.issuer;
        let Some(roots) = state.stores.get(&CertStore::Root) else {
            return Ok(false);
        };
        for der in roots.values() {
            if &Certificate::from_der(der)?.inner.tbs_certificate.subject == issuer {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn spki_der(key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let spki = SubjectPublicKeyInfoOwned::from_key(RsaPublicKey::from(key))?;
    Ok(spki.to_der()?)
}

/// Signs `data` with PKCS#1 v1.5 over the hash named by `hash`.
///
/// # Returns
/// The signature algorithm OID and the signature bytes.
fn sign_data(
    key: &RsaPrivateKey,
    hash: &ObjectIdentifier,
    data: &[u8],
) -> Result<(ObjectIdentifier, Vec<u8>)> {
    let key = key.clone();
    if *hash == ID_SHA_1 {
        let signer: RsaSigningKey<Sha1> = RsaSigningKey::new(key);
        Ok((SHA_1_WITH_RSA_ENCRYPTION, signer.sign(data).to_vec()))
    } else if *hash == ID_SHA_256 {
        let signer: RsaSigningKey<Sha256> = RsaSigningKey::new(key);
        Ok((SHA_256_WITH_RSA_ENCRYPTION, signer.sign(data).to_vec()))
    } else if *hash == ID_SHA_384 {
        let signer: RsaSigningKey<Sha384> = RsaSigningKey::new(key);
        Ok((SHA_384_WITH_RSA_ENCRYPTION, signer.sign(data).to_vec()))
    } else if *hash == ID_SHA_512 {
        let signer: RsaSigningKey<Sha512> = RsaSigningKey::new(key);
        Ok((SHA_512_WITH_RSA_ENCRYPTION, signer.sign(data).to_vec()))
    } else {
        Err(EnrollKitError::HashAlgorithmUnavailable(hash.to_string()))
    }
}

fn extension_request(extensions: Vec<Extension>) -> Result<Attribute> {
    let value = Any::encode_from(&extensions)?;
    Ok(Attribute {
        oid: ID_EXTENSION_REQ,
        values: SetOfVec::try_from(vec![value])?,
    })
}

impl CryptoProvider for SoftwareProvider {
    fn providers(&self) -> Result<Vec<ProviderInfo>> {
        Ok(self.catalogue())
    }

    fn algorithms(&self, provider_name: &str) -> Result<Vec<AlgorithmInfo>> {
        if !self.catalogue().iter().any(|p| p.name == provider_name) {
            return Err(EnrollKitError::ProviderNotFound(provider_name.to_string()));
        }
        let algorithm = |interface, name: &str, oid: ObjectIdentifier| AlgorithmInfo {
            interface,
            friendly_name: name.to_string(),
            oid: oid.to_string(),
        };
        Ok(vec![
            algorithm(AlgorithmInterface::Hash, "sha1", ID_SHA_1),
            algorithm(AlgorithmInterface::Hash, "sha384", ID_SHA_384),
            algorithm(AlgorithmInterface::Hash, "sha512", ID_SHA_512),
            algorithm(
                AlgorithmInterface::Signature,
                "RSA",
                const_oid::db::rfc5912::RSA_ENCRYPTION,
            ),
            algorithm(AlgorithmInterface::Hash, "sha256", ID_SHA_256),
            AlgorithmInfo {
                interface: AlgorithmInterface::Rng,
                friendly_name: "RNG".to_string(),
                oid: String::new(),
            },
        ])
    }

    fn default_provider_name(&self) -> &str {
        SOFTWARE_PROVIDER_NAME
    }

    fn versions(&self) -> Result<BindingVersions> {
        Ok(self.versions)
    }

    fn provision(&self, spec: &KeyContainerSpec) -> Result<KeyContainer> {
        let info = self
            .catalogue()
            .into_iter()
            .find(|p| p.name == spec.provider_name && p.type_code == spec.provider_type)
            .ok_or_else(|| EnrollKitError::ProviderNotFound(spec.provider_name.clone()))?;
        if !info.key_specs.contains(&spec.key_spec) {
            return Err(EnrollKitError::provider(format!(
                "{} cannot create {:?} keys",
                info.name, spec.key_spec
            )));
        }
        if spec.machine_context {
            return Err(EnrollKitError::provider("machine key sets are not supported"));
        }
        if spec.protection != 0 {
            return Err(EnrollKitError::provider(format!(
                "key protection level {} is not supported",
                spec.protection
            )));
        }

        let mut state = self.state()?;
        if state.containers.contains_key(&spec.name) {
            return Err(EnrollKitError::provider(format!(
                "container {} already exists",
                spec.name
            )));
        }

        let key = RsaPrivateKey::new(&mut OsRng, spec.key_length as usize)?;
        let (location, container) = match self.media {
            ContainerMedia::Folder => {
                let folder = self.new_folder();
                let folder_name = folder
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let tag = thumbprint(spec.name.as_bytes())[..4].to_uppercase();
                let container = KeyContainer {
                    name: spec.name.clone(),
                    reported_name: format!(r"\\.\HDIMAGE\{}", spec.name),
                    unique_name: format!(r"\\.\HDIMAGE\HDIMAGE\\{folder_name}\{tag}"),
                };
                (Location::Folder(folder), container)
            }
            ContainerMedia::Registry => {
                let container = KeyContainer {
                    name: spec.name.clone(),
                    reported_name: format!(r"\\.\REGISTRY\{}", spec.name),
                    unique_name: format!(r"REGISTRY\\{}", spec.name),
                };
                (
                    Location::Registry(self.storage.registry_key_path(&spec.name)),
                    container,
                )
            }
        };

        let primary = key.to_pkcs8_der()?;
        self.write_container(
            &location,
            &[
                (NAME_FILE, spec.name.as_bytes()),
                (PRIMARY_FILE, primary.as_bytes()),
            ],
        )?;

        debug!(
            container = %container.reported_name,
            location = ?location,
            bits = spec.key_length,
            "provisioned key container"
        );

        state.containers.insert(
            spec.name.clone(),
            Record {
                container: container.clone(),
                key,
                exportable: spec.exportable,
                location,
                certificate: None,
            },
        );
        Ok(container)
    }

    fn create_request(
        &self,
        container: &KeyContainer,
        template: &RequestTemplate,
    ) -> Result<Vec<u8>> {
        let state = self.state()?;
        let record = state
            .containers
            .get(&container.name)
            .ok_or_else(|| EnrollKitError::ContainerNotFound(container.name.clone()))?;

        let subject = DistinguishedName::from_x500_string(&template.subject)?.to_x509_name()?;
        let extensions = template
            .extensions
            .iter()
            .map(|ext| ext.to_x509())
            .collect::<Result<Vec<_>>>()?;
        let attributes = if extensions.is_empty() {
            SetOfVec::new()
        } else {
            SetOfVec::try_from(vec![extension_request(extensions)?])?
        };

        let info = CertReqInfo {
            version: x509_cert::request::Version::V1,
            subject,
            public_key: SubjectPublicKeyInfoOwned::from_key(RsaPublicKey::from(&record.key))?,
            attributes,
        };
        let (algorithm, signature) =
            sign_data(&record.key, &template.hash_algorithm, &info.to_der()?)?;

        let request = CertReq {
            info,
            algorithm: AlgorithmIdentifierOwned {
                oid: algorithm,
                parameters: None,
            },
            signature: BitString::from_bytes(&signature)?,
        };
        Ok(request.to_der()?)
    }

    fn install_response(&self, response_base64: &str, policy: &InstallPolicy) -> Result<()> {
        if policy.context == EnrollmentContext::Machine {
            return Err(EnrollKitError::InstallFailed(
                "machine context is not supported".to_string(),
            ));
        }
        let certificate = Certificate::from_base64(response_base64)
            .map_err(|e| EnrollKitError::InstallFailed(e.to_string()))?;
        let spki = certificate.subject_public_key_der()?;
        let der = certificate.to_der()?;

        let mut state = self.state()?;
        if !policy.allow_untrusted_root && !self.is_trusted(&state, &certificate)? {
            return Err(EnrollKitError::InstallFailed(
                "issuer is not a trusted root".to_string(),
            ));
        }

        let mut owner = None;
        for (name, record) in &state.containers {
            if spki_der(&record.key)? == spki {
                owner = Some(name.clone());
                break;
            }
        }
        let owner = owner.ok_or_else(|| {
            EnrollKitError::InstallFailed("no private key matches the certificate".to_string())
        })?;

        if let Some(record) = state.containers.get(&owner) {
            self.persist(&record.location, CERTIFICATE_FILE, &der)?;
        }
        if let Some(record) = state.containers.get_mut(&owner) {
            record.certificate = Some(der.clone());
        }
        state
            .stores
            .entry(CertStore::My)
            .or_default()
            .insert(thumbprint(&der), der);

        debug!(container = %owner, "installed certificate");
        Ok(())
    }

    fn container(&self, name: &str) -> Result<KeyContainer> {
        self.state()?
            .containers
            .get(name)
            .map(|record| record.container.clone())
            .ok_or_else(|| EnrollKitError::ContainerNotFound(name.to_string()))
    }

    fn delete_container(&self, container: &KeyContainer) -> Result<()> {
        let record = self
            .state()?
            .containers
            .remove(&container.name)
            .ok_or_else(|| EnrollKitError::ContainerNotFound(container.name.clone()))?;
        match record.location {
            Location::Folder(folder) => match fs::remove_dir_all(&folder) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            Location::Registry(key_path) => self.registry()?.delete_key(&key_path),
        }
    }

    fn export_pfx(&self, container: &KeyContainer, path: &Path, pin: Option<&str>) -> Result<()> {
        let state = self.state()?;
        let record = state
            .containers
            .get(&container.name)
            .ok_or_else(|| EnrollKitError::ContainerNotFound(container.name.clone()))?;
        if !record.exportable {
            return Err(EnrollKitError::provider(format!(
                "key of {} is not exportable",
                container.name
            )));
        }

        let der = record.key.to_pkcs8_der()?;
        let pkey = openssl::pkey::PKey::private_key_from_pkcs8(der.as_bytes())?;
        let mut builder = openssl::pkcs12::Pkcs12::builder();
        builder.name(&container.name).pkey(&pkey);
        let x509 = record
            .certificate
            .as_deref()
            .map(openssl::x509::X509::from_der)
            .transpose()?;
        if let Some(x509) = &x509 {
            builder.cert(x509);
        }
        let pfx = builder.build2(pin.unwrap_or(""))?;
        fs::write(path, pfx.to_der()?)?;
        Ok(())
    }

    fn certificate_exists(&self, thumbprint: &str, store: CertStore) -> Result<bool> {
        Ok(self
            .state()?
            .stores
            .get(&store)
            .is_some_and(|certs| certs.contains_key(&thumbprint.to_ascii_lowercase())))
    }

    fn add_certificate(&self, store: CertStore, certificate_base64: &str) -> Result<()> {
        let der = crate::cert::decode_base64_certificate(certificate_base64)?;
        Certificate::from_der(&der)?;
        self.state()?
            .stores
            .entry(store)
            .or_default()
            .insert(thumbprint(&der), der);
        Ok(())
    }

    fn delete_certificate(&self, thumbprint: &str, store: CertStore) -> Result<()> {
        if let Some(certs) = self.state()?.stores.get_mut(&store) {
            certs.remove(&thumbprint.to_ascii_lowercase());
        }
        Ok(())
    }
}
