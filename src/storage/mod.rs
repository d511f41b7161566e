//! Key-container materialization.
//!
//! A provisioned container lives either in a folder under the per-user key
//! storage root (`<root>/abcdefgh.000/…`) or as binary values of a registry
//! key. [`Materializer::materialize`] copies whichever it is into the output
//! folder and, for exportable keys, writes a PKCS#12 file next to it.

pub mod platform;
pub mod registry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use bon::Builder;
use rand::Rng;
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use self::registry::RegistryHive;
use crate::error::{EnrollKitError, Result};
use crate::provider::{CryptoProvider, KeyContainer};
use crate::request::EnrollmentRequest;

/// Marker in a provider-reported container name selecting the registry layout.
pub const REGISTRY_MARKER: &str = "REGISTRY";

const FOLDER_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static CONTAINER_FOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".{8}\.\d{3}").expect("static regex"));

/// A fresh container folder name: eight random `[a-z0-9]` characters and `.000`.
pub fn random_folder_name() -> String {
    let mut rng = rand::rng();
    let stem: String = (0..8)
        .map(|_| FOLDER_ALPHABET[rng.random_range(0..FOLDER_ALPHABET.len())] as char)
        .collect();
    format!("{stem}.000")
}

/// Registry subtree holding a user's containers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RegistryScope {
    /// Elevated process: machine-wide `Keys` subtree.
    #[default]
    Machine,
    /// Per-user subtree identified by security identifier.
    User { sid: String },
}

/// Where the provider keeps its containers on this host.
#[derive(Clone, Builder)]
pub struct KeyStorage {
    /// Per-user key-storage root of folder-resident containers.
    #[builder(into)]
    root: PathBuf,
    hive: Arc<dyn RegistryHive>,
    #[builder(default)]
    scope: RegistryScope,
    #[builder(default = platform::registry_prefix().to_string(), into)]
    registry_prefix: String,
}

impl KeyStorage {
    /// Host defaults, with an optional override of the folder root.
    pub fn detect(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => platform::default_key_root()?,
        };
        let scope = if platform::is_elevated() {
            RegistryScope::Machine
        } else {
            RegistryScope::User {
                sid: platform::current_user_sid()?,
            }
        };
        Ok(Self::builder()
            .root(root)
            .hive(platform::native_hive())
            .scope(scope)
            .build())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hive(&self) -> &dyn RegistryHive {
        self.hive.as_ref()
    }

    /// Registry key of the container called `name`.
    pub fn registry_key_path(&self, name: &str) -> String {
        match &self.scope {
            RegistryScope::Machine => {
                format!(r"{}\Crypto Pro\Settings\Keys\{name}", self.registry_prefix)
            }
            RegistryScope::User { sid } => format!(
                r"{}\Crypto Pro\Settings\Users\{sid}\Keys\{name}",
                self.registry_prefix
            ),
        }
    }

    /// Physical layout of `container`.
    pub fn layout_for(&self, container: &KeyContainer) -> Result<ContainerLayout> {
        if container.reported_name.contains(REGISTRY_MARKER) {
            return Ok(ContainerLayout::Registry {
                key_path: self.registry_key_path(&container.name),
            });
        }
        let folder = CONTAINER_FOLDER
            .find(&container.unique_name)
            .ok_or_else(|| {
                EnrollKitError::ContainerLayoutUnsupported(container.unique_name.clone())
            })?;
        Ok(ContainerLayout::Filesystem {
            source: self.root.join(folder.as_str()),
        })
    }
}

/// Physical layout of a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerLayout {
    Filesystem { source: PathBuf },
    Registry { key_path: String },
}

/// What [`Materializer::materialize`] wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerArtifact {
    pub folder: PathBuf,
    pub pfx: Option<PathBuf>,
}

impl ContainerArtifact {
    /// Folder name relative to the output root.
    pub fn folder_name(&self) -> String {
        self.folder
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Copies provisioned containers out of provider storage.
pub struct Materializer<'a> {
    provider: &'a dyn CryptoProvider,
    storage: &'a KeyStorage,
}

impl<'a> Materializer<'a> {
    pub fn new(provider: &'a dyn CryptoProvider, storage: &'a KeyStorage) -> Self {
        Self { provider, storage }
    }

    /// Extracts the container of `request` into `output_root`.
    ///
    /// # Arguments
    /// * `request` - Supplies the container name, the exportable flag and the PIN.
    /// * `output_root` - Folder receiving the container folder and the `.pfx` file.
    ///
    /// # Returns
    /// The written container folder and, for exportable keys, the PKCS#12 path.
    pub fn materialize(
        &self,
        request: &EnrollmentRequest,
        output_root: &Path,
    ) -> Result<ContainerArtifact> {
        let folder = self.extract(request.container_name(), output_root)?;
        let pfx = if request.container.exportable {
            Some(self.export_pfx(request, output_root)?)
        } else {
            None
        };
        Ok(ContainerArtifact { folder, pfx })
    }

    /// Copies the container called `name` into `output_root` and returns the
    /// new folder.
    pub fn extract(&self, name: &str, output_root: &Path) -> Result<PathBuf> {
        let container = self.provider.container(name)?;
        match self.storage.layout_for(&container)? {
            ContainerLayout::Registry { key_path } => {
                debug!(container = name, key = %key_path, "extracting registry container");
                self.extract_registry(&key_path, output_root)
            }
            ContainerLayout::Filesystem { source } => {
                debug!(container = name, source = %source.display(), "copying container folder");
                copy_container_folder(&source, output_root)
            }
        }
    }

    /// Writes `<name>.pfx` protected by the request's PIN, or an empty one.
    pub fn export_pfx(&self, request: &EnrollmentRequest, output_root: &Path) -> Result<PathBuf> {
        let name = request.container_name();
        let container = self.provider.container(name)?;
        let path = output_root.join(format!("{name}.pfx"));
        let pin = request.container.pin.as_deref().unwrap_or("");
        self.provider.export_pfx(&container, &path, Some(pin))?;
        Ok(path)
    }

    fn extract_registry(&self, key_path: &str, output_root: &Path) -> Result<PathBuf> {
        let hive = self.storage.hive();
        if !hive.key_exists(key_path) {
            return Err(EnrollKitError::ContainerNotFound(key_path.to_string()));
        }
        let folder = output_root.join(random_folder_name());
        fs::create_dir_all(&folder)?;
        for value in hive.value_names(key_path)? {
            let data = hive.read_binary(key_path, &value)?;
            fs::write(folder.join(&value), data)?;
        }
        Ok(folder)
    }
}

/// Recursively copies `source` into `output_root`, keeping its folder name.
fn copy_container_folder(source: &Path, output_root: &Path) -> Result<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        EnrollKitError::ContainerLayoutUnsupported(source.display().to_string())
    })?;
    let destination = output_root.join(name);
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| EnrollKitError::InvalidInput(e.to_string()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(destination)
}
