//! PKCS#10 request construction.

use base64::prelude::*;
use tracing::{debug, warn};

use crate::cert::extensions::{ExtendedKeyUsage, KeyUsage, SubjectAltName, parse_oid};
use crate::cert::params::ExtensionParam;
use crate::error::{EnrollKitError, Result};
use crate::provider::resolver::ResolvedProvider;
use crate::provider::{
    BindingVersions, CryptoProvider, KeyContainer, KeyContainerSpec, RequestTemplate, Version,
};
use crate::request::EnrollmentRequest;

/// Oldest provider build that encodes `otherName` alternative names correctly.
pub const MIN_SAN_CSP_VERSION: Version = Version::new(5, 0, 13300);

/// Oldest plug-in build that passes alternative names through.
pub const MIN_SAN_PLUGIN_VERSION: Version = Version::new(2, 0, 15260);

/// Whether the binding is new enough to carry a subject alternative name.
pub fn san_supported(versions: &BindingVersions) -> bool {
    versions.csp >= MIN_SAN_CSP_VERSION && versions.plugin >= MIN_SAN_PLUGIN_VERSION
}

/// A signed request and the container holding its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsrDocument {
    pub container: KeyContainer,
    /// Base64 of the DER request, without line breaks.
    pub base64: String,
}

/// Builds signed requests through a provider binding.
pub struct CsrBuilder<'a> {
    provider: &'a dyn CryptoProvider,
}

impl<'a> CsrBuilder<'a> {
    pub fn new(provider: &'a dyn CryptoProvider) -> Self {
        Self { provider }
    }

    /// Provisions the container of `request` and returns its signed request.
    ///
    /// # Arguments
    /// * `request` - Subject, extensions and container parameters.
    /// * `resolved` - Provider, key length and hash algorithm to use.
    ///
    /// # Returns
    /// The base64 request, or [`EnrollKitError::CsrBuildFailed`] wrapping the
    /// first failure.
    pub fn build(
        &self,
        request: &EnrollmentRequest,
        resolved: &ResolvedProvider,
    ) -> Result<CsrDocument> {
        self.try_build(request, resolved)
            .map_err(|e| EnrollKitError::csr_build(request.container_name(), e))
    }

    fn try_build(
        &self,
        request: &EnrollmentRequest,
        resolved: &ResolvedProvider,
    ) -> Result<CsrDocument> {
        let template = RequestTemplate {
            subject: request.dn.to_x500_string(),
            extensions: self.extensions(request)?,
            hash_algorithm: resolved.hash_algorithm,
        };

        let spec = KeyContainerSpec {
            name: request.container_name().to_string(),
            provider_name: resolved.name.clone(),
            provider_type: resolved.type_code,
            key_length: resolved.default_key_length,
            key_spec: request.container.key_spec.unwrap_or_default(),
            exportable: request.container.exportable,
            protection: request.container.key_protection,
            pin: request.container.pin.clone(),
            machine_context: false,
        };
        let container = self.provider.provision(&spec)?;
        let der = self.provider.create_request(&container, &template)?;

        debug!(
            container = %container.reported_name,
            subject = %template.subject,
            extensions = template.extensions.len(),
            "built certificate request"
        );

        Ok(CsrDocument {
            container,
            base64: BASE64_STANDARD.encode(der),
        })
    }

    fn extensions(&self, request: &EnrollmentRequest) -> Result<Vec<ExtensionParam>> {
        let key_usage = request
            .eku_key_usage_flags
            .map(KeyUsage::from_xcn_flags)
            .unwrap_or_default();
        let eku = ExtendedKeyUsage::from_dotted(request.extension_eku.as_slice())?;
        let mut extensions = vec![
            ExtensionParam::from_extension(&key_usage, false)?,
            ExtensionParam::from_extension(&eku, false)?,
        ];

        if request.san.is_empty() {
            return Ok(extensions);
        }
        let versions = self.provider.versions()?;
        if !san_supported(&versions) {
            warn!(
                container = request.container_name(),
                csp = %versions.csp,
                plugin = %versions.plugin,
                "binding too old for subject alternative names, skipping"
            );
            return Ok(extensions);
        }

        let mut san = SubjectAltName::default();
        for (oid, values) in &request.san {
            let type_id = parse_oid(oid)?;
            san.other_names
                .extend(values.iter().map(|value| (type_id, value.clone())));
        }
        extensions.push(ExtensionParam::from_extension(&san, false)?);
        Ok(extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn san_gate_requires_both_builds() {
        let ok = BindingVersions {
            csp: Version::new(5, 0, 13300),
            plugin: Version::new(2, 0, 15260),
        };
        assert!(san_supported(&ok));

        let old_csp = BindingVersions {
            csp: Version::new(5, 0, 12000),
            ..ok
        };
        assert!(!san_supported(&old_csp));

        let old_plugin = BindingVersions {
            plugin: Version::new(2, 0, 14000),
            ..ok
        };
        assert!(!san_supported(&old_plugin));

        let newer_major = BindingVersions {
            csp: Version::new(6, 0, 0),
            plugin: Version::new(3, 0, 0),
        };
        assert!(san_supported(&newer_major));
    }
}
