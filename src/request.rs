//! Per-identity enrollment input.

use std::collections::BTreeMap;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::cert::params::DistinguishedName;
use crate::error::EnrollKitError;

/// Key specification of the provisioned private key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum KeySpec {
    /// `AT_KEYEXCHANGE`, usable for both key agreement and signing.
    #[default]
    KeyExchange,
    /// `AT_SIGNATURE`.
    Signature,
}

impl TryFrom<u32> for KeySpec {
    type Error = EnrollKitError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::KeyExchange),
            2 => Ok(Self::Signature),
            other => Err(EnrollKitError::InvalidInput(format!(
                "unsupported key spec {other}"
            ))),
        }
    }
}

impl From<KeySpec> for u32 {
    fn from(value: KeySpec) -> Self {
        match value {
            KeySpec::KeyExchange => 1,
            KeySpec::Signature => 2,
        }
    }
}

/// Generates a container name that is unique for the life of the process.
pub fn synthesize_container_name() -> String {
    format!("TEST_{}", uuid::Uuid::new_v4())
}

/// Container names become file and folder names in the output tree.
pub fn validate_container_name(name: &str) -> Result<(), EnrollKitError> {
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(EnrollKitError::InvalidInput(format!(
            "container name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}

/// Parameters of the private-key container backing a request.
#[derive(Clone, Debug, Builder, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerParams {
    /// External container name. Empty in a batch file means "synthesize one".
    #[builder(default = synthesize_container_name(), into)]
    #[serde(default)]
    pub name: String,
    #[builder(default)]
    #[serde(default)]
    pub exportable: bool,
    /// Overrides the default key-exchange key spec.
    #[serde(default)]
    pub key_spec: Option<KeySpec>,
    /// Provider protection level, passed through verbatim.
    #[builder(default)]
    #[serde(default)]
    pub key_protection: u32,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

impl Default for ContainerParams {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Everything needed to enroll one identity.
///
/// Built from the batch file (or a builder) and never modified once the
/// pipeline for it starts.
#[derive(Clone, Debug, Builder, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequest {
    pub dn: DistinguishedName,
    /// CertEnroll key-usage flag word; `None` selects the default set.
    #[serde(default)]
    pub eku_key_usage_flags: Option<u32>,
    /// Enhanced key usage OIDs; empty selects client authentication.
    #[builder(default)]
    #[serde(rename = "extensionEKU", default)]
    pub extension_eku: Vec<String>,
    /// Subject alternative names, keyed by `otherName` type OID.
    #[builder(default)]
    #[serde(default)]
    pub san: BTreeMap<String, Vec<String>>,
    #[builder(into)]
    #[serde(default)]
    pub provider_name: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub container: ContainerParams,
}

impl EnrollmentRequest {
    pub fn container_name(&self) -> &str {
        &self.container.name
    }

    /// Fills in a synthesized container name when none was given and drops
    /// an empty provider hint. Names that are not a single path component
    /// are rejected.
    pub fn normalized(mut self) -> Result<Self, EnrollKitError> {
        if self.container.name.trim().is_empty() {
            self.container.name = synthesize_container_name();
        }
        validate_container_name(&self.container.name)?;
        if self
            .provider_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            self.provider_name = None;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_names_are_unique() {
        let a = synthesize_container_name();
        let b = synthesize_container_name();
        assert!(a.starts_with("TEST_"));
        assert_eq!(a.len(), "TEST_".len() + 36);
        assert_ne!(a, b);
    }

    #[test]
    fn builder_synthesizes_container_name() {
        let request = EnrollmentRequest::builder()
            .dn(DistinguishedName::new().with("CN", "user"))
            .build();
        assert!(request.container_name().starts_with("TEST_"));
        assert!(!request.container.exportable);
        assert_eq!(request.container.key_spec, None);
    }

    #[test]
    fn batch_entry_deserializes() {
        let json = r#"{
            "dn": {"CN": "Иванов", "O": "Org"},
            "extensionEKU": ["1.3.6.1.5.5.7.3.4"],
            "ekuKeyUsageFlags": 128,
            "san": {"1.2.643.100.3": ["12345678901"]},
            "providerName": "",
            "container": {"exportable": true, "keySpec": 2, "pin": "1234"}
        }"#;
        let request: EnrollmentRequest = serde_json::from_str(json).unwrap();
        let request = request.normalized().unwrap();
        assert!(request.container_name().starts_with("TEST_"));
        assert_eq!(request.container.key_spec, Some(KeySpec::Signature));
        assert_eq!(request.container.pin.as_deref(), Some("1234"));
        assert_eq!(request.eku_key_usage_flags, Some(128));
        assert_eq!(request.extension_eku, vec!["1.3.6.1.5.5.7.3.4"]);
        assert_eq!(request.provider_name, None);
        assert_eq!(request.san["1.2.643.100.3"], vec!["12345678901"]);
    }

    #[test]
    fn explicit_container_name_is_kept() {
        let request: EnrollmentRequest =
            serde_json::from_str(r#"{"dn": {"CN": "x"}, "container": {"name": "mine"}}"#).unwrap();
        assert_eq!(request.normalized().unwrap().container_name(), "mine");
    }

    #[test]
    fn path_like_container_names_are_rejected() {
        for name in ["../escape", "a/b", r"a\b", ".."] {
            let json = format!(r#"{{"dn": {{"CN": "x"}}, "container": {{"name": {name:?}}}}}"#);
            let request: EnrollmentRequest = serde_json::from_str(&json).unwrap();
            assert!(
                matches!(request.normalized(), Err(EnrollKitError::InvalidInput(_))),
                "{name}"
            );
        }
        assert!(validate_container_name("TEST_1..2").is_ok());
    }

    #[test]
    fn bad_key_spec_is_rejected() {
        let result: Result<EnrollmentRequest, _> =
            serde_json::from_str(r#"{"dn": {}, "container": {"keySpec": 9}}"#);
        assert!(result.is_err());
    }
}
