use const_oid::ObjectIdentifier;
use serde::Deserialize;
use tracing::debug;

use super::{AlgorithmInfo, AlgorithmInterface, CryptoProvider};
use crate::cert::extensions::parse_oid;
use crate::error::{EnrollKitError, Result};
use crate::request::KeySpec;

/// Which qualifying hash algorithm wins when a provider exposes several.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashSelection {
    /// The last qualifying algorithm in enumeration order.
    #[default]
    LastMatch,
    /// The first qualifying algorithm in enumeration order.
    FirstMatch,
    /// The algorithm with this OID if it qualifies, otherwise `LastMatch`.
    Preferred(String),
}

/// Provider parameters a request is built with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub name: String,
    pub type_code: u32,
    pub default_key_length: u32,
    pub hash_algorithm: ObjectIdentifier,
    pub hash_name: String,
}

fn is_qualifying_hash(algorithm: &AlgorithmInfo) -> bool {
    algorithm.interface == AlgorithmInterface::Hash
        && !algorithm.friendly_name.is_empty()
        && !algorithm.oid.is_empty()
}

/// Picks the hash algorithm from `algorithms` according to `selection`.
pub fn select_hash<'a>(
    algorithms: &'a [AlgorithmInfo],
    selection: &HashSelection,
) -> Option<&'a AlgorithmInfo> {
    let mut qualifying = algorithms.iter().filter(|a| is_qualifying_hash(a));
    match selection {
        HashSelection::LastMatch => qualifying.last(),
        HashSelection::FirstMatch => qualifying.next(),
        HashSelection::Preferred(oid) => algorithms
            .iter()
            .filter(|a| is_qualifying_hash(a))
            .find(|a| a.oid == *oid)
            .or_else(|| qualifying.last()),
    }
}

/// Resolves the provider named by `hint` (or the binding's default) into the
/// parameters used to provision the key and sign the request.
pub fn resolve(
    provider: &dyn CryptoProvider,
    hint: Option<&str>,
    selection: &HashSelection,
) -> Result<ResolvedProvider> {
    let name = hint.unwrap_or_else(|| provider.default_provider_name());

    let info = provider
        .providers()?
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| EnrollKitError::ProviderNotFound(name.to_string()))?;

    if !info.key_specs.contains(&KeySpec::KeyExchange) {
        return Err(EnrollKitError::ProviderNotFound(format!(
            "{name} (no key-exchange support)"
        )));
    }

    let algorithms = provider.algorithms(name)?;
    let hash = select_hash(&algorithms, selection)
        .ok_or_else(|| EnrollKitError::HashAlgorithmUnavailable(name.to_string()))?;
    let hash_algorithm = parse_oid(&hash.oid)
        .map_err(|_| EnrollKitError::HashAlgorithmUnavailable(name.to_string()))?;

    debug!(
        provider = %info.name,
        type_code = info.type_code,
        key_length = info.default_key_length,
        hash = %hash.friendly_name,
        "resolved provider"
    );

    Ok(ResolvedProvider {
        name: info.name,
        type_code: info.type_code,
        default_key_length: info.default_key_length,
        hash_algorithm,
        hash_name: hash.friendly_name.clone(),
    })
}
