use const_oid::AssociatedOid;
use der::{
    Decode, Encode,
    asn1::{Any, OctetString},
    oid::ObjectIdentifier,
};
use x509_cert::ext::pkix::name::{GeneralName, OtherName};

use crate::error::EnrollKitError;

/// Trait for converting to and from X.509 extensions.
///
/// This trait provides methods to encode and decode X.509 extension values.
///
/// # Example
/// ```
/// use enrollkit::cert::extensions::{ExtendedKeyUsage, ToAndFromX509Extension};
/// let eku = ExtendedKeyUsage::from_dotted(&["1.3.6.1.5.5.7.3.2"]).unwrap();
/// let encoded = eku.to_x509_extension_value().unwrap();
/// let decoded = ExtendedKeyUsage::from_x509_extension_value(&encoded).unwrap();
/// assert_eq!(eku.usage, decoded.usage);
/// ```
pub trait ToAndFromX509Extension {
    /// The Object Identifier (OID) for the extension.
    const OID: ObjectIdentifier;

    /// Encodes the extension into a DER-encoded byte vector.
    fn to_x509_extension_value(&self) -> Result<Vec<u8>, EnrollKitError>;

    /// Decodes the extension from a DER-encoded byte slice.
    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, EnrollKitError>
    where
        Self: Sized;
}

/// Parses a dotted-decimal object identifier.
pub fn parse_oid(value: &str) -> Result<ObjectIdentifier, EnrollKitError> {
    ObjectIdentifier::new(value.trim())
        .map_err(|e| EnrollKitError::InvalidInput(format!("bad OID '{value}': {e}")))
}

pub use der::flagset::FlagSet;
use x509_cert::ext::pkix::KeyUsage as X509KeyUsage;
pub use x509_cert::ext::pkix::KeyUsages;

/// Represents the Key Usage extension.
///
/// This extension defines the purpose of the key contained in the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage(pub FlagSet<KeyUsages>);

/// CertEnroll `X509KeyUsageFlags` bit values, as written in batch files.
const XCN_FLAG_BITS: [(u32, KeyUsages); 9] = [
    (0x80, KeyUsages::DigitalSignature),
    (0x40, KeyUsages::NonRepudiation),
    (0x20, KeyUsages::KeyEncipherment),
    (0x10, KeyUsages::DataEncipherment),
    (0x08, KeyUsages::KeyAgreement),
    (0x04, KeyUsages::KeyCertSign),
    (0x02, KeyUsages::CRLSign),
    (0x01, KeyUsages::EncipherOnly),
    (0x8000, KeyUsages::DecipherOnly),
];

impl KeyUsage {
    /// keyEncipherment, dataEncipherment, digitalSignature and nonRepudiation.
    pub const DEFAULT_XCN_FLAGS: u32 = 0x20 | 0x10 | 0x80 | 0x40;

    /// Builds a key usage from a CertEnroll flag word. Unknown bits are ignored.
    pub fn from_xcn_flags(flags: u32) -> Self {
        let mut set: FlagSet<KeyUsages> = FlagSet::empty();
        for (bit, usage) in XCN_FLAG_BITS {
            if flags & bit != 0 {
                set |= usage;
            }
        }
        Self(set)
    }

    /// Inverse of [`KeyUsage::from_xcn_flags`].
    pub fn to_xcn_flags(&self) -> u32 {
        XCN_FLAG_BITS
            .iter()
            .filter(|(_, usage)| self.0.contains(*usage))
            .fold(0, |acc, (bit, _)| acc | bit)
    }
}

impl Default for KeyUsage {
    fn default() -> Self {
        Self::from_xcn_flags(Self::DEFAULT_XCN_FLAGS)
    }
}

impl ToAndFromX509Extension for KeyUsage {
    const OID: ObjectIdentifier = <X509KeyUsage as AssociatedOid>::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, EnrollKitError> {
        let ku = X509KeyUsage::from(self.0);
        Ok(ku.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, EnrollKitError> {
        let ku = X509KeyUsage::from_der(extension)?;
        Ok(Self(ku.0))
    }
}

/// Represents the Extended Key Usage extension.
///
/// Any purpose OID is accepted; CAs frequently issue private-arc purposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedKeyUsage {
    pub usage: Vec<ObjectIdentifier>,
}

impl ExtendedKeyUsage {
    /// Parses each dotted OID. An empty list yields client authentication only.
    pub fn from_dotted<S: AsRef<str>>(oids: &[S]) -> Result<Self, EnrollKitError> {
        if oids.is_empty() {
            return Ok(Self {
                usage: vec![const_oid::db::rfc5912::ID_KP_CLIENT_AUTH],
            });
        }
        let usage = oids
            .iter()
            .map(|oid| parse_oid(oid.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { usage })
    }
}

impl ToAndFromX509Extension for ExtendedKeyUsage {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::ExtendedKeyUsage::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, EnrollKitError> {
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage(self.usage.clone());
        Ok(eku.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, EnrollKitError> {
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage::from_der(extension)?;
        Ok(Self { usage: eku.0 })
    }
}

/// Represents the Subject Alternative Name (SAN) extension.
///
/// Only `otherName` entries are produced. Each value is carried as the raw
/// bytes of the string wrapped in an OCTET STRING.
///
/// # Fields
/// * `other_names` - `(type-id, value)` pairs in encoding order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltName {
    pub other_names: Vec<(ObjectIdentifier, String)>,
}

impl ToAndFromX509Extension for SubjectAltName {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::SubjectAltName::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, EnrollKitError> {
        let san = x509_cert::ext::pkix::SubjectAltName(
            self.other_names
                .iter()
                .map(|(type_id, value)| {
                    let wrapped = OctetString::new(value.as_bytes())?;
                    Ok(GeneralName::OtherName(OtherName {
                        type_id: *type_id,
                        value: Any::encode_from(&wrapped)?,
                    }))
                })
                .collect::<Result<Vec<_>, der::Error>>()?,
        );

        Ok(san.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, EnrollKitError> {
        let san = x509_cert::ext::pkix::SubjectAltName::from_der(extension)?;
        let other_names = san
            .0
            .iter()
            .map(|name| match name {
                GeneralName::OtherName(other) => {
                    let wrapped: OctetString = other.value.decode_as()?;
                    let value = String::from_utf8(wrapped.as_bytes().to_vec())
                        .map_err(|e| EnrollKitError::DecodingError(e.to_string()))?;
                    Ok((other.type_id, value))
                }
                _ => Err(EnrollKitError::InvalidInput(
                    "Unsupported general name type".to_string(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { other_names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_usage_encoding_decoding() {
        let original = KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment);
        let encoded = original.to_x509_extension_value().unwrap();
        let decoded = KeyUsage::from_x509_extension_value(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_default_key_usage_flags() {
        let ku = KeyUsage::default();
        assert!(ku.0.contains(KeyUsages::KeyEncipherment));
        assert!(ku.0.contains(KeyUsages::DataEncipherment));
        assert!(ku.0.contains(KeyUsages::DigitalSignature));
        assert!(ku.0.contains(KeyUsages::NonRepudiation));
        assert!(!ku.0.contains(KeyUsages::KeyCertSign));
        assert_eq!(ku.to_xcn_flags(), 0xf0);
    }

    #[test]
    fn test_xcn_flags_ignore_unknown_bits() {
        let ku = KeyUsage::from_xcn_flags(0x80 | 0x100);
        assert_eq!(ku.0, FlagSet::from(KeyUsages::DigitalSignature));
    }

    #[test]
    fn test_extended_key_usage_defaults_to_client_auth() {
        let eku = ExtendedKeyUsage::from_dotted::<&str>(&[]).unwrap();
        assert_eq!(eku.usage, vec![const_oid::db::rfc5912::ID_KP_CLIENT_AUTH]);
        assert_eq!(eku.usage[0].to_string(), "1.3.6.1.5.5.7.3.2");
    }

    #[test]
    fn test_extended_key_usage_rejects_garbage() {
        assert!(ExtendedKeyUsage::from_dotted(&["not-an-oid"]).is_err());
    }

    #[test]
    fn test_subject_alt_name_other_names() {
        let original = SubjectAltName {
            other_names: vec![
                (parse_oid("1.2.643.100.3").unwrap(), "12345678901".to_string()),
                (parse_oid("1.2.643.3.131.1.1").unwrap(), "Иванов".to_string()),
            ],
        };
        let encoded = original.to_x509_extension_value().unwrap();
        let decoded = SubjectAltName::from_x509_extension_value(&encoded).unwrap();
        assert_eq!(original, decoded);
    }
}
