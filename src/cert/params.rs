use std::fmt;

use const_oid::ObjectIdentifier;
use der::Tag;
use der::asn1::{Any, Ia5StringRef, PrintableStringRef, SetOfVec};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{RdnSequence, RelativeDistinguishedName};

use super::extensions::{ToAndFromX509Extension, parse_oid};
use crate::error::EnrollKitError;

/// Short attribute names understood in X.500 name strings, first entry per OID
/// is the canonical spelling.
const ATTRIBUTE_NAMES: [(&str, &str); 15] = [
    ("CN", "2.5.4.3"),
    ("SN", "2.5.4.4"),
    ("SERIALNUMBER", "2.5.4.5"),
    ("C", "2.5.4.6"),
    ("L", "2.5.4.7"),
    ("S", "2.5.4.8"),
    ("ST", "2.5.4.8"),
    ("STREET", "2.5.4.9"),
    ("O", "2.5.4.10"),
    ("OU", "2.5.4.11"),
    ("T", "2.5.4.12"),
    ("TITLE", "2.5.4.12"),
    ("G", "2.5.4.42"),
    ("I", "2.5.4.43"),
    ("E", "1.2.840.113549.1.9.1"),
];

fn attribute_oid(name: &str) -> Result<ObjectIdentifier, EnrollKitError> {
    let upper = name.trim().to_ascii_uppercase();
    match ATTRIBUTE_NAMES.iter().find(|(short, _)| *short == upper) {
        Some((_, oid)) => parse_oid(oid),
        None => parse_oid(name)
            .map_err(|_| EnrollKitError::InvalidInput(format!("unknown DN attribute '{name}'"))),
    }
}

fn attribute_name(oid: &ObjectIdentifier) -> String {
    let dotted = oid.to_string();
    ATTRIBUTE_NAMES
        .iter()
        .find(|(_, value)| *value == dotted)
        .map(|(short, _)| short.to_string())
        .unwrap_or(dotted)
}

fn invalid_value(key: &str, value: &str, err: der::Error) -> EnrollKitError {
    EnrollKitError::InvalidInput(format!("{key}=\"{value}\": {err}"))
}

/// Converts the domain of an e-mail address to its punycode form so the
/// address fits an IA5String. The local part is left as is.
fn email_to_ascii(address: &str) -> Result<String, EnrollKitError> {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return Ok(address.to_string());
    };
    let domain = idna::domain_to_ascii(domain).map_err(|e| {
        EnrollKitError::InvalidInput(format!("E=\"{address}\": bad domain: {e}"))
    })?;
    Ok(format!("{local}@{domain}"))
}

/// Subject distinguished name as an ordered multimap of attribute type to value.
///
/// Attribute order is kept exactly as supplied, duplicates included, so the
/// encoded subject matches what the batch file lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    attributes: Vec<(String, String)>,
}

impl DistinguishedName {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an attribute, keeping earlier values of the same type.
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((attribute.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Renders the name in CertEnroll's X.500 string form: every value is
    /// quoted with embedded `"` doubled, pairs are joined by `;`.
    pub fn to_x500_string(&self) -> String {
        self.attributes
            .iter()
            .map(|(key, value)| format!("{key}=\"{}\"", value.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parses the form produced by [`DistinguishedName::to_x500_string`].
    /// Unquoted values are accepted and trimmed.
    pub fn from_x500_string(input: &str) -> Result<Self, EnrollKitError> {
        let mut attributes = Vec::new();
        let mut chars = input.chars().peekable();

        loop {
            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '=' {
                    break;
                }
                key.push(c);
            }
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(EnrollKitError::InvalidInput(format!(
                    "missing attribute type in '{input}'"
                )));
            }

            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            value.push('"');
                        }
                        Some('"') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(EnrollKitError::InvalidInput(format!(
                                "unterminated quoted value in '{input}'"
                            )));
                        }
                    }
                }
                while chars.peek().is_some_and(|c| *c != ';') {
                    chars.next();
                }
            } else {
                while let Some(c) = chars.peek() {
                    if *c == ';' {
                        break;
                    }
                    value.push(*c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
            attributes.push((key, value));

            match chars.next() {
                Some(';') => continue,
                _ => break,
            }
        }

        Ok(Self { attributes })
    }

    /// Converts to an X.509 name, one RDN per attribute in list order.
    pub fn to_x509_name(&self) -> Result<x509_cert::name::Name, EnrollKitError> {
        let rdns = self
            .attributes
            .iter()
            .map(|(key, value)| {
                let oid = attribute_oid(key)?;
                let value = match attribute_name(&oid).as_str() {
                    "C" => Any::encode_from(
                        &PrintableStringRef::new(value).map_err(|e| invalid_value(key, value, e))?,
                    )?,
                    "E" => {
                        let ascii = email_to_ascii(value)?;
                        Any::encode_from(
                            &Ia5StringRef::new(&ascii).map_err(|e| invalid_value(key, value, e))?,
                        )?
                    }
                    _ => Any::new(Tag::Utf8String, value.as_bytes())?,
                };
                let atv = AttributeTypeAndValue { oid, value };
                Ok(RelativeDistinguishedName(SetOfVec::try_from(vec![atv])?))
            })
            .collect::<Result<Vec<_>, EnrollKitError>>()?;
        Ok(RdnSequence(rdns))
    }

    /// Reads a decoded X.509 name back, naming known attribute types by their
    /// short form and everything else by dotted OID.
    pub fn from_x509_name(name: &x509_cert::name::Name) -> Result<Self, EnrollKitError> {
        let mut attributes = Vec::new();
        for rdn in name.0.iter() {
            for atv in rdn.0.iter() {
                let value = std::str::from_utf8(atv.value.value())
                    .map_err(|e| EnrollKitError::DecodingError(e.to_string()))?;
                attributes.push((attribute_name(&atv.oid), value.to_string()));
            }
        }
        Ok(Self { attributes })
    }
}

impl Serialize for DistinguishedName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.attributes.len()))?;
        for (key, value) in &self.attributes {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DistinguishedName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DnVisitor;

        impl<'de> Visitor<'de> for DnVisitor {
            type Value = DistinguishedName;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of DN attribute types to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut attributes = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    attributes.push((key, value));
                }
                Ok(DistinguishedName { attributes })
            }
        }

        deserializer.deserialize_map(DnVisitor)
    }
}

/// Represents an X.509 extension.
///
/// This struct contains the OID, criticality, and value of an extension.
///
/// # Fields
/// * `oid` - The object identifier of the extension.
/// * `critical` - Indicates if the extension is critical.
/// * `value` - The DER-encoded value of the extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionParam {
    pub oid: ObjectIdentifier,
    pub critical: bool,
    /// DER-encoded extension value
    pub value: Vec<u8>,
}

impl ExtensionParam {
    /// Creates an `ExtensionParam` from a specific extension.
    ///
    /// # Arguments
    /// * `extension` - The extension to encode.
    /// * `critical` - Indicates if the extension is critical.
    pub fn from_extension<E: ToAndFromX509Extension>(
        extension: &E,
        critical: bool,
    ) -> Result<Self, EnrollKitError> {
        Ok(Self {
            oid: E::OID,
            critical,
            value: extension.to_x509_extension_value()?,
        })
    }

    /// Decodes an `ExtensionParam` into a specific extension.
    pub fn to_extension<E: ToAndFromX509Extension>(&self) -> Result<E, EnrollKitError> {
        E::from_x509_extension_value(&self.value)
    }

    /// Converts into the `x509_cert` representation.
    pub fn to_x509(&self) -> Result<x509_cert::ext::Extension, EnrollKitError> {
        Ok(x509_cert::ext::Extension {
            extn_id: self.oid,
            critical: self.critical,
            extn_value: der::asn1::OctetString::new(self.value.clone())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_embedded_quotes() {
        let dn = DistinguishedName::new()
            .with("CN", "ООО \"Ромашка\"")
            .with("O", "plain");
        assert_eq!(dn.to_x500_string(), "CN=\"ООО \"\"Ромашка\"\"\";O=\"plain\"");
    }

    #[test]
    fn parses_what_it_renders() {
        let dn = DistinguishedName::new()
            .with("CN", "a;b \"c\"")
            .with("OU", "x")
            .with("OU", "y")
            .with("1.2.643.100.1", "1027700132195");
        let parsed = DistinguishedName::from_x500_string(&dn.to_x500_string()).unwrap();
        assert_eq!(parsed, dn);
    }

    #[test]
    fn parses_unquoted_values() {
        let parsed = DistinguishedName::from_x500_string("CN= host ; C=RU").unwrap();
        assert_eq!(parsed, DistinguishedName::new().with("CN", "host").with("C", "RU"));
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(DistinguishedName::from_x500_string("CN=\"open").is_err());
    }

    #[test]
    fn x509_name_round_trip_keeps_order() {
        let dn = DistinguishedName::new()
            .with("C", "RU")
            .with("CN", "Test \"quoted\"")
            .with("E", "user@example.com");
        let name = dn.to_x509_name().unwrap();
        assert_eq!(DistinguishedName::from_x509_name(&name).unwrap(), dn);
    }

    #[test]
    fn email_domain_is_punycoded() {
        let dn = DistinguishedName::new().with("E", "user@пример.рф");
        let name = dn.to_x509_name().unwrap();
        let atv = name.0[0].0.iter().next().unwrap();
        let value = Ia5StringRef::try_from(&atv.value).unwrap();
        assert!(value.as_str().starts_with("user@xn--"));
        assert!(value.as_str().ends_with(".xn--p1ai"));
    }

    #[test]
    fn values_outside_the_string_type_are_rejected() {
        let country = DistinguishedName::new().with("C", "R&U");
        assert!(matches!(
            country.to_x509_name(),
            Err(EnrollKitError::InvalidInput(_))
        ));
        let mailbox = DistinguishedName::new().with("E", "пользователь@example.com");
        assert!(matches!(
            mailbox.to_x509_name(),
            Err(EnrollKitError::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let dn = DistinguishedName::new().with("FOO", "bar");
        assert!(dn.to_x509_name().is_err());
    }

    #[test]
    fn json_keeps_document_order() {
        let dn: DistinguishedName =
            serde_json::from_str(r#"{"O": "org", "CN": "name", "C": "RU"}"#).unwrap();
        let keys: Vec<_> = dn.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["O", "CN", "C"]);
    }
}
