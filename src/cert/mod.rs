pub mod extensions;
pub mod params;

use base64::prelude::*;
use der::{Decode, Encode};
use sha1::{Digest, Sha1};
use x509_cert::certificate::CertificateInner;

use crate::error::EnrollKitError;
pub type Result<T> = std::result::Result<T, EnrollKitError>;

/// Removes PEM header and footer lines, leaving the base64 body untouched.
///
/// CA web enrollment pages answer with `\r\n` line endings; plain `\n` is
/// handled the same way.
pub fn strip_pem_framing(data: &str) -> String {
    data.split_inclusive('\n')
        .filter(|line| {
            let line = line.trim_start();
            !(line.starts_with("-----BEGIN ") || line.starts_with("-----END "))
        })
        .collect()
}

/// Decodes a base64 certificate body, with or without PEM framing, into DER.
pub fn decode_base64_certificate(data: &str) -> Result<Vec<u8>> {
    let body: String = strip_pem_framing(data)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if body.is_empty() {
        return Err(EnrollKitError::DecodingError(
            "empty certificate body".to_string(),
        ));
    }
    Ok(BASE64_STANDARD.decode(body)?)
}

/// SHA-1 digest of DER bytes as 40 lower-case hex characters.
pub fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha1::digest(der))
}

/// Thumbprint of a base64 (optionally PEM framed) certificate.
pub fn thumbprint_from_base64(data: &str) -> Result<String> {
    Ok(thumbprint(&decode_base64_certificate(data)?))
}

/// Represents an X.509 certificate.
///
/// Wraps the decoded structure of a certificate returned by the CA.
#[derive(Debug, Clone)]
pub struct Certificate {
    /// The inner representation of the certificate.
    pub inner: CertificateInner,
}

impl Certificate {
    /// Parses a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: CertificateInner::from_der(der)?,
        })
    }

    /// Parses a base64 body as returned by the CA.
    pub fn from_base64(data: &str) -> Result<Self> {
        Self::from_der(&decode_base64_certificate(data)?)
    }

    /// Encodes the certificate into DER format.
    ///
    /// # Returns
    /// A byte vector containing the DER-encoded certificate.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner
            .to_der()
            .map_err(|e| EnrollKitError::EncodingError(e.to_string()))
    }

    /// DER of the SubjectPublicKeyInfo, used to pair a certificate with its key.
    pub fn subject_public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.inner.tbs_certificate.subject_public_key_info.to_der()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_crlf_framing() {
        let framed = "-----BEGIN CERTIFICATE-----\r\nAAEC\r\nAwQ=\r\n-----END CERTIFICATE-----\r\n";
        assert_eq!(strip_pem_framing(framed), "AAEC\r\nAwQ=\r\n");
        assert_eq!(decode_base64_certificate(framed).unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unframed_body_passes_through() {
        assert_eq!(decode_base64_certificate("AAECAwQ=").unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn pem_wrap_then_strip_is_lossless() {
        let der: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        assert_eq!(decode_base64_certificate(&pem).unwrap(), der);
    }

    #[test]
    fn thumbprint_is_lower_hex_and_stable() {
        let first = thumbprint(b"certificate bytes");
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(first, thumbprint(b"certificate bytes"));
        assert_eq!(thumbprint(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn empty_body_is_an_error() {
        let framed = "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n";
        assert!(decode_base64_certificate(framed).is_err());
    }
}
