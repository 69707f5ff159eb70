//! Verification of a Git server certificate against a custom CA bundle

use x509_parser::prelude::*;

/// Parsed set of trusted CA certificates (DER)
#[derive(Clone, Debug)]
pub struct CaBundle {
    certificates: Vec<Vec<u8>>,
}

impl CaBundle {
    /// Parse every `CERTIFICATE` block of a PEM bundle
    ///
    /// Fails when the bundle holds no certificate or a block is not X.509.
    pub fn from_pem(bundle: &[u8]) -> Result<Self, String> {
        let blocks = ::pem::parse_many(bundle).map_err(|e| format!("invalid PEM bundle: {}", e))?;
        let mut certificates = Vec::new();
        for block in blocks.iter().filter(|b| b.tag() == "CERTIFICATE") {
            X509Certificate::from_der(block.contents())
                .map_err(|e| format!("invalid certificate in CA bundle: {}", e))?;
            certificates.push(block.contents().to_vec());
        }
        if certificates.is_empty() {
            return Err("the CA bundle contains no certificate".to_string());
        }
        Ok(Self { certificates })
    }

    /// Number of trusted certificates
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Whether the bundle is empty (never true for a parsed bundle)
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Check that `leaf_der` is currently valid and signed by (or is) a bundle certificate
    pub fn verify(&self, leaf_der: &[u8]) -> Result<(), String> {
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| format!("failed to parse server certificate: {}", e))?;
        if !leaf.validity().is_valid() {
            return Err("server certificate is expired or not yet valid".to_string());
        }

        for der in &self.certificates {
            if der.as_slice() == leaf_der {
                return Ok(());
            }
            let Ok((_, ca)) = X509Certificate::from_der(der) else {
                continue;
            };
            if leaf.issuer() != ca.subject() {
                continue;
            }
            if leaf.verify_signature(Some(ca.public_key())).is_ok() {
                return Ok(());
            }
        }
        Err("server certificate is not signed by the configured CA bundle".to_string())
    }
}
