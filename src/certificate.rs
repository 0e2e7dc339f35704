//! Certificate material: CSR for new orders, parsing issued chains, self-signed placeholders
use chrono::{DateTime, Utc};

use crate::resource::{Certificate, ResourceId};
use crate::Error;

/// Fresh key pair plus a PKCS#10 request for a single domain
pub struct CertificateRequest {
    key_pair_pem: String,
    der_bytes: Vec<u8>,
}

impl CertificateRequest {
    pub fn for_domain(domain: &str) -> Result<Self, Error> {
        let key_pair = rcgen::KeyPair::generate()?;
        let params = Self::params(domain)?;
        let csr = params.serialize_request(&key_pair)?;

        Ok(Self {
            key_pair_pem: key_pair.serialize_pem(),
            der_bytes: csr.der().to_vec(),
        })
    }

    fn params(domain: &str) -> Result<rcgen::CertificateParams, Error> {
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])?;
        let mut name = rcgen::DistinguishedName::new();
        name.push(rcgen::DnType::CommonName, domain);
        params.distinguished_name = name;
        Ok(params)
    }

    pub fn der_bytes(&self) -> &[u8] {
        self.der_bytes.as_slice()
    }

    pub fn key_pair_pem(&self) -> &str {
        self.key_pair_pem.as_str()
    }
}

/// Certificate chain as returned by the ACME server, leaf first
pub struct IssuedCertificate {
    crt_pem: Vec<x509_parser::pem::Pem>,
}

impl IssuedCertificate {
    pub fn from_pem_chain(pem_chain: &str) -> Result<Self, Error> {
        let crt_pem = x509_parser::pem::Pem::iter_from_buffer(pem_chain.as_bytes())
            .collect::<Result<Vec<_>, x509_parser::error::PEMError>>()
            .map_err(|e| Error::CertificateParse(e.to_string()))?;

        if crt_pem.is_empty() {
            return Err(Error::CertificateParse("no certificate in PEM".to_string()));
        }

        Ok(Self { crt_pem })
    }

    pub fn server_certificate_pem(&self) -> String {
        Self::to_pem_string(&self.crt_pem[0])
    }

    /// Everything after the leaf, may be empty
    pub fn issuer_chain_pem(&self) -> String {
        self.crt_pem[1..]
            .iter()
            .map(Self::to_pem_string)
            .collect::<Vec<_>>()
            .concat()
    }

    /// Build the certificate resource stored under `id`
    pub fn into_certificate(
        self,
        id: ResourceId,
        private_key_pem: &str,
    ) -> Result<Certificate, Error> {
        let leaf = LeafDetails::parse(&self.crt_pem[0].contents)?;

        Ok(Certificate {
            id,
            domain_names: leaf.domain_names,
            not_before: leaf.not_before,
            not_after: leaf.not_after,
            certificate_pem: self.server_certificate_pem(),
            chain_pem: self.issuer_chain_pem(),
            private_key_pem: private_key_pem.to_string(),
            thumbprint: thumbprint(&self.crt_pem[0].contents),
            managed: true,
            meta: Default::default(),
        })
    }

    fn to_pem_string(pem: &x509_parser::pem::Pem) -> String {
        use base64::engine::Engine;

        // Base64 encode with 64char line wrap
        let b64content = pem
            .contents
            .chunks(48)
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
            .collect::<Vec<String>>()
            .join("\n");

        format!(
            "-----BEGIN {}-----\n{}\n-----END {}-----\n",
            pem.label, b64content, pem.label
        )
    }
}

struct LeafDetails {
    domain_names: Vec<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl LeafDetails {
    fn parse(der_bytes: &[u8]) -> Result<Self, Error> {
        use x509_parser::extensions::{GeneralName, ParsedExtension};
        use x509_parser::prelude::FromDer;

        let (_rem, crt) = x509_parser::certificate::X509Certificate::from_der(der_bytes)
            .map_err(|e| Error::CertificateParse(e.to_string()))?;

        // Common name first, then the SubjectAltName DNS entries
        let mut domain_names = Vec::<String>::new();
        if let Some(cn) = crt.subject().iter_common_name().next() {
            let cn = cn
                .as_str()
                .map_err(|e| Error::CertificateParse(e.to_string()))?;
            domain_names.push(cn.to_ascii_lowercase());
        }
        for ext in crt.extensions() {
            if let ParsedExtension::SubjectAlternativeName(alt_name_ext) = ext.parsed_extension() {
                for alt_name in &alt_name_ext.general_names {
                    if let GeneralName::DNSName(dns_name) = alt_name {
                        let dns_name = dns_name.to_ascii_lowercase();
                        if !domain_names.contains(&dns_name) {
                            domain_names.push(dns_name);
                        }
                    }
                }
            }
        }
        if domain_names.is_empty() {
            return Err(Error::CertificateParse(
                "certificate names no domain".to_string(),
            ));
        }

        let validity = crt.validity();
        Ok(Self {
            domain_names,
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::CertificateParse(format!("invalid timestamp {}", secs)))
}

/// Uppercase hex SHA-256 of the DER encoding
pub fn thumbprint(der_bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    Sha256::digest(der_bytes)
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect()
}

/// Self-signed certificate for `domain`, returns (certificate PEM, key PEM)
pub fn self_signed(domain: &str, valid_for: chrono::Duration) -> Result<(String, String), Error> {
    let key_pair = rcgen::KeyPair::generate()?;
    let mut params = CertificateRequest::params(domain)?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::seconds(valid_for.num_seconds());

    let crt = params.self_signed(&key_pair)?;
    Ok((crt.pem(), key_pair.serialize_pem()))
}

/// Stand-in material for a freshly managed domain until the first real issuance
pub fn placeholder(domain: &str) -> Result<Certificate, Error> {
    let (crt_pem, key_pem) = self_signed(domain, chrono::Duration::days(1))?;
    IssuedCertificate::from_pem_chain(&crt_pem)?.into_certificate(ResourceId::generate(), &key_pem)
}
