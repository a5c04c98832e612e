// SPDX-License-Identifier: MIT OR Apache-2.0
//! Self-signed root CA and mTLS client certificate issuance for fleet enrollment.
//!
//! The root is a long-lived, self-signed certificate; each leaf is a short-lived
//! client-auth certificate bound to the enrolling agent's id, hostname, and IPs.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{Certificate, CertificateParams, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use time::{Duration as TimeDuration, OffsetDateTime};
use warden_error::{AsErrorCode, ErrorCode};

/// Generate an RSA key pair of `bits` size and hand it to `rcgen` as a PKCS#8 PEM; the
/// `x509-parser` feature lets `rcgen::KeyPair::from_pem` detect the RSA algorithm itself,
/// since `rcgen` cannot generate RSA keys on its own.
fn generate_rsa_keypair(bits: usize) -> Result<KeyPair, CaError> {
    let rsa_key =
        rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(|e| CaError::Generation(e.to_string()))?;
    let pkcs8_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CaError::Generation(e.to_string()))?;
    KeyPair::from_pem(&pkcs8_pem).map_err(|e| CaError::Generation(e.to_string()))
}

/// Errors arising from CA bootstrap or certificate issuance.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    /// Certificate/key generation failed.
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// An IP address in the issuance request could not be parsed.
    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    /// A hostname in the issuance request was not a valid DNS name.
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    /// Underlying I/O failure persisting the root CA.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AsErrorCode for CaError {
    fn code(&self) -> ErrorCode {
        match self {
            CaError::Io(_) | CaError::Generation(_) => ErrorCode::Fatal,
            CaError::InvalidIp(_) | CaError::InvalidHostname(_) => ErrorCode::InvalidConfig,
        }
    }
}

/// Configuration for CA bootstrap.
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Directory holding `ca.pem`/`ca.key`.
    pub data_dir: PathBuf,
    /// Root CA validity window, in days.
    pub validity_days: i64,
    /// Leaf certificate validity window, in days.
    pub leaf_validity_days: i64,
    /// RSA key size, in bits, for the root CA key. Leaf keys are always RSA-2048.
    pub key_size: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            validity_days: 365,
            leaf_validity_days: 365,
            key_size: 2048,
        }
    }
}

/// A request to issue a new client-auth leaf certificate.
#[derive(Debug, Clone)]
pub struct CertRequest {
    /// Common name of the leaf, set to the enrolling agent's id.
    pub agent_id: String,
    /// DNS SAN entry.
    pub hostname: String,
    /// IP address SAN entries.
    pub public_ips: Vec<String>,
}

/// A freshly issued leaf certificate plus its private key, both PEM-encoded.
#[derive(Debug, Clone)]
pub struct SignedCert {
    /// PEM-encoded leaf certificate.
    pub certificate_pem: String,
    /// PEM-encoded leaf private key.
    pub private_key_pem: String,
    /// Serial number of the issued certificate, formatted as hex.
    pub serial: String,
}

/// The fleet certificate authority: a self-signed root plus issuance.
pub struct Ca {
    cfg: CaConfig,
    root_cert: Certificate,
    root_keypair: KeyPair,
    root_cert_pem: String,
}

impl Ca {
    /// Load the root CA from `cfg.data_dir` if present, otherwise generate and persist
    /// a new one.
    pub fn load_or_generate(cfg: CaConfig) -> Result<Self, CaError> {
        let cert_path = cfg.data_dir.join("ca.pem");
        let key_path = cfg.data_dir.join("ca.key");
        if cert_path.exists() && key_path.exists() {
            Self::load(cfg, &cert_path, &key_path)
        } else {
            Self::generate(cfg)
        }
    }

    fn load(cfg: CaConfig, cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;
        let root_keypair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaError::Generation(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaError::Generation(e.to_string()))?;
        let root_cert = params
            .self_signed(&root_keypair)
            .map_err(|e| CaError::Generation(e.to_string()))?;
        Ok(Self {
            cfg,
            root_cert,
            root_keypair,
            root_cert_pem: cert_pem,
        })
    }

    fn generate(cfg: CaConfig) -> Result<Self, CaError> {
        fs::create_dir_all(&cfg.data_dir)?;
        let mut params = CertificateParams::new(vec!["Warden Fleet Root CA".to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Constrained(1));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + TimeDuration::days(cfg.validity_days);

        let root_keypair = generate_rsa_keypair(cfg.key_size)?;
        let root_cert = params
            .self_signed(&root_keypair)
            .map_err(|e| CaError::Generation(e.to_string()))?;
        let root_cert_pem = root_cert.pem();

        fs::write(cfg.data_dir.join("ca.pem"), &root_cert_pem)?;
        fs::write(cfg.data_dir.join("ca.key"), root_keypair.serialize_pem())?;
        set_private_permissions(&cfg.data_dir.join("ca.key"))?;

        Ok(Self {
            cfg,
            root_cert,
            root_keypair,
            root_cert_pem,
        })
    }

    /// PEM-encoded root CA certificate, served as the first element of the enrollment
    /// CA bundle.
    #[must_use]
    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// Issue a short-lived client-auth certificate for an enrolling agent.
    pub fn issue_certificate(&self, req: &CertRequest) -> Result<SignedCert, CaError> {
        let mut params = CertificateParams::new(vec![req.agent_id.clone()])
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let dns_name = Ia5String::try_from(req.hostname.clone())
            .map_err(|_| CaError::InvalidHostname(req.hostname.clone()))?;
        let mut sans = vec![SanType::DnsName(dns_name)];
        for ip in &req.public_ips {
            let parsed: IpAddr = ip.parse().map_err(|_| CaError::InvalidIp(ip.clone()))?;
            sans.push(SanType::IpAddress(parsed));
        }
        params.subject_alt_names = sans;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + TimeDuration::days(self.cfg.leaf_validity_days);

        let leaf_keypair = generate_rsa_keypair(2048)?;
        let leaf_cert = params
            .signed_by(&leaf_keypair, &self.root_cert, &self.root_keypair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let serial = leaf_cert
            .params()
            .serial_number
            .as_ref()
            .map(|s| hex::encode(s.to_bytes()))
            .unwrap_or_else(|| "0".to_string());

        Ok(SignedCert {
            certificate_pem: leaf_cert.pem(),
            private_key_pem: leaf_keypair.serialize_pem(),
            serial,
        })
    }

    /// Issue a server-auth leaf certificate for the master's own control-plane TLS
    /// listener, chained to this root so an enrolled agent's CA bundle already trusts it.
    pub fn issue_server_certificate(&self, hostnames: &[String], ips: &[IpAddr]) -> Result<SignedCert, CaError> {
        let cn = hostnames.first().cloned().unwrap_or_else(|| "warden-master".to_string());
        let mut params = CertificateParams::new(vec![cn]).map_err(|e| CaError::Generation(e.to_string()))?;

        let mut sans = Vec::new();
        for hostname in hostnames {
            let dns_name =
                Ia5String::try_from(hostname.clone()).map_err(|_| CaError::InvalidHostname(hostname.clone()))?;
            sans.push(SanType::DnsName(dns_name));
        }
        for ip in ips {
            sans.push(SanType::IpAddress(*ip));
        }
        params.subject_alt_names = sans;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + TimeDuration::days(self.cfg.leaf_validity_days);

        let leaf_keypair = generate_rsa_keypair(2048)?;
        let leaf_cert = params
            .signed_by(&leaf_keypair, &self.root_cert, &self.root_keypair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let serial = leaf_cert
            .params()
            .serial_number
            .as_ref()
            .map(|s| hex::encode(s.to_bytes()))
            .unwrap_or_else(|| "0".to_string());

        Ok(SignedCert {
            certificate_pem: leaf_cert.pem(),
            private_key_pem: leaf_keypair.serialize_pem(),
            serial,
        })
    }
}

/// The enrollment CA bundle: root CA cert followed by the module signing public key,
/// so a single file anchors both the mTLS chain and catalog signature trust.
#[must_use]
pub fn build_ca_bundle(root_cert_pem: &str, module_signing_pub_pem: &str) -> String {
    format!("{root_cert_pem}\n{module_signing_pub_pem}")
}

#[cfg(unix)]
fn set_private_permissions(path: &Path) -> Result<(), CaError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private_permissions(_path: &Path) -> Result<(), CaError> {
    Ok(())
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_root_ca_and_persists_it() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ca = Ca::load_or_generate(cfg).unwrap();
        assert!(ca.root_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(dir.path().join("ca.pem").exists());
        assert!(dir.path().join("ca.key").exists());
    }

    #[test]
    fn reloading_an_existing_ca_does_not_regenerate() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let first = Ca::load_or_generate(cfg.clone()).unwrap();
        let second = Ca::load_or_generate(cfg).unwrap();
        assert_eq!(first.root_cert_pem(), second.root_cert_pem());
    }

    #[test]
    fn issues_a_leaf_bound_to_agent_id_and_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ca = Ca::load_or_generate(cfg).unwrap();
        let signed = ca
            .issue_certificate(&CertRequest {
                agent_id: "sat-abc123".into(),
                hostname: "honeypot-1".into(),
                public_ips: vec!["10.0.0.5".into()],
            })
            .unwrap();
        assert!(signed.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(signed.private_key_pem.contains("BEGIN"));
        assert!(!signed.serial.is_empty());
    }

    #[test]
    fn rejects_invalid_ip_in_issuance_request() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ca = Ca::load_or_generate(cfg).unwrap();
        let err = ca
            .issue_certificate(&CertRequest {
                agent_id: "sat-1".into(),
                hostname: "h".into(),
                public_ips: vec!["not-an-ip".into()],
            })
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidIp(_)));
    }

    #[test]
    fn bundle_concatenates_root_and_signing_key() {
        let bundle = build_ca_bundle("ROOT", "SIGNING-PUB");
        assert!(bundle.contains("ROOT"));
        assert!(bundle.contains("SIGNING-PUB"));
    }
}
