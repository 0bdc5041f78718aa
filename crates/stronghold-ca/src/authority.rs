//! Root CA load/generate and per-host leaf issuance (§3, §4.2).

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set permissions on {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("issued key is not a valid PKCS#8 private key: {0:?}")]
    InvalidKeyDer(rustls_pki_types::pem::Error),
}

/// The leaf certificate returned to the MITM engine for a TLS accept.
pub struct LeafCertificate {
    pub host: String,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

/// The root certificate authority (§3): loaded once at startup, read-only thereafter.
pub struct RootCa {
    cert: rcgen::Certificate,
    key_pair: KeyPair,
}

fn root_params() -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Stronghold Root CA");
    dn.push(DnType::OrganizationName, "Stronghold Security");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);
    Ok(params)
}

impl RootCa {
    /// Loads the root CA from `<ca_dir>/ca.crt` + `<ca_dir>/ca.key` if both exist,
    /// otherwise generates a fresh root and persists it with the documented file modes.
    pub fn load_or_generate(ca_dir: &Path) -> Result<Self, CaError> {
        let cert_path = ca_dir.join("ca.crt");
        let key_path = ca_dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        std::fs::create_dir_all(ca_dir).map_err(|source| CaError::Write {
            path: ca_dir.to_path_buf(),
            source,
        })?;

        let key_pair = KeyPair::generate()?;
        let params = root_params()?;
        let cert = params.self_signed(&key_pair)?;

        write_with_mode(&cert_path, cert.pem().as_bytes(), 0o644)?;
        write_with_mode(&key_path, key_pair.serialize_pem().as_bytes(), 0o600)?;

        tracing::info!(ca_dir = %ca_dir.display(), "generated fresh root CA");
        Ok(Self { cert, key_pair })
    }

    /// Loads an existing root CA. Accepts ECDSA (`EC PRIVATE KEY`), PKCS#1 RSA
    /// (`RSA PRIVATE KEY`), or PKCS#8-wrapped signers, as `rcgen::KeyPair::from_pem`
    /// auto-detects the PEM label.
    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let key_pem = std::fs::read_to_string(key_path).map_err(|source| CaError::Read {
            path: key_path.to_path_buf(),
            source,
        })?;
        // ca.crt is the trust anchor already installed in the OS store; we only need
        // the key material to re-derive a signer handle consistent with it.
        let _cert_pem = std::fs::read_to_string(cert_path).map_err(|source| CaError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;

        let key_pair = KeyPair::from_pem(&key_pem)?;
        let params = root_params()?;
        let cert = params.self_signed(&key_pair)?;

        tracing::info!(ca_dir = %cert_path.parent().unwrap_or(Path::new(".")).display(), "loaded root CA");
        Ok(Self { cert, key_pair })
    }

    /// Mints a fresh leaf certificate for `host`, signed by this root (§3, §4.2).
    pub fn issue_leaf(&self, host: &str) -> Result<LeafCertificate, CaError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(host.to_string().try_into()?)];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.cert, &self.key_pair)?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(CaError::InvalidKeyDer)?
            .clone_key();

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_chain: vec![cert_der],
            private_key: key_der,
        })
    }
}

fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> Result<(), CaError> {
    std::fs::write(path, bytes).map_err(|source| CaError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
            CaError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}
