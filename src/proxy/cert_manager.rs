use anyhow::{anyhow, Context};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const CERT_FILE_NAME: &str = "apinox-proxy.cer";
const KEY_FILE_NAME: &str = "apinox-proxy.key";
const RSA_KEY_BITS: usize = 2048;
const CERT_MARKER: &str = "BEGIN CERTIFICATE";
const KEY_MARKER: &str = "BEGIN RSA PRIVATE KEY";

/// PEM-encoded key and certificate used by the HTTPS listener.
#[derive(Clone)]
pub struct CertificatePair {
    pub key_pem: String,
    pub cert_pem: String,
}

impl std::fmt::Debug for CertificatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificatePair")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificatePair {
    /// Decode into the DER forms rustls expects.
    pub fn to_der(&self) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
                .collect::<Result<_, _>>()
                .context("Failed to parse certificate PEM")?;
        if certs.is_empty() {
            return Err(anyhow!("No certificate found in PEM"));
        }
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .context("Failed to parse private key PEM")?
            .ok_or_else(|| anyhow!("No private key found in PEM"))?;
        Ok((certs, key))
    }
}

/// Produces and caches the self-signed `localhost` certificate.
#[derive(Debug, Clone)]
pub struct CertManager {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl Default for CertManager {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl CertManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_path: dir.join(CERT_FILE_NAME),
            key_path: dir.join(KEY_FILE_NAME),
        }
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Reuse the cached pair when it is readable and still valid, otherwise
    /// generate, persist and verify a fresh one.
    pub fn ensure_cert(&self) -> anyhow::Result<CertificatePair> {
        if self.cert_path.exists() && self.key_path.exists() {
            match self.load_existing() {
                Ok(pair) => {
                    tracing::debug!("Reusing certificate at {}", self.cert_path.display());
                    return Ok(pair);
                }
                Err(err) => {
                    tracing::info!("Cached certificate unusable ({:#}), regenerating", err);
                }
            }
        }

        tracing::info!("Generating self-signed proxy certificate");
        let pair = Self::generate()?;

        if let Some(parent) = self.cert_path.parent() {
            fs::create_dir_all(parent).context("Failed to create certificate directory")?;
        }
        fs::write(&self.cert_path, &pair.cert_pem).context("Failed to write certificate")?;
        fs::write(&self.key_path, &pair.key_pem).context("Failed to write private key")?;

        let written_cert =
            fs::read_to_string(&self.cert_path).context("Failed to re-read certificate")?;
        let written_key =
            fs::read_to_string(&self.key_path).context("Failed to re-read private key")?;
        if !written_cert.contains(CERT_MARKER) || !written_key.contains(KEY_MARKER) {
            return Err(anyhow!("Saved certificate files are corrupted"));
        }

        tracing::info!("Wrote certificate to {}", self.cert_path.display());
        Ok(pair)
    }

    fn load_existing(&self) -> anyhow::Result<CertificatePair> {
        let cert_pem =
            fs::read_to_string(&self.cert_path).context("Failed to read certificate file")?;
        let key_pem = fs::read_to_string(&self.key_path).context("Failed to read key file")?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| anyhow!("Invalid certificate PEM: {}", e))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| anyhow!("Invalid certificate: {}", e))?;
        if !cert.validity().is_valid() {
            return Err(anyhow!("certificate is outside its validity window"));
        }

        let pair = CertificatePair { key_pem, cert_pem };
        pair.to_der()?;
        RsaPrivateKey::from_pkcs1_pem(&pair.key_pem)
            .map_err(|e| anyhow!("Invalid private key: {}", e))?;
        Ok(pair)
    }

    fn generate() -> anyhow::Result<CertificatePair> {
        let mut rng = rand::rngs::OsRng;
        let private_key =
            RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).context("Failed to generate RSA key")?;
        let pkcs8_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("Failed to encode RSA key")?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8_pem, &PKCS_RSA_SHA256)
            .context("Failed to load RSA key for signing")?;

        let mut params = CertificateParams::new(vec![
            "localhost".to_string(),
            "*.localhost".to_string(),
        ])
        .context("Invalid certificate subject names")?;
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "localhost");
        dn.push(DnType::OrganizationName, "APInox Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let now = OffsetDateTime::now_utc();
        let mut serial = vec![0x01];
        serial.extend_from_slice(&(now.unix_timestamp_nanos() as u64).to_be_bytes());
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = now;
        params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign certificate")?;
        let cert_pem = cert.pem();
        let key_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .context("Failed to encode RSA key")?
            .to_string();

        if !cert_pem.contains(CERT_MARKER) || !key_pem.contains(KEY_MARKER) {
            return Err(anyhow!("Generated PEM is invalid"));
        }
        Ok(CertificatePair { key_pem, cert_pem })
    }
}
