//! Root CA management and SNI-driven leaf resolution for TLS interception.

pub mod signer;
pub mod store;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pkcs8::ObjectIdentifier;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::error::AppError;
pub use store::CertStore;

const CA_CERT_FILENAME: &str = "chameleon-ca.crt";
const CA_KEY_FILENAME: &str = "chameleon-ca.key";
const EXPORT_FILENAME: &str = "chameleon.pem";

const OID_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaKeyKind {
    Rsa,
    EcdsaP256,
    Ed25519,
}

/// The process-wide certificate authority: the root certificate plus the
/// signing key used to derive per-hostname leaves.
pub struct CertAuthority {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
    key_kind: CaKeyKind,
    issuer: Issuer<'static, KeyPair>,
}

impl CertAuthority {
    /// Ensure the CA exists under the data directory, generating it on first
    /// run, then load it.
    pub fn ensure(data_dir: &Path) -> Result<Self, AppError> {
        let cert_path = data_dir.join(CA_CERT_FILENAME);
        let key_path = data_dir.join(CA_KEY_FILENAME);

        if !cert_path.exists() || !key_path.exists() {
            Self::generate(data_dir)?;
        }
        Self::load(&cert_path, &key_path)
    }

    /// Generate a fresh root CA (ECDSA P-256) and persist it as PEM files.
    fn generate(data_dir: &Path) -> Result<(), AppError> {
        fs::create_dir_all(data_dir)?;

        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "Chameleon Root CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Chameleon untrusted MITM proxy Inc");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params.self_signed(&key_pair)?;

        fs::write(data_dir.join(CA_CERT_FILENAME), cert.pem())?;
        fs::write(data_dir.join(CA_KEY_FILENAME), key_pair.serialize_pem())?;

        log::info!(
            "generated root CA at {}",
            data_dir.join(CA_CERT_FILENAME).display()
        );
        Ok(())
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, AppError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem)?;
        let key_der = key_pair.serialize_der();
        let key_kind = detect_key_kind(&key_der)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| AppError::Certificate("CA certificate PEM is empty".into()))?
            .map_err(|e| AppError::Certificate(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;

        Ok(Self {
            cert_pem,
            cert_der,
            key_der,
            key_kind,
            issuer,
        })
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn key_kind(&self) -> CaKeyKind {
        self.key_kind
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Write the root certificate to `<data>/chameleon.pem` for the user to
    /// install in their trust store.
    pub fn export_pem(&self, data_dir: &Path) -> Result<PathBuf, AppError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(EXPORT_FILENAME);
        fs::write(&path, &self.cert_pem)?;
        Ok(path)
    }
}

impl fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertAuthority")
            .field("key_kind", &self.key_kind)
            .finish()
    }
}

/// Identify the CA key algorithm from its PKCS#8 encoding. Anything other
/// than RSA, ECDSA P-256 or Ed25519 is rejected.
fn detect_key_kind(key_der: &[u8]) -> Result<CaKeyKind, AppError> {
    let info = pkcs8::PrivateKeyInfo::try_from(key_der)
        .map_err(|e| AppError::Certificate(e.to_string()))?;

    let oid = info.algorithm.oid;
    if oid == OID_RSA {
        Ok(CaKeyKind::Rsa)
    } else if oid == OID_ED25519 {
        Ok(CaKeyKind::Ed25519)
    } else if oid == OID_EC {
        match info.algorithm.parameters_oid() {
            Ok(curve) if curve == OID_P256 => Ok(CaKeyKind::EcdsaP256),
            _ => Err(AppError::UnsupportedKeyType("non-P-256 EC key".into())),
        }
    } else {
        Err(AppError::UnsupportedKeyType(oid.to_string()))
    }
}

/// rustls certificate resolver that signs leaves on demand, keyed by SNI.
#[derive(Debug)]
pub struct SniCertResolver {
    authority: Arc<CertAuthority>,
    store: Arc<CertStore>,
}

impl SniCertResolver {
    pub fn new(authority: Arc<CertAuthority>, store: Arc<CertStore>) -> Self {
        Self { authority, store }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_string();
        log::debug!("[tls] resolving leaf for sni={}", name);
        match self
            .store
            .fetch(&name, || signer::sign_host(&self.authority, &[name.clone()]))
        {
            Ok(cert) => Some(cert),
            Err(e) => {
                log::warn!("[tls] leaf signing failed sni={} err={}", name, e);
                None
            }
        }
    }
}

/// Build the shared TLS server config used by both proxy modes. The crypto
/// provider is pinned explicitly since the HTTP client links its own.
pub fn server_config(
    authority: Arc<CertAuthority>,
    store: Arc<CertStore>,
) -> Result<Arc<ServerConfig>, AppError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::Certificate(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(authority, store)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Trust-store installation seam. The core only shells out to the platform
/// tool; failures surface as `TrustStoreInstallFailed`.
pub mod installer {
    use super::*;
    use std::process::Command;

    #[cfg(target_os = "macos")]
    pub fn install(pem_path: &Path) -> Result<(), AppError> {
        run(Command::new("security").args([
            "add-trusted-cert",
            "-d",
            "-r",
            "trustRoot",
            "-k",
            "/Library/Keychains/System.keychain",
            &pem_path.display().to_string(),
        ]))
    }

    #[cfg(target_os = "macos")]
    pub fn uninstall() -> Result<(), AppError> {
        run(Command::new("security").args(["delete-certificate", "-c", "Chameleon Root CA"]))
    }

    #[cfg(target_os = "windows")]
    pub fn install(pem_path: &Path) -> Result<(), AppError> {
        run(Command::new("certutil").args([
            "-addstore",
            "root",
            &pem_path.display().to_string(),
        ]))
    }

    #[cfg(target_os = "windows")]
    pub fn uninstall() -> Result<(), AppError> {
        run(Command::new("certutil").args(["-delstore", "root", "Chameleon Root CA"]))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    pub fn install(pem_path: &Path) -> Result<(), AppError> {
        let target = Path::new("/usr/local/share/ca-certificates/chameleon.crt");
        fs::copy(pem_path, target)
            .map_err(|e| AppError::TrustStoreInstallFailed(e.to_string()))?;
        run(&mut Command::new("update-ca-certificates"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    pub fn uninstall() -> Result<(), AppError> {
        let target = Path::new("/usr/local/share/ca-certificates/chameleon.crt");
        if target.exists() {
            fs::remove_file(target)
                .map_err(|e| AppError::TrustStoreInstallFailed(e.to_string()))?;
        }
        run(&mut Command::new("update-ca-certificates"))
    }

    fn run(command: &mut Command) -> Result<(), AppError> {
        let status = command
            .status()
            .map_err(|e| AppError::TrustStoreInstallFailed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(AppError::TrustStoreInstallFailed(format!(
                "command exited with {}",
                status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_generates_then_reloads() {
        let dir = TempDir::new().unwrap();

        let ca = CertAuthority::ensure(dir.path()).unwrap();
        assert_eq!(ca.key_kind(), CaKeyKind::EcdsaP256);
        assert!(dir.path().join(CA_CERT_FILENAME).exists());
        assert!(dir.path().join(CA_KEY_FILENAME).exists());

        // Second call loads the same CA; key bytes must match.
        let again = CertAuthority::ensure(dir.path()).unwrap();
        assert_eq!(ca.key_der(), again.key_der());
        assert_eq!(ca.cert_der(), again.cert_der());
    }

    #[test]
    fn export_writes_pem() {
        let dir = TempDir::new().unwrap();
        let ca = CertAuthority::ensure(dir.path()).unwrap();
        let path = ca.export_pem(dir.path()).unwrap();
        assert!(path.ends_with("chameleon.pem"));
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn generated_ca_key_kind_is_detected() {
        let dir = TempDir::new().unwrap();
        let ca = CertAuthority::ensure(dir.path()).unwrap();
        assert!(matches!(
            detect_key_kind(ca.key_der()),
            Ok(CaKeyKind::EcdsaP256)
        ));
    }
}
