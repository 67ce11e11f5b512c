//! Dynamic leaf certificate signing for TLS interception.
//!
//! Leaf private keys are derived deterministically from the CA key and the
//! hostname set, so a client that trusted a generated leaf keeps trusting it
//! across process restarts.

use std::net::IpAddr;
use std::sync::Arc;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::Rng;
use rand_core::{CryptoRng, RngCore};
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey as _;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::certificate::{CaKeyKind, CertAuthority};
use crate::error::AppError;

const SIGNER_VERSION: &str = ":chameleon";

/// Deterministic byte stream: AES-128 in counter mode, keyed from the CA
/// private key and seeded from the sorted hostname set.
pub struct CounterRng {
    cipher: Aes128,
    counter: [u8; 16],
    block: [u8; 16],
    used: usize,
}

impl CounterRng {
    pub fn new(ca_key_der: &[u8], seed: [u8; 16]) -> Self {
        let digest = Sha256::digest(ca_key_der);
        let key = GenericArray::clone_from_slice(&digest[..16]);
        Self {
            cipher: Aes128::new(&key),
            counter: seed,
            block: [0u8; 16],
            used: 16,
        }
    }

    fn refill(&mut self) {
        let mut block = GenericArray::clone_from_slice(&self.counter);
        self.cipher.encrypt_block(&mut block);
        self.block.copy_from_slice(&block);
        for byte in self.counter.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        self.used = 0;
    }
}

impl RngCore for CounterRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            if self.used == self.block.len() {
                self.refill();
            }
            let n = (self.block.len() - self.used).min(dest.len() - offset);
            dest[offset..offset + n].copy_from_slice(&self.block[self.used..self.used + n]);
            self.used += n;
            offset += n;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for CounterRng {}

/// SHA-256 over the comma-joined, sorted input list, truncated to one AES block.
fn hash_sorted(items: &[String]) -> [u8; 16] {
    let mut sorted = items.to_vec();
    sorted.sort();
    let digest = Sha256::digest(sorted.join(",").as_bytes());
    let mut seed = [0u8; 16];
    seed.copy_from_slice(&digest[..16]);
    seed
}

/// Derive the leaf private key (PKCS#8 DER) for a hostname set.
///
/// The key type mirrors the CA key type. The same (CA key, host set) always
/// yields the same leaf key.
pub fn derive_leaf_key_der(ca: &CertAuthority, hosts: &[String]) -> Result<Vec<u8>, AppError> {
    let mut tagged: Vec<String> = hosts.to_vec();
    tagged.push(SIGNER_VERSION.to_string());
    let seed = hash_sorted(&tagged);
    let mut rng = CounterRng::new(ca.key_der(), seed);

    let doc = match ca.key_kind() {
        CaKeyKind::Rsa => rsa::RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| AppError::Certificate(e.to_string()))?
            .to_pkcs8_der()
            .map_err(|e| AppError::Certificate(e.to_string()))?,
        CaKeyKind::EcdsaP256 => {
            use p256::pkcs8::EncodePrivateKey as _;
            p256::ecdsa::SigningKey::random(&mut rng)
                .to_pkcs8_der()
                .map_err(|e| AppError::Certificate(e.to_string()))?
        }
        CaKeyKind::Ed25519 => {
            use ed25519_dalek::pkcs8::EncodePrivateKey as _;
            ed25519_dalek::SigningKey::generate(&mut rng)
                .to_pkcs8_der()
                .map_err(|e| AppError::Certificate(e.to_string()))?
        }
    };
    Ok(doc.as_bytes().to_vec())
}

/// Sign a leaf certificate for the given hostnames using the process CA.
///
/// Hostnames parsing as IP literals become IP SANs, the rest DNS SANs; the
/// subject CommonName is the last DNS hostname processed. The serial number
/// comes from a per-call PRNG independent of the deterministic key stream.
pub fn sign_host(ca: &CertAuthority, hosts: &[String]) -> Result<Arc<CertifiedKey>, AppError> {
    let mut hosts: Vec<String> = hosts.to_vec();
    hosts.sort();
    hosts.dedup();

    let leaf_key_der = derive_leaf_key_der(ca, &hosts)?;
    let key_pair = KeyPair::try_from(leaf_key_der.as_slice())?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Chameleon untrusted MITM proxy Inc");
    params
        .distinguished_name
        .push(DnType::OrganizationalUnitName, "Chameleon Proxy");

    let mut common_name = None;
    for host in &hosts {
        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            let name = Ia5String::try_from(host.as_str())
                .map_err(|e| AppError::Certificate(e.to_string()))?;
            params.subject_alt_names.push(SanType::DnsName(name));
            common_name = Some(host.clone());
        }
    }
    if let Some(name) = common_name {
        params.distinguished_name.push(DnType::CommonName, name);
    }

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(30);
    params.not_after = now + Duration::days(365);

    // Positive serial from a PRNG independent of the deterministic stream.
    let serial = rand::rng().random::<u64>() >> 1;
    params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.signed_by(&key_pair, ca.issuer())?;

    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key_der));
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| AppError::Certificate(e.to_string()))?;

    let chain = vec![cert.der().clone(), ca.cert_der().clone()];
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertAuthority;
    use tempfile::TempDir;

    fn test_ca() -> (TempDir, CertAuthority) {
        let dir = TempDir::new().unwrap();
        let ca = CertAuthority::ensure(dir.path()).unwrap();
        (dir, ca)
    }

    #[test]
    fn counter_stream_is_deterministic() {
        let mut a = CounterRng::new(b"ca-key-bytes", [7u8; 16]);
        let mut b = CounterRng::new(b"ca-key-bytes", [7u8; 16]);
        let mut buf_a = [0u8; 100];
        let mut buf_b = [0u8; 100];
        a.fill_bytes(&mut buf_a);
        b.fill_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn counter_stream_depends_on_seed_and_key() {
        let mut a = CounterRng::new(b"ca-key-bytes", [7u8; 16]);
        let mut b = CounterRng::new(b"ca-key-bytes", [8u8; 16]);
        let mut c = CounterRng::new(b"other-key", [7u8; 16]);
        let mut buf_a = [0u8; 32];
        let mut buf_b = [0u8; 32];
        let mut buf_c = [0u8; 32];
        a.fill_bytes(&mut buf_a);
        b.fill_bytes(&mut buf_b);
        c.fill_bytes(&mut buf_c);
        assert_ne!(buf_a, buf_b);
        assert_ne!(buf_a, buf_c);
    }

    #[test]
    fn leaf_key_is_deterministic_per_host_set() {
        let (_dir, ca) = test_ca();
        let hosts = vec!["api.anthropic.com".to_string()];
        let first = derive_leaf_key_der(&ca, &hosts).unwrap();
        let second = derive_leaf_key_der(&ca, &hosts).unwrap();
        assert_eq!(first, second);

        let other = derive_leaf_key_der(&ca, &["api.openai.com".to_string()]).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn sign_host_produces_chain_with_ca() {
        let (_dir, ca) = test_ca();
        let leaf = sign_host(&ca, &["api.anthropic.com".to_string()]).unwrap();
        assert_eq!(leaf.cert.len(), 2);
        assert_eq!(&leaf.cert[1], ca.cert_der());
    }

    #[test]
    fn sign_host_accepts_ip_literals() {
        let (_dir, ca) = test_ca();
        let leaf = sign_host(&ca, &["127.0.0.1".to_string()]).unwrap();
        assert_eq!(leaf.cert.len(), 2);
    }

    #[test]
    fn host_order_does_not_matter() {
        let (_dir, ca) = test_ca();
        let a = derive_leaf_key_der(
            &ca,
            &["b.example.com".to_string(), "a.example.com".to_string()],
        )
        .unwrap();
        let b = derive_leaf_key_der(
            &ca,
            &["a.example.com".to_string(), "b.example.com".to_string()],
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
