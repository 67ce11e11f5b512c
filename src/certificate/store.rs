use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rustls::sign::CertifiedKey;

use crate::error::AppError;

/// Per-hostname cache of signed leaf certificates.
///
/// The single mutex is held across `gen`, so concurrent fetches serialize and
/// the generator runs at most once per hostname. A generator failure is
/// propagated and nothing is cached.
pub struct CertStore {
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetch<F>(&self, hostname: &str, gen: F) -> Result<Arc<CertifiedKey>, AppError>
    where
        F: FnOnce() -> Result<Arc<CertifiedKey>, AppError>,
    {
        let mut cache = self.cache.lock().unwrap();
        if let Some(cert) = cache.get(hostname) {
            log::debug!("[cert-store] cache hit host={}", hostname);
            return Ok(cert.clone());
        }

        match gen() {
            Ok(cert) => {
                log::debug!("[cert-store] signed leaf host={}", hostname);
                cache.insert(hostname.to_string(), cert.clone());
                Ok(cert)
            }
            Err(e) => {
                log::debug!("[cert-store] signing failed host={} err={}", hostname, e);
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("cached", &self.len())
            .finish()
    }
}
