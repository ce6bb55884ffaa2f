//! Stable server identity
//!
//! The server id and registration secret are generated once and reused for
//! the lifetime of the installation. The self-signed keypair is stored next
//! to them so the certificate fingerprint does not change across restarts.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::self_signed::generate_self_signed_cert;
use crate::{load_certificate, CertError, Certificate};

const REGISTRATION_SECRET_LEN: usize = 32;

/// Persisted identity of this server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub server_id: String,
    pub registration_secret: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Create a fresh identity with a new keypair
    pub fn generate() -> Result<Self, CertError> {
        let cert = generate_self_signed_cert(&[])?;

        let registration_secret = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REGISTRATION_SECRET_LEN)
            .map(char::from)
            .collect();

        Ok(Self {
            server_id: uuid::Uuid::new_v4().simple().to_string(),
            registration_secret,
            certificate_pem: cert.pem_cert,
            private_key_pem: cert.pem_key,
            created_at: Utc::now(),
        })
    }

    /// Parsed certificate chain and key
    pub fn certificate(&self) -> Result<Certificate, CertError> {
        load_certificate(&self.certificate_pem, &self.private_key_pem)
    }
}

/// JSON file backed identity storage
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the identity, creating and persisting one on first use
    pub fn load_or_create(&self) -> Result<Identity, CertError> {
        if self.path.exists() {
            let json = fs::read_to_string(&self.path)?;
            let identity: Identity = serde_json::from_str(&json)?;
            debug!("Loaded server identity {}", identity.server_id);
            return Ok(identity);
        }

        let identity = Identity::generate()?;
        self.save(&identity)?;
        info!(
            "Generated new server identity {} at {}",
            identity.server_id,
            self.path.display()
        );
        Ok(identity)
    }

    pub fn save(&self, identity: &Identity) -> Result<(), CertError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(identity)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
