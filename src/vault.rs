//! Secret Store
//!
//! Named secrets (provider API keys, credentials supplied through the approval
//! queue). The file vault keeps every value AES-256-GCM encrypted at rest and
//! in memory; plaintext only exists for the duration of a `get_secret` call.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroize;

/// Vault errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid secret name: {0}")]
    InvalidName(String),
    #[error("Invalid master key")]
    InvalidKey,
}

/// Narrow secret-store interface used by the approval queue and the cloud backend
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, VaultError>;
    async fn put_secret(&self, name: &str, value: &str) -> Result<(), VaultError>;
}

/// Secret names are plain identifiers: letters, digits, `_`, `-`, `.`
pub fn validate_secret_name(name: &str) -> Result<(), VaultError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(VaultError::InvalidName(name.to_string()))
    }
}

/// One encrypted entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    name: String,
    encrypted_value: String,
    nonce: String,
    created_at: i64,
    updated_at: i64,
}

/// Encrypted vault file format
#[derive(Debug, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    salt: String,
    secrets: Vec<StoredSecret>,
}

/// File-backed vault with AES-256-GCM encryption
pub struct FileVault {
    path: PathBuf,
    cipher: Aes256Gcm,
    salt: [u8; 32],
    secrets: Mutex<HashMap<String, StoredSecret>>,
}

impl FileVault {
    /// Open (or create) the vault at `path` and unlock it with `master_password`
    pub fn open(path: impl Into<PathBuf>, master_password: &str) -> Result<Self, VaultError> {
        let path = path.into();
        let mut salt = [0u8; 32];
        let mut secrets = HashMap::new();

        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let file: VaultFile = serde_json::from_str(&data)?;
            let salt_bytes = BASE64
                .decode(&file.salt)
                .map_err(|e| VaultError::Decryption(e.to_string()))?;
            if salt_bytes.len() != salt.len() {
                return Err(VaultError::Decryption("bad salt length".to_string()));
            }
            salt.copy_from_slice(&salt_bytes);
            for secret in file.secrets {
                secrets.insert(secret.name.clone(), secret);
            }
        } else {
            OsRng.fill_bytes(&mut salt);
        }

        let mut key = derive_key(master_password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::Encryption(e.to_string()));
        key.zeroize();
        let cipher = cipher?;

        // Verify the password against any existing entry
        if let Some(sample) = secrets.values().next() {
            let mut plaintext = decrypt(&cipher, sample).map_err(|_| VaultError::InvalidKey)?;
            plaintext.zeroize();
        }

        info!(path = %path.display(), entries = secrets.len(), "Vault unlocked");
        Ok(Self {
            path,
            cipher,
            salt,
            secrets: Mutex::new(secrets),
        })
    }

    /// Names of stored secrets, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn store(&self, name: &str, value: &str) -> Result<(), VaultError> {
        validate_secret_name(name)?;

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), value.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        let mut secrets = self.secrets.lock();
        let created_at = secrets.get(name).map(|s| s.created_at).unwrap_or(now);
        secrets.insert(
            name.to_string(),
            StoredSecret {
                name: name.to_string(),
                encrypted_value: BASE64.encode(&ciphertext),
                nonce: BASE64.encode(nonce_bytes),
                created_at,
                updated_at: now,
            },
        );
        self.save(&secrets)?;
        debug!(name, "Secret stored");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<String>, VaultError> {
        let secrets = self.secrets.lock();
        secrets.get(name).map(|s| decrypt(&self.cipher, s)).transpose()
    }

    fn save(&self, secrets: &HashMap<String, StoredSecret>) -> Result<(), VaultError> {
        let file = VaultFile {
            version: 1,
            salt: BASE64.encode(self.salt),
            secrets: secrets.values().cloned().collect(),
        };
        let data = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write atomically via temp file
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileVault {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, VaultError> {
        self.load(name)
    }

    async fn put_secret(&self, name: &str, value: &str) -> Result<(), VaultError> {
        self.store(name, value)
    }
}

/// Process-local store for development and tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: &str, value: &str) -> Self {
        self.values.lock().insert(name.to_string(), value.to_string());
        self
    }

    pub fn remove(&self, name: &str) {
        if let Some(mut value) = self.values.lock().remove(name) {
            value.zeroize();
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, VaultError> {
        Ok(self.values.lock().get(name).cloned())
    }

    async fn put_secret(&self, name: &str, value: &str) -> Result<(), VaultError> {
        validate_secret_name(name)?;
        self.values.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }
}

impl Drop for MemorySecretStore {
    fn drop(&mut self) {
        for value in self.values.get_mut().values_mut() {
            value.zeroize();
        }
    }
}

/// Stretch the master password with the vault salt
fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);

    let mut result = hasher.finalize();
    for _ in 0..10000 {
        let mut hasher = Sha256::new();
        hasher.update(result);
        hasher.update(salt);
        result = hasher.finalize();
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}

fn decrypt(cipher: &Aes256Gcm, secret: &StoredSecret) -> Result<String, VaultError> {
    let nonce_bytes = BASE64
        .decode(&secret.nonce)
        .map_err(|e| VaultError::Decryption(e.to_string()))?;
    if nonce_bytes.len() != 12 {
        return Err(VaultError::Decryption("bad nonce length".to_string()));
    }
    let ciphertext = BASE64
        .decode(&secret.encrypted_value)
        .map_err(|e| VaultError::Decryption(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| VaultError::Decryption(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| VaultError::Decryption(e.to_string()))
}
