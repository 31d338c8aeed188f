//! Credential material for the secure link
//!
//! Three files, each a single base64 line:
//! - CA public key (Ed25519 verifying key, 32 bytes)
//! - node private key (Ed25519 seed, 32 bytes)
//! - CA signature over the node's public key (64 bytes)

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::info;

use crate::error::{Error, Result};

/// Where a node's credential files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    pub ca: PathBuf,
    pub key: PathBuf,
    pub signature: PathBuf,
}

impl CredentialPaths {
    pub fn new(ca: impl Into<PathBuf>, key: impl Into<PathBuf>, signature: impl Into<PathBuf>) -> Self {
        Self {
            ca: ca.into(),
            key: key.into(),
            signature: signature.into(),
        }
    }
}

/// Loaded credentials
#[derive(Clone)]
pub struct Credentials {
    /// Key every peer certificate must be signed by
    pub ca: VerifyingKey,
    /// This node's identity key
    pub signing_key: SigningKey,
    /// CA signature over `signing_key.verifying_key()`
    pub signature: Signature,
}

impl Credentials {
    /// Load from the three credential files
    pub fn load(paths: &CredentialPaths) -> Result<Self> {
        let ca = load_public_key(&paths.ca)?;
        let signing_key = SigningKey::from_bytes(&read_fixed::<32>(&paths.key, "private key")?);
        let signature = Signature::from_bytes(&read_fixed::<64>(&paths.signature, "signature")?);

        let credentials = Self {
            ca,
            signing_key,
            signature,
        };
        if !credentials.is_signed_by_ca() {
            tracing::warn!(
                "Signature in {} does not match key {} under CA {}",
                paths.signature.display(),
                paths.key.display(),
                paths.ca.display()
            );
        }
        Ok(credentials)
    }

    /// Build credentials for `node` signed by `ca`
    pub fn issue(ca: &SigningKey, node: SigningKey) -> Self {
        let signature = sign_public_key(ca, &node.verifying_key());
        Self {
            ca: ca.verifying_key(),
            signing_key: node,
            signature,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Whether our own signature verifies against our CA
    pub fn is_signed_by_ca(&self) -> bool {
        self.ca
            .verify(self.verifying_key().as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Generate a fresh Ed25519 key
pub fn generate_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// CA signature over a node public key
pub fn sign_public_key(ca: &SigningKey, node: &VerifyingKey) -> Signature {
    ca.sign(node.as_bytes())
}

/// Write a private key (owner-only permissions)
pub fn save_private_key(key: &SigningKey, path: &Path) -> Result<()> {
    write_base64(path, &key.to_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!("Private key saved to {:?}", path);
    Ok(())
}

pub fn save_public_key(key: &VerifyingKey, path: &Path) -> Result<()> {
    write_base64(path, key.as_bytes())
}

pub fn save_signature(signature: &Signature, path: &Path) -> Result<()> {
    write_base64(path, &signature.to_bytes())
}

pub fn load_private_key(path: &Path) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&read_fixed::<32>(path, "private key")?))
}

pub fn load_public_key(path: &Path) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&read_fixed::<32>(path, "public key")?)
        .map_err(|e| Error::Credentials(format!("{}: invalid public key: {}", path.display(), e)))
}

/// Base64 form of a public key, as printed by the CLI
pub fn public_key_base64(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

fn write_base64(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, BASE64.encode(bytes))?;
    Ok(())
}

fn read_fixed<const N: usize>(path: &Path, what: &str) -> Result<[u8; N]> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Credentials(format!("cannot read {} {}: {}", what, path.display(), e)))?;
    let bytes = BASE64
        .decode(content.trim())
        .map_err(|e| Error::Credentials(format!("{} {} is not base64: {}", what, path.display(), e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        Error::Credentials(format!(
            "invalid {} length in {}: {} (expected {})",
            what,
            path.display(),
            bytes.len(),
            N
        ))
    })
}

/// Write a complete CA + node credential set into `dir`
#[cfg(test)]
pub(crate) fn write_test_credentials(dir: &Path, ca: &SigningKey, name: &str) -> CredentialPaths {
    let node = generate_key();
    let paths = CredentialPaths::new(
        dir.join("ca"),
        dir.join(format!("{}.sk", name)),
        dir.join(format!("{}.sign", name)),
    );
    save_public_key(&ca.verifying_key(), &paths.ca).unwrap();
    save_signature(&sign_public_key(ca, &node.verifying_key()), &paths.signature).unwrap();
    save_private_key(&node, &paths.key).unwrap();
    paths
}
