//! Long-lived signing identity (component A).
//!
//! On first use, generates an Ed25519 keypair and persists the private key
//! at a configured path with owner-only permissions. Subsequent loads return
//! the same identity; a missing or malformed file is a fatal configuration
//! error rather than something we silently paper over by regenerating.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::error::{OverlayError, Result};

/// A peer's stable textual identifier, derived from its public key.
///
/// Rendered as lowercase hex of the 32-byte public key; treated everywhere
/// else in this crate as an opaque, comparable string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.to_bytes()))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(OverlayError::protocol(format!(
                "'{s}' is not a syntactically valid peer identifier"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// The node's own long-lived signing identity.
pub struct IdentityStore {
    signing_key: SigningKey,
    peer_id: PeerId,
    path: PathBuf,
}

impl IdentityStore {
    /// Load the identity from `path`, generating and persisting a fresh
    /// keypair if the file does not yet exist.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let signing_key = if path.exists() {
            Self::read_key(&path)?
        } else {
            let key = SigningKey::generate(&mut OsRng);
            Self::write_key(&path, &key)?;
            key
        };
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key());
        Ok(Self {
            signing_key,
            peer_id,
            path,
        })
    }

    fn read_key(path: &Path) -> Result<SigningKey> {
        let bytes = fs::read(path)
            .map_err(|e| OverlayError::identity(format!("cannot read {}: {e}", path.display())))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            OverlayError::identity(format!(
                "{} does not contain a 32-byte signing key",
                path.display()
            ))
        })?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    fn write_key(path: &Path, key: &SigningKey) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| OverlayError::identity(format!("cannot create {}: {e}", parent.display())))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| OverlayError::identity(format!("cannot create {}: {e}", path.display())))?;
            use std::io::Write;
            file.write_all(&key.to_bytes())
                .map_err(|e| OverlayError::identity(format!("cannot write {}: {e}", path.display())))?;
        }
        #[cfg(not(unix))]
        {
            fs::write(path, key.to_bytes())
                .map_err(|e| OverlayError::identity(format!("cannot write {}: {e}", path.display())))?;
        }
        Ok(())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key.sign(message)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_and_persists_on_first_use() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = IdentityStore::load_or_generate(&path).unwrap();
        let second = IdentityStore::load_or_generate(&path).unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    #[cfg(unix)]
    fn persisted_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        IdentityStore::load_or_generate(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn malformed_key_file_is_a_fatal_identity_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, b"not a key").unwrap();

        let err = IdentityStore::load_or_generate(&path).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Identity);
    }

    #[test]
    fn peer_id_parses_only_well_formed_hex() {
        assert!("not-hex".parse::<PeerId>().is_err());
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let store = IdentityStore::load_or_generate(&path).unwrap();
        let text = store.peer_id().to_string();
        assert_eq!(text.parse::<PeerId>().unwrap(), *store.peer_id());
    }
}
