use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::SecurityError;

pub const SECRET_LEN: usize = 32;

/// Durable per-host secret binding tokens, signatures, and derived session
/// keys to this machine. Generated once, stored owner-read-only, never
/// transmitted.
#[derive(Clone)]
pub struct HostSecret {
    bytes: [u8; SECRET_LEN],
}

impl HostSecret {
    /// Loads the secret from `path`, generating and persisting a fresh one
    /// when the file is missing or unreadable. A regenerated secret
    /// invalidates every previously issued token, which is acceptable since
    /// tokens are short-lived.
    pub fn load_or_generate(path: &Path) -> Result<Self, SecurityError> {
        match fs::read(path) {
            Ok(raw) if raw.len() == SECRET_LEN => {
                let mut bytes = [0u8; SECRET_LEN];
                bytes.copy_from_slice(&raw);
                return Ok(Self { bytes });
            }
            Ok(_) => {
                tracing::warn!(
                    target: "breakwater::secret",
                    path = %path.display(),
                    "host secret has wrong length; regenerating"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    target: "breakwater::secret",
                    path = %path.display(),
                    error = %err,
                    "host secret unreadable; regenerating"
                );
            }
        }

        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        let secret = Self { bytes };
        secret.persist(path)?;
        Ok(secret)
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.bytes
    }

    /// First half of the secret, used as the KDF salt for token signatures
    /// and token-bound session keys.
    pub(crate) fn kdf_salt(&self) -> &[u8] {
        &self.bytes[..16]
    }

    fn persist(&self, path: &Path) -> Result<(), SecurityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&self.bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = file.metadata()?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostSecret(..)")
    }
}
