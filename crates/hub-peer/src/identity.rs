use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use uuid::Uuid;

const KEY_FILE_PERMS: u32 = 0o600;

/// Load the 32-byte Ed25519 seed at `path`, or create one.
///
/// # Errors
///
/// Returns an error if the key file has wrong permissions, wrong length,
/// or if file I/O fails.
pub fn load_or_generate_keypair(path: &Path) -> anyhow::Result<SigningKey> {
    if path.exists() {
        let permissions = fs::metadata(path)?.permissions().mode();
        if permissions & 0o077 != 0 {
            anyhow::bail!(
                "key file {} has overly permissive permissions ({:o}), must be 0600",
                path.display(),
                permissions & 0o777
            );
        }

        let seed = fs::read(path)?;
        let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("key file must contain exactly 32 bytes, got {}", seed.len())
        })?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(KEY_FILE_PERMS)
        .open(path)?;
    file.write_all(&signing_key.to_bytes())?;
    tracing::info!(path = %path.display(), "generated new signing key");
    Ok(signing_key)
}

/// Load the peer id stored at `path`, or mint and persist a fresh UUID.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written, or holds
/// something other than a UUID.
pub fn load_or_create_id(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let id = Uuid::parse_str(raw.trim())
            .map_err(|e| anyhow::anyhow!("invalid peer id in {}: {e}", path.display()))?;
        return Ok(id.to_string());
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{id}\n"))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_key_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("keys").join("identity.key");
        let key = load_or_generate_keypair(&key_path).unwrap();

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(&key_path).unwrap(), key.to_bytes());
    }

    #[test]
    fn reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("identity.key");
        let first = load_or_generate_keypair(&key_path).unwrap();
        let second = load_or_generate_keypair(&key_path).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn rejects_world_readable_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("identity.key");
        fs::write(&key_path, [1u8; 32]).unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = load_or_generate_keypair(&key_path).unwrap_err().to_string();
        assert!(err.contains("overly permissive permissions"));
    }

    #[test]
    fn rejects_short_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("identity.key");
        fs::write(&key_path, [1u8; 16]).unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600)).unwrap();

        let err = load_or_generate_keypair(&key_path).unwrap_err().to_string();
        assert!(err.contains("must contain exactly 32 bytes"));
    }

    #[test]
    fn peer_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let id_path = dir.path().join("client.id");
        let first = load_or_create_id(&id_path).unwrap();
        let second = load_or_create_id(&id_path).unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn garbage_peer_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let id_path = dir.path().join("client.id");
        fs::write(&id_path, "not-a-uuid").unwrap();
        assert!(load_or_create_id(&id_path).is_err());
    }
}
