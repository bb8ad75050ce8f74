//! Host-key store.
//!
//! Loads a persistent Ed25519 server key from `<data_dir>/tunnel_host_key`,
//! generating one on first run. The key is immutable for the lifetime of the
//! data directory: rotation is never automatic (see DESIGN.md).

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use russh_keys::ssh_key::LineEnding;
use russh_keys::{Algorithm, PrivateKey};

use crate::error::TunnelError;

const HOST_KEY_FILE: &str = "tunnel_host_key";
const DIR_MODE: u32 = 0o700;
const KEY_FILE_MODE: u32 = 0o600;

/// Load the host key from `data_dir`, creating both the directory and the
/// key if neither exists yet. Fails hard if an existing key file is present
/// but unreadable or not valid OpenSSH PEM. The operator must intervene
/// rather than have the key silently rotated out from under connected
/// clients.
pub fn load_or_generate(data_dir: &Path) -> Result<PrivateKey, TunnelError> {
    let key_path = data_dir.join(HOST_KEY_FILE);

    if key_path.exists() {
        let pem = fs::read_to_string(&key_path)?;
        return PrivateKey::from_openssh(&pem).map_err(TunnelError::HostKeyFormat);
    }

    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(data_dir)?;

    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(TunnelError::HostKeyFormat)?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(TunnelError::HostKeyFormat)?;

    fs::write(&key_path, pem.as_bytes())?;
    fs::set_permissions(&key_path, fs::Permissions::from_mode(KEY_FILE_MODE))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::HashAlg;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tunnel-hostkey-test-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn generates_key_on_first_load() {
        let dir = temp_dir("generate");
        let key = load_or_generate(&dir).expect("first load generates a key");
        assert!(dir.join(HOST_KEY_FILE).exists());
        assert_eq!(key.algorithm(), Algorithm::Ed25519);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_is_idempotent_across_restarts() {
        let dir = temp_dir("idempotent");
        let first = load_or_generate(&dir).expect("first load generates a key");
        let second = load_or_generate(&dir).expect("second load reads the same key");

        let fp1 = first.public_key().fingerprint(HashAlg::Sha256);
        let fp2 = second.public_key().fingerprint(HashAlg::Sha256);
        assert_eq!(fp1.to_string(), fp2.to_string());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn key_file_has_owner_only_permissions() {
        let dir = temp_dir("perms");
        load_or_generate(&dir).unwrap();
        let meta = fs::metadata(dir.join(HOST_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, KEY_FILE_MODE);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_corrupt_key_file() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(HOST_KEY_FILE), b"not a valid key").unwrap();
        let result = load_or_generate(&dir);
        assert!(result.is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
