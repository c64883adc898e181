//! Host key bootstrap
//!
//! The server identifies itself with one persistent host key. It is generated
//! on first start and written beside the configuration; the file's existence
//! is the idempotence key. A file that exists but cannot be read or parsed is
//! a fatal error, never a reason to regenerate: silently rotating the host
//! key would invalidate every provisioned device's pinned fingerprint.

use anyhow::{bail, Context, Result};
use russh_keys::key::KeyPair;
use std::fs;
use std::path::Path;
use tracing::info;

/// Load the host key, generating and persisting a fresh one when the file
/// does not exist yet.
pub fn load_or_generate(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Host key {} exists but is unreadable", path.display()))?;
        return Ok(key);
    }

    let Some(key) = KeyPair::generate_ed25519() else {
        bail!("Failed to generate host key");
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    fs::write(path, &pem).with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set host key permissions")?;
    }

    info!(path = %path.display(), "generated new host key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;

    #[test]
    fn test_generate_then_reload_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");

        let generated = load_or_generate(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_or_generate(&path).unwrap();
        assert_eq!(
            generated.clone_public_key().unwrap().public_key_base64(),
            reloaded.clone_public_key().unwrap().public_key_base64()
        );
    }

    #[test]
    fn test_unreadable_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        fs::write(&path, "not a pem file").unwrap();

        let err = load_or_generate(&path).unwrap_err();
        assert!(err.to_string().contains("unreadable"));
        // The garbage file is left in place for the operator to inspect.
        assert_eq!(fs::read_to_string(&path).unwrap(), "not a pem file");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        load_or_generate(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
