//! On-disk certificate layout.
//!
//! A node's security directory holds the root cert, an optional root
//! key (absent on non-signing nodes), and the node's leaf cert + key.
//! Key files are written 0600 on Unix; certs 0644.

use std::path::{Path, PathBuf};

/// Filename of the root certificate bundle.
const ROOT_CERT_FILE: &str = "ca.crt";
/// Filename of the root signing key (signing nodes only).
const ROOT_KEY_FILE: &str = "ca.key";
/// Filename of the node leaf certificate.
const NODE_CERT_FILE: &str = "node.crt";
/// Filename of the node leaf key.
const NODE_KEY_FILE: &str = "node.key";
/// Pre-migration key filename (see `KeyReadWriter::migrate`).
const LEGACY_NODE_KEY_FILE: &str = "key.pem";

/// Resolved paths inside a node's security directory.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub root_cert: PathBuf,
    pub root_key: PathBuf,
    pub node_cert: PathBuf,
    pub node_key: PathBuf,
    pub legacy_node_key: PathBuf,
}

impl CertPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            root_cert: dir.join(ROOT_CERT_FILE),
            root_key: dir.join(ROOT_KEY_FILE),
            node_cert: dir.join(NODE_CERT_FILE),
            node_key: dir.join(NODE_KEY_FILE),
            legacy_node_key: dir.join(LEGACY_NODE_KEY_FILE),
        }
    }
}

/// Write a certificate file with 0644 permissions.
pub fn write_cert_file(path: &Path, pem: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    }

    Ok(())
}

/// Write a key file with 0600 permissions.
pub fn write_key_file(path: &Path, pem: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
