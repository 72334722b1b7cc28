use anyhow::Context;
use oadr_protocol::{certificate_fingerprint, Keypair};
use std::path::{Path, PathBuf};

use crate::common::key_paths;

/// Fingerprint of a PEM or DER certificate/public key file.
pub fn fingerprint(path: &Path) -> anyhow::Result<String> {
    let contents =
        std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    Ok(certificate_fingerprint(&contents)?)
}

/// Generates a signing key. Returns the written key and PEM paths.
pub fn keygen(prefix: &Path) -> anyhow::Result<(PathBuf, PathBuf, String)> {
    let keypair = Keypair::generate();
    let (key_path, pem_path) = key_paths(prefix);
    if key_path.exists() {
        anyhow::bail!("refusing to overwrite {}", key_path.display());
    }
    std::fs::write(&key_path, format!("{}\n", keypair.seed_hex()))
        .with_context(|| format!("cannot write {}", key_path.display()))?;
    std::fs::write(&pem_path, keypair.public_key_pem())
        .with_context(|| format!("cannot write {}", pem_path.display()))?;
    Ok((key_path, pem_path, keypair.fingerprint()))
}
