use anyhow::Context;
use oadr_protocol::Keypair;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Setup Ctrl+C handler, returns a flag that goes false on signal.
pub fn setup_ctrlc() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\nCtrl+C received, shutting down...");
        r.store(false, Ordering::Relaxed);
    });
    running
}

/// Load a signing key written by `oadr keygen`.
pub fn load_keypair(path: &Path) -> anyhow::Result<Keypair> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read key file {}", path.display()))?;
    Keypair::from_hex(&text).with_context(|| format!("invalid key file {}", path.display()))
}

pub fn load_optional_keypair(path: Option<&Path>) -> anyhow::Result<Option<Keypair>> {
    path.map(load_keypair).transpose()
}

/// `<prefix>.key` and `<prefix>.pem`.
pub fn key_paths(prefix: &Path) -> (PathBuf, PathBuf) {
    let with_suffix = |suffix: &str| {
        let mut path = prefix.as_os_str().to_owned();
        path.push(suffix);
        PathBuf::from(path)
    };
    (with_suffix(".key"), with_suffix(".pem"))
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
