//! Per-entity passphrase generation and resolution.
//!
//! Every private key is sealed under a generated passphrase. At load time
//! the passphrase is resolved from the environment variable
//! `UVN_AUTH_<TARGET>` first, then from a `.uno-auth-<target>` sidecar file
//! in the registry root.

use crate::error::Result;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

pub const MIN_PASSPHRASE_LEN: usize = 16;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                         abcdefghijklmnopqrstuvwxyz\
                         0123456789\
                         !@#$%^&*";

/// Generate a random passphrase; `len` is clamped to the minimum.
pub fn generate_passphrase(len: usize) -> String {
    let len = len.max(MIN_PASSPHRASE_LEN);
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Environment variable consulted for the given mangled target suffix.
pub fn env_var_name(target_env_suffix: &str) -> String {
    format!("UVN_AUTH_{}", target_env_suffix)
}

/// Sidecar file name for the given target.
pub fn sidecar_file_name(target: &str) -> String {
    format!(".uno-auth-{}", target)
}

pub fn sidecar_path(root: &Path, target: &str) -> PathBuf {
    root.join(sidecar_file_name(target))
}

/// Resolve the passphrase for `target`: environment first, sidecar second.
pub fn resolve(root: &Path, target: &str, target_env_suffix: &str) -> Option<String> {
    if let Ok(value) = std::env::var(env_var_name(target_env_suffix)) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    let path = sidecar_path(root, target);
    match fs::read_to_string(&path) {
        Ok(value) => {
            let value = value.trim().to_string();
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        }
        Err(_) => None,
    }
}

/// Write the sidecar file, mode 0600.
pub fn write_sidecar(root: &Path, target: &str, passphrase: &str) -> Result<PathBuf> {
    let path = sidecar_path(root, target);
    crate::fsutil::write_atomic(&path, passphrase.as_bytes())?;
    crate::fsutil::restrict_file(&path)?;
    Ok(path)
}
