//! Minimal PEM armor encode/decode for the registry's own key files.
//!
//! X.509 material is produced and consumed as PEM by rcgen; this module
//! only handles the registry's auxiliary blocks (raw public keys, sealed
//! private-key envelopes) that live next to the certificates.

use crate::error::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const LINE_WIDTH: usize = 64;

/// Encode one PEM block with the given tag.
pub fn encode(tag: &str, data: &[u8]) -> String {
    let body = BASE64.encode(data);
    let mut out = String::with_capacity(body.len() + tag.len() * 2 + 64);
    out.push_str("-----BEGIN ");
    out.push_str(tag);
    out.push_str("-----\n");
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(tag);
    out.push_str("-----\n");
    out
}

/// Decode every PEM block in the input, in order.
pub fn decode_all(input: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let mut blocks = Vec::new();
    let mut tag: Option<String> = None;
    let mut body = String::new();
    for line in input.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("-----BEGIN ") {
            if tag.is_some() {
                return Err(CryptoError::PemError("nested BEGIN block".to_string()));
            }
            let name = rest
                .strip_suffix("-----")
                .ok_or_else(|| CryptoError::PemError(format!("malformed header: {}", line)))?;
            tag = Some(name.to_string());
            body.clear();
        } else if let Some(rest) = line.strip_prefix("-----END ") {
            let name = rest
                .strip_suffix("-----")
                .ok_or_else(|| CryptoError::PemError(format!("malformed footer: {}", line)))?;
            let open = tag
                .take()
                .ok_or_else(|| CryptoError::PemError("END without BEGIN".to_string()))?;
            if open != name {
                return Err(CryptoError::PemError(format!(
                    "mismatched block: BEGIN {} / END {}",
                    open, name
                )));
            }
            let data = BASE64
                .decode(&body)
                .map_err(|e| CryptoError::PemError(format!("bad base64 in {}: {}", name, e)))?;
            blocks.push((name.to_string(), data));
        } else if tag.is_some() {
            body.push_str(line);
        }
    }
    if tag.is_some() {
        return Err(CryptoError::PemError("unterminated PEM block".to_string()));
    }
    Ok(blocks)
}

/// Find the first block with the given tag.
pub fn find(input: &str, tag: &str) -> Result<Vec<u8>> {
    decode_all(input)?
        .into_iter()
        .find(|(name, _)| name == tag)
        .map(|(_, data)| data)
        .ok_or_else(|| CryptoError::PemError(format!("no {} block found", tag)))
}
