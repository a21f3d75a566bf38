//! QR rendering for particle WireGuard configurations.

use crate::error::{CryptoError, Result};
use qrcode::{EcLevel, QrCode};
use std::path::Path;

/// Render `data` as an SVG QR code.
pub fn render_svg(data: &str) -> Result<String> {
    let code = QrCode::with_error_correction_level(data, EcLevel::M)
        .map_err(|e| CryptoError::QrCodeError(e.to_string()))?;
    Ok(code
        .render::<qrcode::render::svg::Color>()
        .min_dimensions(300, 300)
        .build())
}

/// Render `data` as an SVG QR code and write it to `path`.
pub fn write_svg(data: &str, path: &Path) -> Result<()> {
    let svg = render_svg(data)?;
    std::fs::write(path, svg).map_err(CryptoError::IoError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_render_svg() {
        let svg = render_svg("[Interface]\nPrivateKey = abc\n").unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_write_svg() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p1-east.svg");
        write_svg("[Interface]\nPrivateKey = abc\n", &path).unwrap();
        assert!(path.exists());
    }
}
