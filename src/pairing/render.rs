//! Pairing code rendering.

use std::io::Cursor;

use base64::Engine;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};

use crate::error::RenderError;

/// Prefix of every pairing artifact data URI.
pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// A rendered pairing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingArtifact {
    /// The raw one-time code, as emitted by the protocol.
    pub code: String,
    /// Scannable PNG image of `code`.
    pub png: Vec<u8>,
}

impl PairingArtifact {
    /// `data:image/png;base64,...` form, embeddable in an `<img src>`.
    pub fn data_uri(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.png);
        format!("{}{}", PNG_DATA_URI_PREFIX, encoded)
    }
}

/// Turns a pairing code into an image.
pub trait CodeRenderer: Send + Sync {
    fn render(&self, code: &str) -> Result<PairingArtifact, RenderError>;
}

/// Renders codes as QR PNGs at medium error correction.
#[derive(Debug, Clone)]
pub struct QrPngRenderer {
    min_size: u32,
}

impl QrPngRenderer {
    pub fn new(min_size: u32) -> Self {
        Self { min_size }
    }
}

impl Default for QrPngRenderer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CodeRenderer for QrPngRenderer {
    fn render(&self, code: &str) -> Result<PairingArtifact, RenderError> {
        let qr = QrCode::with_error_correction_level(code.as_bytes(), EcLevel::M)
            .map_err(|e| RenderError::Encode(e.to_string()))?;

        let image = qr
            .render::<Luma<u8>>()
            .min_dimensions(self.min_size, self.min_size)
            .build();

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| RenderError::Png(e.to_string()))?;

        Ok(PairingArtifact {
            code: code.to_string(),
            png,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

    #[test]
    fn test_render_produces_png() {
        let artifact = QrPngRenderer::default()
            .render("2@Zm9vYmFy,c2VjcmV0,aWRlbnRpdHk=,YWR2")
            .unwrap();
        assert!(artifact.png.starts_with(PNG_MAGIC));
        assert_eq!(artifact.code, "2@Zm9vYmFy,c2VjcmV0,aWRlbnRpdHk=,YWR2");
    }

    #[test]
    fn test_rendered_image_respects_min_size() {
        let artifact = QrPngRenderer::new(300).render("2@abc").unwrap();
        let decoded = image::load_from_memory_with_format(&artifact.png, ImageFormat::Png).unwrap();
        assert!(decoded.width() >= 300);
        assert!(decoded.height() >= 300);
    }

    #[test]
    fn test_data_uri_format() {
        let artifact = PairingArtifact {
            code: "x".to_string(),
            png: vec![1, 2, 3],
        };
        assert_eq!(artifact.data_uri(), "data:image/png;base64,AQID");
    }

    #[test]
    fn test_oversized_code_is_an_error() {
        let code = "9".repeat(8000);
        let err = QrPngRenderer::default().render(&code).unwrap_err();
        assert!(matches!(err, RenderError::Encode(_)));
    }
}
