//! Pairing code rendering: opaque token → QR code PNG → data URI.

use std::io::Cursor;

use {
    base64::Engine,
    campusline_config::PairingConfig,
    image::{DynamicImage, GrayImage, ImageFormat, Luma, imageops},
    qrcode::QrCode,
};

use crate::{Error, Result};

const DARK: Luma<u8> = Luma([0]);
const LIGHT: Luma<u8> = Luma([255]);

/// Renders pairing tokens into scannable images.
///
/// Visual parameters are fixed per renderer; callers only supply the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRenderer {
    module_px: u32,
    margin_modules: u32,
}

impl PairingRenderer {
    pub fn new(module_px: u32, margin_modules: u32) -> Self {
        Self {
            module_px: module_px.max(1),
            margin_modules,
        }
    }

    pub fn from_config(config: &PairingConfig) -> Self {
        Self::new(config.module_px, config.margin_modules)
    }

    /// Render `token` as a `data:image/png;base64,...` URI.
    pub fn render_data_uri(&self, token: &str) -> Result<String> {
        let png = self.render_png(token)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        Ok(format!("data:image/png;base64,{encoded}"))
    }

    /// Render `token` as PNG bytes.
    pub fn render_png(&self, token: &str) -> Result<Vec<u8>> {
        if token.is_empty() {
            return Err(Error::pairing_render("pairing token is empty"));
        }

        let code = QrCode::new(token.as_bytes()).map_err(Error::pairing_render)?;
        let image = self.rasterize(&code);

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(Error::pairing_render)?;
        Ok(png)
    }

    /// The crate renderer only knows a fixed quiet zone, so the code is
    /// drawn without one and centred on a canvas with the configured margin.
    fn rasterize(&self, code: &QrCode) -> GrayImage {
        let symbol = code
            .render::<Luma<u8>>()
            .quiet_zone(false)
            .module_dimensions(self.module_px, self.module_px)
            .dark_color(DARK)
            .light_color(LIGHT)
            .build();
        let margin_px = self.margin_modules * self.module_px;
        let mut image = GrayImage::from_pixel(
            symbol.width() + margin_px * 2,
            symbol.height() + margin_px * 2,
            LIGHT,
        );
        imageops::overlay(&mut image, &symbol, i64::from(margin_px), i64::from(margin_px));
        image
    }
}
