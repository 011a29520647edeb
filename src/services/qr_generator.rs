use image::{DynamicImage, ImageBuffer, Luma};
use qrcode::render::svg;
use qrcode::types::Color;
use qrcode::{EcLevel, QrCode};

/// Raster width and height of every rendered QR image
pub const QR_IMAGE_SIZE: u32 = 300;

/// Light modules around the symbol on each side
pub const QR_MARGIN_MODULES: u32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum QrGenerationError {
    #[error("QR code generation failed: {0}")]
    QrCodeError(#[from] qrcode::types::QrError),

    #[error("PNG encoding failed: {0}")]
    ImageError(#[from] image::ImageError),
}

/// A rendered QR code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrImage {
    pub png: Vec<u8>,
    pub size: u32,
}

fn build_code(code: &str) -> Result<QrCode, QrGenerationError> {
    Ok(QrCode::with_error_correction_level(
        code.as_bytes(),
        EcLevel::M,
    )?)
}

/// Renders the code matrix onto a fixed-size grayscale raster.
///
/// Pixels map to modules by proportional scaling, so the output size is
/// always `QR_IMAGE_SIZE` regardless of the QR version.
fn rasterize(code: &QrCode) -> ImageBuffer<Luma<u8>, Vec<u8>> {
    let width = code.width() as u32;
    let total_modules = width + 2 * QR_MARGIN_MODULES;

    ImageBuffer::from_fn(QR_IMAGE_SIZE, QR_IMAGE_SIZE, |x, y| {
        let module_x = x * total_modules / QR_IMAGE_SIZE;
        let module_y = y * total_modules / QR_IMAGE_SIZE;

        let inside = module_x >= QR_MARGIN_MODULES
            && module_y >= QR_MARGIN_MODULES
            && module_x < width + QR_MARGIN_MODULES
            && module_y < width + QR_MARGIN_MODULES;

        if !inside {
            return Luma([255u8]);
        }

        let module_color = code[(
            (module_x - QR_MARGIN_MODULES) as usize,
            (module_y - QR_MARGIN_MODULES) as usize,
        )];
        match module_color {
            Color::Dark => Luma([0u8]),    // Black
            Color::Light => Luma([255u8]), // White
        }
    })
}

/// Encodes a gift card code as a 300x300 black-on-white PNG.
///
/// The payload is the bare code string. Identical codes produce
/// byte-identical PNGs.
pub fn encode_png(code: &str) -> Result<QrImage, QrGenerationError> {
    let qr = build_code(code)?;
    let img = rasterize(&qr);

    let mut png_data = Vec::new();
    DynamicImage::ImageLuma8(img).write_to(
        &mut std::io::Cursor::new(&mut png_data),
        image::ImageFormat::Png,
    )?;

    Ok(QrImage {
        png: png_data,
        size: QR_IMAGE_SIZE,
    })
}

/// Encodes a gift card code as SVG for display in the browser
pub fn encode_svg(code: &str) -> Result<String, QrGenerationError> {
    let qr = build_code(code)?;

    let svg = qr
        .render::<svg::Color>()
        .min_dimensions(QR_IMAGE_SIZE, QR_IMAGE_SIZE)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();

    Ok(svg)
}
