//! Minimal single-page PDF 1.4 writer.
//!
//! Supports the two standard Helvetica faces, filled rectangles, lines and
//! raw (uncompressed) raster images. Output carries no timestamps or file
//! identifiers, so identical drawing commands always yield identical bytes.

use std::io::Write;

use image::DynamicImage;

const CATALOG_ID: usize = 1;
const PAGES_ID: usize = 2;
const PAGE_ID: usize = 3;
const FONT_REGULAR_ID: usize = 4;
const FONT_BOLD_ID: usize = 5;
const CONTENTS_ID: usize = 6;
const FIRST_IMAGE_ID: usize = 7;

// Helvetica advance widths (1/1000 em) for ASCII 32..=126.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // '0'..'?'
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 'P'..'_'
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // '`'..'o'
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // 'p'..'~'
];

// Helvetica-Bold advance widths for ASCII 32..=126.
const HELVETICA_BOLD_WIDTHS: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 333, 333, 584, 584, 584, 611, // '0'..'?'
    975, 722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 333, 278, 333, 584, 556, // 'P'..'_'
    333, 556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889, 611, 611, // '`'..'o'
    611, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500, 389, 280, 389, 584, // 'p'..'~'
];

const DEFAULT_GLYPH_WIDTH: u16 = 556;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    Regular,
    Bold,
}

impl Font {
    fn resource_name(self) -> &'static str {
        match self {
            Font::Regular => "F1",
            Font::Bold => "F2",
        }
    }

    fn widths(self) -> &'static [u16; 95] {
        match self {
            Font::Regular => &HELVETICA_WIDTHS,
            Font::Bold => &HELVETICA_BOLD_WIDTHS,
        }
    }
}

/// RGB color with components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb(pub f32, pub f32, pub f32);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0.0, 0.0, 0.0);
    pub const WHITE: Rgb = Rgb(1.0, 1.0, 1.0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Gray,
    Rgb,
}

impl ColorSpace {
    fn pdf_name(self) -> &'static str {
        match self {
            ColorSpace::Gray => "/DeviceGray",
            ColorSpace::Rgb => "/DeviceRGB",
        }
    }
}

/// 8-bit raster ready to embed as an image XObject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfImage {
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub data: Vec<u8>,
}

impl PdfImage {
    /// Decodes an encoded image (PNG, JPEG, ...) into raw samples.
    /// Grayscale sources stay grayscale; everything else becomes RGB.
    /// Transparent pixels are flattened onto white.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        Self::decode_over(bytes, Rgb::WHITE)
    }

    /// Like [`PdfImage::decode`], but flattens any alpha channel onto
    /// `background`, the color the image will be drawn over.
    pub fn decode_over(bytes: &[u8], background: Rgb) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        let (width, height) = (img.width(), img.height());

        if img.color().has_alpha() {
            return Ok(Self {
                width,
                height,
                color_space: ColorSpace::Rgb,
                data: flatten_alpha(&img.to_rgba8(), background),
            });
        }

        let image = match img {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) => Self {
                width,
                height,
                color_space: ColorSpace::Gray,
                data: img.to_luma8().into_raw(),
            },
            other => Self {
                width,
                height,
                color_space: ColorSpace::Rgb,
                data: other.to_rgb8().into_raw(),
            },
        };

        Ok(image)
    }
}

fn channel_byte(value: f32) -> u32 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u32
}

/// Composites RGBA samples over an opaque background, returning RGB samples
fn flatten_alpha(rgba: &image::RgbaImage, background: Rgb) -> Vec<u8> {
    let bg = [
        channel_byte(background.0),
        channel_byte(background.1),
        channel_byte(background.2),
    ];

    let mut data = Vec::with_capacity(rgba.as_raw().len() / 4 * 3);
    for pixel in rgba.pixels() {
        let alpha = u32::from(pixel[3]);
        for channel in 0..3 {
            let blended =
                (u32::from(pixel[channel]) * alpha + bg[channel] * (255 - alpha) + 127) / 255;
            data.push(blended as u8);
        }
    }
    data
}

/// Width of `text` in points when set in `font` at `size`
pub fn text_width(font: Font, size: f32, text: &str) -> f32 {
    let widths = font.widths();
    let units: u32 = text
        .chars()
        .map(|c| match c as u32 {
            code @ 32..=126 => u32::from(widths[(code - 32) as usize]),
            _ => u32::from(DEFAULT_GLYPH_WIDTH),
        })
        .sum();

    units as f32 * size / 1000.0
}

/// Maps a char to its WinAnsi byte, or `?` when it has none
fn win_ansi_byte(c: char) -> u8 {
    match c {
        '€' => 0x80,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        c if (c as u32) >= 0x20 && (c as u32) < 0x7f => c as u8,
        c if (c as u32) >= 0xa0 && (c as u32) <= 0xff => c as u32 as u8,
        _ => b'?',
    }
}

fn push_literal_string(out: &mut Vec<u8>, text: &str) {
    out.push(b'(');
    for c in text.chars() {
        let byte = win_ansi_byte(c);
        if matches!(byte, b'(' | b')' | b'\\') {
            out.push(b'\\');
        }
        out.push(byte);
    }
    out.push(b')');
}

/// A single page under construction
pub struct PdfPage {
    width: f32,
    height: f32,
    content: Vec<u8>,
    images: Vec<PdfImage>,
}

impl PdfPage {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            content: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    fn op(&mut self, op: String) {
        self.content.extend_from_slice(op.as_bytes());
    }

    /// Draws text with its baseline starting at (x, y)
    pub fn text(&mut self, font: Font, size: f32, color: Rgb, x: f32, y: f32, text: &str) {
        self.op(format!(
            "BT /{} {:.2} Tf {:.3} {:.3} {:.3} rg 1 0 0 1 {:.2} {:.2} Tm ",
            font.resource_name(),
            size,
            color.0,
            color.1,
            color.2,
            x,
            y
        ));
        push_literal_string(&mut self.content, text);
        self.op(" Tj ET\n".to_string());
    }

    /// Draws text horizontally centered on `center_x`
    pub fn text_centered(
        &mut self,
        font: Font,
        size: f32,
        color: Rgb,
        center_x: f32,
        y: f32,
        text: &str,
    ) {
        let x = center_x - text_width(font, size, text) / 2.0;
        self.text(font, size, color, x, y, text);
    }

    pub fn fill_rect(&mut self, color: Rgb, x: f32, y: f32, width: f32, height: f32) {
        self.op(format!(
            "q {:.3} {:.3} {:.3} rg {:.2} {:.2} {:.2} {:.2} re f Q\n",
            color.0, color.1, color.2, x, y, width, height
        ));
    }

    pub fn line(&mut self, color: Rgb, line_width: f32, from: (f32, f32), to: (f32, f32)) {
        self.op(format!(
            "q {:.2} w {:.3} {:.3} {:.3} RG {:.2} {:.2} m {:.2} {:.2} l S Q\n",
            line_width, color.0, color.1, color.2, from.0, from.1, to.0, to.1
        ));
    }

    /// Places `image` scaled into the box with lower-left corner (x, y)
    pub fn image(&mut self, image: PdfImage, x: f32, y: f32, width: f32, height: f32) {
        self.images.push(image);
        let name = format!("Im{}", self.images.len());
        self.op(format!(
            "q {:.2} 0 0 {:.2} {:.2} {:.2} cm /{} Do Q\n",
            width, height, x, y, name
        ));
    }

    /// Serializes the page as a complete PDF file
    pub fn finish(self) -> Vec<u8> {
        let mut objects: Vec<Vec<u8>> = Vec::new();

        objects.push(
            format!("<< /Type /Catalog /Pages {} 0 R >>", PAGES_ID).into_bytes(),
        );
        objects.push(
            format!("<< /Type /Pages /Kids [{} 0 R] /Count 1 >>", PAGE_ID).into_bytes(),
        );

        let xobjects: String = (0..self.images.len())
            .map(|i| format!("/Im{} {} 0 R ", i + 1, FIRST_IMAGE_ID + i))
            .collect();
        objects.push(
            format!(
                "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {:.2} {:.2}] \
                 /Resources << /Font << /F1 {} 0 R /F2 {} 0 R >> /XObject << {}>> >> \
                 /Contents {} 0 R >>",
                PAGES_ID,
                self.width,
                self.height,
                FONT_REGULAR_ID,
                FONT_BOLD_ID,
                xobjects,
                CONTENTS_ID
            )
            .into_bytes(),
        );
        objects.push(
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
                .to_vec(),
        );
        objects.push(
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>"
                .to_vec(),
        );
        objects.push(stream_object(
            format!("<< /Length {} >>", self.content.len()),
            &self.content,
        ));

        for image in &self.images {
            objects.push(stream_object(
                format!(
                    "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {} \
                     /BitsPerComponent 8 /Length {} >>",
                    image.width,
                    image.height,
                    image.color_space.pdf_name(),
                    image.data.len()
                ),
                &image.data,
            ));
        }

        write_document(&objects)
    }
}

fn stream_object(dictionary: String, data: &[u8]) -> Vec<u8> {
    let mut object = dictionary.into_bytes();
    object.extend_from_slice(b"\nstream\n");
    object.extend_from_slice(data);
    object.extend_from_slice(b"\nendstream");
    object
}

fn write_document(objects: &[Vec<u8>]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

    let mut offsets = Vec::with_capacity(objects.len());
    for (index, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        // Writing into a Vec cannot fail
        let _ = write!(out, "{} 0 obj\n", index + 1);
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_offset = out.len();
    let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        let _ = write!(out, "{:010} 00000 n \n", offset);
    }
    let _ = write!(
        out,
        "trailer\n<< /Size {} /Root {} 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        CATALOG_ID,
        xref_offset
    );

    out
}
