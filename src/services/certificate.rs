use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::pdf::{text_width, Font, PdfImage, PdfPage, Rgb};

/// 4 x 6 inch card
pub const PAGE_WIDTH: f32 = 288.0;
pub const PAGE_HEIGHT: f32 = 432.0;

const MARGIN: f32 = 16.0;
const HEADER_HEIGHT: f32 = 60.0;
const LOGO_SIZE: f32 = 44.0;
const QR_SIZE: f32 = 130.0;

const HEADER_COLOR: Rgb = Rgb(0.13, 0.13, 0.13);
const ACCENT_COLOR: Rgb = Rgb(0.72, 0.53, 0.04);
const MUTED_COLOR: Rgb = Rgb(0.40, 0.40, 0.40);

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
    #[error("Invalid QR image: {0}")]
    InvalidQrImage(image::ImageError),

    #[error("Invalid logo image: {0}")]
    InvalidLogo(image::ImageError),
}

/// Company identity printed on certificates and emails
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub currency_symbol: String,
    #[serde(skip)]
    pub logo_png: Option<Vec<u8>>,
}

impl CompanyInfo {
    /// Contact lines for footers, skipping blanks
    pub fn contact_lines(&self) -> Vec<String> {
        let phone_email: Vec<&str> = [self.phone.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();

        let mut lines = Vec::new();
        if let Some(address) = self.address.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(address.to_string());
        }
        if !phone_email.is_empty() {
            lines.push(phone_email.join("  |  "));
        }
        if let Some(website) = self.website.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(website.to_string());
        }
        lines
    }
}

/// Card fields shown on a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateData {
    pub code: String,
    pub amount: i64,
    pub holder_name: String,
    pub holder_email: String,
    pub issued_at: DateTime<Utc>,
}

/// Formats minor units as e.g. `$1,234.50`
pub fn format_amount(minor_units: i64, currency_symbol: &str) -> String {
    let sign = if minor_units < 0 { "-" } else { "" };
    let abs = minor_units.unsigned_abs();
    let whole = (abs / 100).to_string();
    let cents = abs % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    format!("{}{}{}.{:02}", sign, currency_symbol, grouped, cents)
}

/// Shortens `text` with a trailing ellipsis until it fits `max_width`
fn fit_text(font: Font, size: f32, max_width: f32, text: &str) -> String {
    if text_width(font, size, text) <= max_width {
        return text.to_string();
    }

    let mut chars: Vec<char> = text.chars().collect();
    while !chars.is_empty() {
        chars.pop();
        let candidate: String = chars.iter().collect::<String>() + "...";
        if text_width(font, size, &candidate) <= max_width {
            return candidate;
        }
    }
    "...".to_string()
}

/// Renders a printable gift certificate as PDF bytes.
///
/// Pure: all inputs, including the encoded QR image and company details,
/// are supplied by the caller. Identical inputs produce identical bytes.
pub fn render_certificate(
    card: &CertificateData,
    qr_png: &[u8],
    company: &CompanyInfo,
) -> Result<Vec<u8>, CertificateError> {
    let qr = PdfImage::decode(qr_png).map_err(CertificateError::InvalidQrImage)?;
    let logo = company
        .logo_png
        .as_deref()
        .map(|png| PdfImage::decode_over(png, HEADER_COLOR))
        .transpose()
        .map_err(CertificateError::InvalidLogo)?;

    let mut page = PdfPage::new(PAGE_WIDTH, PAGE_HEIGHT);
    let center = page.width() / 2.0;
    let content_width = page.width() - 2.0 * MARGIN;

    // Header
    let header_bottom = page.height() - HEADER_HEIGHT;
    page.fill_rect(HEADER_COLOR, 0.0, header_bottom, page.width(), HEADER_HEIGHT);
    let name_baseline = header_bottom + HEADER_HEIGHT / 2.0 - 5.0;
    match logo {
        Some(logo) => {
            let logo_y = header_bottom + (HEADER_HEIGHT - LOGO_SIZE) / 2.0;
            page.image(logo, MARGIN, logo_y, LOGO_SIZE, LOGO_SIZE);
            let name_x = MARGIN + LOGO_SIZE + 10.0;
            let name = fit_text(Font::Bold, 16.0, page.width() - name_x - MARGIN, &company.name);
            page.text(Font::Bold, 16.0, Rgb::WHITE, name_x, name_baseline, &name);
        }
        None => {
            let name = fit_text(Font::Bold, 16.0, content_width, &company.name);
            page.text_centered(Font::Bold, 16.0, Rgb::WHITE, center, name_baseline, &name);
        }
    }

    // Body
    page.text_centered(Font::Bold, 14.0, ACCENT_COLOR, center, 345.0, "GIFT CERTIFICATE");
    let amount = format_amount(card.amount, &company.currency_symbol);
    page.text_centered(Font::Bold, 30.0, Rgb::BLACK, center, 305.0, &amount);

    page.image(qr, center - QR_SIZE / 2.0, 165.0, QR_SIZE, QR_SIZE);
    page.text_centered(Font::Bold, 13.0, Rgb::BLACK, center, 148.0, &card.code);

    page.text_centered(Font::Regular, 9.0, MUTED_COLOR, center, 126.0, "Issued to");
    let holder_name = fit_text(Font::Bold, 11.0, content_width, &card.holder_name);
    page.text_centered(Font::Bold, 11.0, Rgb::BLACK, center, 112.0, &holder_name);
    let holder_email = fit_text(Font::Regular, 9.0, content_width, &card.holder_email);
    page.text_centered(Font::Regular, 9.0, Rgb::BLACK, center, 99.0, &holder_email);
    let issued = format!("Issued on {}", card.issued_at.format("%B %-d, %Y"));
    page.text_centered(Font::Regular, 9.0, MUTED_COLOR, center, 84.0, &issued);

    // Footer
    page.line(MUTED_COLOR, 0.5, (MARGIN, 66.0), (page.width() - MARGIN, 66.0));
    let mut baseline = 52.0;
    for line in company.contact_lines().iter().take(4) {
        let line = fit_text(Font::Regular, 7.5, content_width, line);
        page.text_centered(Font::Regular, 7.5, MUTED_COLOR, center, baseline, &line);
        baseline -= 10.0;
    }

    Ok(page.finish())
}
