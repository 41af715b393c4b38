use std::path::{Path, PathBuf};

use lopdf::{dictionary, Document, Object, Stream};
use serde::Deserialize;

use super::CardRenderer;
use crate::error::RenderError;
use crate::registry::{CardTemplate, Driver};

/// ID-1 card size in PDF points (85.6mm x 54mm).
const CARD_WIDTH: i64 = 243;
const CARD_HEIGHT: i64 = 153;

fn default_title() -> String {
    "Carnet de Conductor".to_string()
}

fn default_fields() -> Vec<CardField> {
    vec![
        CardField::FullName,
        CardField::DocumentNumber,
        CardField::VehiclePlate,
        CardField::CooperativeCode,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardField {
    FullName,
    DocumentNumber,
    VehiclePlate,
    CooperativeCode,
}

impl CardField {
    fn label(&self) -> &'static str {
        match self {
            CardField::FullName => "Nombre",
            CardField::DocumentNumber => "Documento",
            CardField::VehiclePlate => "Placa",
            CardField::CooperativeCode => "Codigo",
        }
    }

    fn value<'a>(&self, driver: &'a Driver) -> Option<&'a str> {
        match self {
            CardField::FullName => Some(&driver.full_name),
            CardField::DocumentNumber => Some(&driver.document_number),
            CardField::VehiclePlate => driver.vehicle_plate.as_deref(),
            CardField::CooperativeCode => driver.cooperative_code.as_deref(),
        }
    }
}

/// Layout document stored in `CardTemplate::layout`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CardLayout {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_fields")]
    pub fields: Vec<CardField>,
    /// Fail the card when the driver has no photo on record.
    #[serde(default)]
    pub require_photo: bool,
}

impl CardLayout {
    pub fn parse(template: &CardTemplate) -> Result<Self, RenderError> {
        let layout: CardLayout =
            serde_json::from_str(&template.layout).map_err(|e| RenderError::MalformedTemplate {
                template: template.name.clone(),
                reason: e.to_string(),
            })?;
        if layout.fields.is_empty() {
            return Err(RenderError::MalformedTemplate {
                template: template.name.clone(),
                reason: "layout lists no fields".to_string(),
            });
        }
        Ok(layout)
    }
}

/// Renders single-page PDF cards with lopdf.
#[derive(Debug, Default, Clone)]
pub struct PdfCardRenderer;

impl PdfCardRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl CardRenderer for PdfCardRenderer {
    fn render(
        &self,
        driver: &Driver,
        template: &CardTemplate,
        destination: &Path,
    ) -> Result<PathBuf, RenderError> {
        let layout = CardLayout::parse(template)?;

        let photo = match &driver.photo_path {
            Some(path) if !path.is_file() => {
                return Err(RenderError::MissingAsset {
                    driver_id: driver.id,
                    asset: path.to_string_lossy().to_string(),
                });
            }
            Some(path) => path.file_name().map(|n| n.to_string_lossy().to_string()),
            None if layout.require_photo => {
                return Err(RenderError::MissingAsset {
                    driver_id: driver.id,
                    asset: "photo".to_string(),
                });
            }
            None => None,
        };

        let bytes = create_card_pdf(driver, &layout, photo.as_deref())?;
        let path = destination.join(card_file_name(&driver.document_number));
        std::fs::write(&path, bytes).map_err(|e| RenderError::Write {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}

/// `carnet_<document>.pdf`, keeping only filename-safe characters.
pub fn card_file_name(document_number: &str) -> String {
    let safe: String = document_number
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("carnet_{}.pdf", safe)
}

fn create_card_pdf(
    driver: &Driver,
    layout: &CardLayout,
    photo: Option<&str>,
) -> Result<Vec<u8>, RenderError> {
    let mut doc = Document::with_version("1.5");

    let pages_id = doc.new_object_id();
    let font_id = doc.new_object_id();
    let resources_id = doc.new_object_id();
    let content_id = doc.new_object_id();
    let page_id = doc.new_object_id();

    doc.objects.insert(
        font_id,
        Object::Dictionary(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        }),
    );

    doc.objects.insert(
        resources_id,
        Object::Dictionary(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        }),
    );

    let content = card_content(driver, layout, photo);
    let content_stream = Stream::new(dictionary! {}, content.into_bytes());
    doc.objects
        .insert(content_id, Object::Stream(content_stream));

    doc.objects.insert(
        page_id,
        Object::Dictionary(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), CARD_WIDTH.into(), CARD_HEIGHT.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        }),
    );

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| RenderError::Pdf(e.to_string()))?;
    Ok(buffer)
}

fn card_content(driver: &Driver, layout: &CardLayout, photo: Option<&str>) -> String {
    let mut content = String::new();
    content.push_str("BT\n");
    content.push_str("/F1 12 Tf\n");
    content.push_str(&format!("14 {} Td\n", CARD_HEIGHT - 24));
    content.push_str("13 TL\n");
    content.push_str(&format!("({}) Tj T*\n", escape_pdf_string(&layout.title)));
    content.push_str("/F1 8 Tf\n");
    content.push_str("11 TL\n");

    for field in &layout.fields {
        if let Some(value) = field.value(driver) {
            let line = format!("{}: {}", field.label(), value);
            content.push_str(&format!("({}) Tj T*\n", escape_pdf_string(&line)));
        }
    }
    if let Some(photo) = photo {
        let line = format!("Foto: {}", photo);
        content.push_str(&format!("({}) Tj T*\n", escape_pdf_string(&line)));
    }

    content.push_str("ET\n");
    content
}

fn escape_pdf_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '(' => escaped.push_str("\\("),
            ')' => escaped.push_str("\\)"),
            '\\' => escaped.push_str("\\\\"),
            c if c.is_ascii() => escaped.push(c),
            _ => escaped.push('?'),
        }
    }
    escaped
}
