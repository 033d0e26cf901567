//! PDF assembly: one page per image, sized to the image.
//!
//! Gray and RGB JPEG files are embedded as-is. Every other image is decoded
//! and stored as deflated RGB, with a grayscale soft mask when the image has
//! transparency.
//! The input files are removed once the PDF is safely on disk.

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::{ImageFormat, ImageReader};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use tracing::{debug, info, warn};

use crate::HarvestError;

const IMAGE_NAME: &[u8] = b"Im0";

/// Outcome of an assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Pages written to the PDF
    pub pages: usize,
    /// Inputs that could not be embedded
    pub skipped: Vec<PathBuf>,
}

/// An image ready to be placed on a page.
struct EmbeddedImage {
    width: u32,
    height: u32,
    image: Stream,
    soft_mask: Option<Stream>,
}

fn name(value: &str) -> Object {
    Object::Name(value.as_bytes().to_vec())
}

fn image_dictionary(width: u32, height: u32, color_space: &str, filter: &str) -> Dictionary {
    dictionary! {
        "Type" => name("XObject"),
        "Subtype" => name("Image"),
        "Width" => Object::Integer(i64::from(width)),
        "Height" => Object::Integer(i64::from(height)),
        "ColorSpace" => name(color_space),
        "BitsPerComponent" => Object::Integer(8),
        "Filter" => name(filter),
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Number of color components declared by the first start-of-frame marker.
///
/// The decoder converts CMYK and YCCK to RGB on its own, so its reported
/// color type says nothing about what the raw stream holds.
fn jpeg_component_count(bytes: &[u8]) -> Option<u8> {
    if bytes.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut pos = 2;
    loop {
        if *bytes.get(pos)? != 0xFF {
            return None;
        }
        let marker = *bytes.get(pos + 1)?;
        match marker {
            0xFF => {
                pos += 1;
                continue;
            }
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }
        let length = usize::from(u16::from_be_bytes([*bytes.get(pos + 2)?, *bytes.get(pos + 3)?]));
        if matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            // length(2) precision(1) height(2) width(2) components(1)
            return bytes.get(pos + 9).copied();
        }
        if length < 2 {
            return None;
        }
        pos += 2 + length;
    }
}

/// Color space for a JPEG that can be embedded without re-encoding.
fn jpeg_passthrough_space(bytes: &[u8]) -> Option<&'static str> {
    match jpeg_component_count(bytes)? {
        1 => Some("DeviceGray"),
        3 => Some("DeviceRGB"),
        _ => None,
    }
}

fn load_image(path: &Path) -> Result<EmbeddedImage> {
    let bytes = std::fs::read(path).map_err(|e| HarvestError::io(path, e))?;

    let (width, height) = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()?
        .into_dimensions()
        .context("Unreadable image header")?;
    if width == 0 || height == 0 {
        bail!("Missing dimensions");
    }

    if image::guess_format(&bytes).ok() == Some(ImageFormat::Jpeg) {
        if let Some(space) = jpeg_passthrough_space(&bytes) {
            let dict = image_dictionary(width, height, space, "DCTDecode");
            return Ok(EmbeddedImage {
                width,
                height,
                image: Stream::new(dict, bytes),
                soft_mask: None,
            });
        }
    }

    let decoded = image::load_from_memory(&bytes).context("Failed to decode image")?;
    let (rgb, alpha) = if decoded.color().has_alpha() {
        let rgba = decoded.to_rgba8();
        let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
        let mut alpha = Vec::with_capacity(rgba.len() / 4);
        for px in rgba.pixels() {
            rgb.extend_from_slice(&px.0[..3]);
            alpha.push(px.0[3]);
        }
        (rgb, Some(alpha))
    } else {
        (decoded.to_rgb8().into_raw(), None)
    };

    let soft_mask = match alpha {
        Some(alpha) if alpha.iter().any(|a| *a != u8::MAX) => Some(Stream::new(
            image_dictionary(width, height, "DeviceGray", "FlateDecode"),
            deflate(&alpha)?,
        )),
        _ => None,
    };

    Ok(EmbeddedImage {
        width,
        height,
        image: Stream::new(
            image_dictionary(width, height, "DeviceRGB", "FlateDecode"),
            deflate(&rgb)?,
        ),
        soft_mask,
    })
}

fn add_page(doc: &mut Document, pages_id: ObjectId, embedded: EmbeddedImage) -> Result<ObjectId> {
    let EmbeddedImage {
        width,
        height,
        mut image,
        soft_mask,
    } = embedded;

    if let Some(mask) = soft_mask {
        let mask_id = doc.add_object(mask);
        image.dict.set("SMask", Object::Reference(mask_id));
    }
    let image_id = doc.add_object(image);

    let (w, h) = (i64::from(width), i64::from(height));
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Integer(w),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(h),
                    Object::Integer(0),
                    Object::Integer(0),
                ],
            ),
            Operation::new("Do", vec![Object::Name(IMAGE_NAME.to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode()?));

    let mut xobjects = Dictionary::new();
    xobjects.set(IMAGE_NAME, Object::Reference(image_id));

    Ok(doc.add_object(dictionary! {
        "Type" => name("Page"),
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(w),
            Object::Integer(h),
        ]),
        "Contents" => Object::Reference(content_id),
        "Resources" => dictionary! { "XObject" => xobjects },
    }))
}

fn write_document(doc: &mut Document, output: &Path) -> Result<()> {
    let file = File::create(output).map_err(|e| HarvestError::io(output, e))?;
    let mut writer = BufWriter::new(file);
    doc.save_to(&mut writer)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    writer.flush().map_err(|e| HarvestError::io(output, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| HarvestError::io(output, e))?;
    Ok(())
}

/// Writes `files` to `output` as one page each, in the given order.
///
/// Unreadable files are skipped. Fails with [`HarvestError::NoImages`] when
/// `files` is empty or nothing could be embedded. After the PDF is flushed,
/// every input file is deleted.
pub fn assemble(files: &[PathBuf], output: &Path) -> Result<AssemblyReport> {
    if files.is_empty() {
        return Err(HarvestError::NoImages.into());
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    let mut report = AssemblyReport::default();

    for file in files {
        match load_image(file).and_then(|embedded| add_page(&mut doc, pages_id, embedded)) {
            Ok(page_id) => {
                debug!("Added page for {}", file.display());
                kids.push(Object::Reference(page_id));
            }
            Err(e) => {
                warn!("Skip: {} - {:#}", file.display(), e);
                report.skipped.push(file.clone());
            }
        }
    }

    if kids.is_empty() {
        return Err(HarvestError::NoImages.into());
    }
    report.pages = kids.len();

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => name("Pages"),
            "Count" => Object::Integer(kids.len() as i64),
            "Kids" => Object::Array(kids),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => name("Catalog"),
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    if let Err(e) = write_document(&mut doc, output) {
        let _ = std::fs::remove_file(output);
        return Err(e);
    }
    info!("PDF written: {} pages", report.pages);

    for file in files {
        if let Err(e) = std::fs::remove_file(file) {
            warn!("Could not remove {}: {}", file.display(), e);
        }
    }

    Ok(report)
}
