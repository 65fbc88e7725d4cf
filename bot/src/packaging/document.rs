/// Document mode: one PDF page per decodable image, in path order.
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use tracing::{info, warn};

use jm_shared::errors::JobError;

fn doc_err(step: &str, e: impl std::fmt::Display) -> JobError {
    JobError::Document(format!("{}: {}", step, e))
}

/// Decoded page image, normalized to 8-bit RGB.
struct PageImage {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

fn decode(path: &Path) -> Option<PageImage> {
    match image::open(path) {
        Ok(img) => {
            let rgb = img.to_rgb8();
            let (width, height) = rgb.dimensions();
            Some(PageImage {
                width,
                height,
                rgb: rgb.into_raw(),
            })
        }
        Err(e) => {
            warn!("Skipping undecodable image {:?}: {}", path, e);
            None
        }
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, JobError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Write `images` as a multi-page PDF at `output`, each page sized to its
/// image. Images that fail to decode are skipped. Returns the page count.
pub fn build_document(images: &[PathBuf], output: &Path) -> Result<usize, JobError> {
    let mut sorted: Vec<&PathBuf> = images.iter().collect();
    sorted.sort();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::new();

    for path in sorted {
        let Some(page) = decode(path) else { continue };
        let page_id = add_page(&mut doc, pages_id, &page)?;
        kids.push(page_id.into());
    }

    if kids.is_empty() {
        return Err(doc_err("convert", "no decodable images"));
    }
    let count = kids.len();

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => count as i64,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    doc.save(output).map_err(|e| doc_err("save", e))?;
    info!("Wrote {} page(s) to {:?}", count, output);
    Ok(count)
}

fn add_page(doc: &mut Document, pages_id: ObjectId, page: &PageImage) -> Result<ObjectId, JobError> {
    let width = page.width as i64;
    let height = page.height as i64;

    let image_stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width,
            "Height" => height,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8i64,
            "Filter" => "FlateDecode",
        },
        compress(&page.rgb)?,
    );
    let image_id = doc.add_object(image_stream);

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![width.into(), 0i64.into(), 0i64.into(), height.into(), 0i64.into(), 0i64.into()],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let encoded = content.encode().map_err(|e| doc_err("encode content", e))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(width), Object::Integer(height)],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                "Im0" => image_id,
            },
        },
    }))
}
