//! OME-TIFF adapter.
//!
//! Writes BigTIFF files with one grayscale page per plane in `XYZCT` order
//! and the OME-XML document in the first page's ImageDescription. Pyramid
//! levels follow the base as extra OME `Image`s named `"<name> #<k+1>"`.
//!
//! Reading accepts any of the six OME dimension orders, interleaved RGB
//! pages, multi-image files (one scene per `Image`), and plain TIFFs
//! without OME-XML (first page only).

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{self, ColorType as TiffColorType};
use tiff::encoder::compression::{
    Compression as TiffCompression, Deflate, DeflateLevel, Lzw, Packbits, Uncompressed,
};
use tiff::encoder::{TiffEncoder, TiffKindBig, TiffValue};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::debug;

use crate::container::layout::CREATOR;
use crate::error::{AdapterError, IoError};
use crate::model::{
    file_name_of, AxisLayout, CanonicalTensor, ImageMetadata, ImagePyramid, PixelBuffer,
    RawArray, SceneDescriptor, SceneSelector,
};

use super::adapter::{Compression, DecodeRequest, Decoded, EncodeOptions, FormatAdapter};
use super::detect::SourceFormat;
use super::ome_xml::{self, DimensionOrder, OmeChannel, OmeImage};

// =============================================================================
// Write settings
// =============================================================================

/// Compression applied to every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCompression {
    Uncompressed,
    /// Deflate with a 1-9 level.
    Deflate(u32),
    Packbits,
    Lzw,
}

impl PageCompression {
    /// Page compression for an encode request.
    pub fn from_options(options: &EncodeOptions) -> Result<Self, AdapterError> {
        match options.compression {
            Compression::None => Ok(PageCompression::Uncompressed),
            Compression::LosslessGeneral => Ok(PageCompression::Deflate(options.compression_level)),
            Compression::FastGeneral => Ok(PageCompression::Packbits),
            Compression::CombinableFilters => Ok(PageCompression::Lzw),
            Compression::TiledLossy => Err(AdapterError::Unsupported(
                "tiled-lossy compression is not available for OME-TIFF".to_string(),
            )),
        }
    }
}

fn deflate_level(level: u32) -> DeflateLevel {
    match level {
        0..=3 => DeflateLevel::Fast,
        4..=6 => DeflateLevel::Balanced,
        _ => DeflateLevel::Best,
    }
}

/// How pages are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffWriteSettings {
    pub compression: PageCompression,
    /// Rows per strip; `None` lets the encoder pick.
    pub rows_per_strip: Option<u32>,
}

// =============================================================================
// Encoding
// =============================================================================

fn write_page<W, C, D>(
    encoder: &mut TiffEncoder<W, TiffKindBig>,
    width: u32,
    height: u32,
    data: &[C::Inner],
    compression: D,
    description: Option<&str>,
    rows_per_strip: Option<u32>,
) -> Result<(), AdapterError>
where
    W: Write + Seek,
    C: TiffColorType,
    D: TiffCompression,
    [C::Inner]: TiffValue,
{
    let mut image = encoder.new_image_with_compression::<C, D>(width, height, compression)?;
    if let Some(description) = description {
        image.encoder().write_tag(Tag::ImageDescription, description)?;
    }
    if let Some(rows) = rows_per_strip {
        image.rows_per_strip(rows)?;
    }
    image.write_data(data)?;
    Ok(())
}

fn write_planes<W, C>(
    encoder: &mut TiffEncoder<W, TiffKindBig>,
    level: &CanonicalTensor,
    data: &[C::Inner],
    settings: &TiffWriteSettings,
    description: Option<&str>,
) -> Result<usize, AdapterError>
where
    W: Write + Seek,
    C: TiffColorType,
    [C::Inner]: TiffValue,
{
    let width = level.size_x() as u32;
    let height = level.size_y() as u32;
    let plane_len = level.size_y() * level.size_x();
    let rows = settings.rows_per_strip;

    let mut pages = 0;
    for (i, plane) in data.chunks(plane_len).enumerate() {
        let desc = if i == 0 { description } else { None };
        match settings.compression {
            PageCompression::Uncompressed => {
                write_page::<W, C, _>(encoder, width, height, plane, Uncompressed, desc, rows)?
            }
            PageCompression::Deflate(level) => write_page::<W, C, _>(
                encoder,
                width,
                height,
                plane,
                Deflate::with_level(deflate_level(level)),
                desc,
                rows,
            )?,
            PageCompression::Packbits => {
                write_page::<W, C, _>(encoder, width, height, plane, Packbits, desc, rows)?
            }
            PageCompression::Lzw => {
                write_page::<W, C, _>(encoder, width, height, plane, Lzw, desc, rows)?
            }
        }
        pages += 1;
    }
    Ok(pages)
}

fn write_level<W: Write + Seek>(
    encoder: &mut TiffEncoder<W, TiffKindBig>,
    level: &CanonicalTensor,
    settings: &TiffWriteSettings,
    description: Option<&str>,
) -> Result<usize, AdapterError> {
    match level.data() {
        PixelBuffer::U8(v) => {
            write_planes::<W, colortype::Gray8>(encoder, level, v, settings, description)
        }
        PixelBuffer::U16(v) => {
            write_planes::<W, colortype::Gray16>(encoder, level, v, settings, description)
        }
        PixelBuffer::F32(v) => {
            write_planes::<W, colortype::Gray32Float>(encoder, level, v, settings, description)
        }
        PixelBuffer::F64(v) => {
            write_planes::<W, colortype::Gray64Float>(encoder, level, v, settings, description)
        }
    }
}

/// OME `Image` elements describing every level of `pyramid`.
fn ome_images(pyramid: &ImagePyramid, metadata: &ImageMetadata) -> Vec<OmeImage> {
    let name = metadata
        .scene_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| stem_of(&metadata.source_file));

    let mut first_ifd = 0;
    pyramid
        .iter()
        .enumerate()
        .map(|(k, level)| {
            let channels = (0..level.size_c())
                .map(|c| OmeChannel {
                    name: (metadata.channel_names.len() == level.size_c())
                        .then(|| metadata.channel_names[c].clone()),
                    samples_per_pixel: 1,
                })
                .collect();
            let image = OmeImage {
                name: if k == 0 {
                    name.clone()
                } else {
                    format!("{} #{}", name, k + 1)
                },
                dimension_order: DimensionOrder::XYZCT,
                pixel_type: Some(level.pixel_type()),
                size_x: level.size_x(),
                size_y: level.size_y(),
                size_z: level.size_z(),
                size_c: level.size_c(),
                size_t: level.size_t(),
                physical_size: metadata.physical_size.scaled_xy((1u64 << k) as f64),
                channels,
                first_ifd,
            };
            first_ifd += level.plane_count();
            image
        })
        .collect()
}

fn stem_of(file_name: &str) -> String {
    let stem = file_name.split('.').next().unwrap_or(file_name);
    if stem.is_empty() {
        "image".to_string()
    } else {
        stem.to_string()
    }
}

/// Write `pyramid` as an OME-TIFF. Returns the file size.
///
/// The file is written synchronously; the tensor data is borrowed for the
/// whole write.
pub fn write_ome_tiff(
    pyramid: &ImagePyramid,
    metadata: &ImageMetadata,
    path: &Path,
    settings: &TiffWriteSettings,
) -> Result<u64, AdapterError> {
    if pyramid.base.is_empty() {
        return Err(AdapterError::Malformed(format!(
            "refusing to write an empty image of shape {:?}",
            pyramid.base.shape()
        )));
    }

    let images = ome_images(pyramid, metadata);
    let xml = ome_xml::to_xml(&images, CREATOR);

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    {
        let mut encoder = TiffEncoder::new_big(&mut writer)?;
        let mut pages = 0;
        for (k, level) in pyramid.iter().enumerate() {
            let description = (k == 0).then_some(xml.as_str());
            pages += write_level(&mut encoder, level, settings, description)?;
        }
        debug!(
            "Wrote {} page(s) in {} image(s) to {}",
            pages,
            images.len(),
            path.display()
        );
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;

    Ok(std::fs::metadata(path)?.len())
}

// =============================================================================
// Decoding
// =============================================================================

type FileDecoder = Decoder<BufReader<File>>;

fn open_decoder(path: &Path) -> Result<FileDecoder, AdapterError> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

fn samples_per_pixel(color: ColorType) -> Result<usize, AdapterError> {
    match color {
        ColorType::Gray(_) => Ok(1),
        ColorType::GrayA(_) => Ok(2),
        ColorType::RGB(_) => Ok(3),
        ColorType::RGBA(_) => Ok(4),
        other => Err(AdapterError::Unsupported(format!(
            "TIFF color type {:?}",
            other
        ))),
    }
}

fn saturate_u16<T: TryInto<u16> + PartialOrd + Default + Copy>(values: Vec<T>) -> Vec<u16> {
    values
        .into_iter()
        .map(|v| {
            if v < T::default() {
                0
            } else {
                v.try_into().unwrap_or(u16::MAX)
            }
        })
        .collect()
}

/// Convert decoded samples, folding unusual integer types into u16.
fn page_buffer(result: DecodingResult) -> Result<PixelBuffer, AdapterError> {
    Ok(match result {
        DecodingResult::U8(v) => PixelBuffer::U8(v),
        DecodingResult::U16(v) => PixelBuffer::U16(v),
        DecodingResult::F32(v) => PixelBuffer::F32(v),
        DecodingResult::F64(v) => PixelBuffer::F64(v),
        DecodingResult::U32(v) => PixelBuffer::U16(saturate_u16(v)),
        DecodingResult::U64(v) => PixelBuffer::U16(saturate_u16(v)),
        DecodingResult::I8(v) => PixelBuffer::U16(saturate_u16(v)),
        DecodingResult::I16(v) => PixelBuffer::U16(saturate_u16(v)),
        DecodingResult::I32(v) => PixelBuffer::U16(saturate_u16(v)),
        DecodingResult::I64(v) => PixelBuffer::U16(saturate_u16(v)),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(AdapterError::Unsupported(
                "TIFF sample format".to_string(),
            ))
        }
    })
}

/// Read the page at `ifd`, checking it has the expected geometry.
fn read_page(
    decoder: &mut FileDecoder,
    ifd: usize,
    width: usize,
    height: usize,
) -> Result<(PixelBuffer, usize), AdapterError> {
    decoder.seek_to_image(ifd)?;
    let (w, h) = decoder.dimensions()?;
    if (w as usize, h as usize) != (width, height) {
        return Err(AdapterError::Malformed(format!(
            "page {} is {}x{}, expected {}x{}",
            ifd, w, h, width, height
        )));
    }
    let spp = samples_per_pixel(decoder.colortype()?)?;
    let buffer = page_buffer(decoder.read_image()?)?;
    if buffer.len() != width * height * spp {
        return Err(AdapterError::Malformed(format!(
            "page {} holds {} samples, expected {}",
            ifd,
            buffer.len(),
            width * height * spp
        )));
    }
    Ok((buffer, spp))
}

fn description_of(decoder: &mut FileDecoder) -> Option<String> {
    decoder.get_tag_ascii_string(Tag::ImageDescription).ok()
}

fn scenes_of(images: &[OmeImage]) -> Vec<SceneDescriptor> {
    images
        .iter()
        .enumerate()
        .map(|(i, img)| {
            let name = if img.name.is_empty() {
                format!("Image {}", i)
            } else {
                img.name.clone()
            };
            SceneDescriptor::new(i, name, img.size_x as u64, img.size_y as u64)
        })
        .collect()
}

fn list_scenes_blocking(path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
    let mut decoder = open_decoder(path)?;
    match description_of(&mut decoder).filter(|d| ome_xml::is_ome_xml(d)) {
        Some(xml) => Ok(scenes_of(&ome_xml::parse(&xml)?)),
        None => {
            let (w, h) = decoder.dimensions()?;
            Ok(vec![SceneDescriptor::new(
                0,
                file_name_of(path),
                w as u64,
                h as u64,
            )])
        }
    }
}

fn decode_blocking(path: &Path, scene: SceneSelector) -> Result<Decoded, AdapterError> {
    let mut decoder = open_decoder(path)?;
    let file_name = file_name_of(path);

    let Some(xml) = description_of(&mut decoder).filter(|d| ome_xml::is_ome_xml(d)) else {
        return decode_plain(decoder, &file_name, scene);
    };

    let images = ome_xml::parse(&xml)?;
    let scenes = scenes_of(&images);
    let selected = scene.resolve(&scenes)?;
    let image = &images[selected];

    let (width, height) = (image.size_x, image.size_y);
    let plane_len = width * height;
    let sizes = |ceff: usize| (image.size_z, ceff, image.size_t);

    // The first plane fixes the sample type and samples per pixel.
    let (first, spp) = read_page(&mut decoder, image.first_ifd, width, height)?;
    let ceff = (image.size_c / spp).max(1);
    let page_len = plane_len * spp;
    let planes = image.size_t * ceff * image.size_z;

    let mut data = PixelBuffer::zeros(first.pixel_type(), planes * page_len);
    let mut plane = 0;
    for t in 0..image.size_t {
        for c in 0..ceff {
            for z in 0..image.size_z {
                let ifd = image.first_ifd
                    + image.dimension_order.plane_index(z, c, t, sizes(ceff));
                let page = if ifd == image.first_ifd {
                    first.clone()
                } else {
                    read_page(&mut decoder, ifd, width, height)?.0
                };
                data.write_at(plane * page_len, &page)?;
                plane += 1;
            }
        }
    }

    let raw = if spp == 1 {
        RawArray::new(
            vec![image.size_t, ceff, image.size_z, height, width],
            AxisLayout::TCZYX,
            data,
        )
    } else {
        RawArray::new(
            vec![image.size_t, ceff, image.size_z, height, width, spp],
            AxisLayout::TCZYXS,
            data,
        )
    };

    let mut metadata = ImageMetadata::new(file_name, SourceFormat::OmeTiff)
        .with_physical_size(image.physical_size.clone())
        .with_channel_names(image.channel_names());
    if images.len() > 1 {
        metadata = metadata.with_scene(selected, scenes[selected].name.clone());
    }

    debug!(
        "Decoded OME-TIFF image {} ({}): {:?} {}",
        selected,
        image.name,
        raw.shape,
        image.dimension_order.as_str()
    );

    let mut decoded = Decoded::new(raw, metadata);
    decoded.scenes = scenes;
    Ok(decoded)
}

/// A TIFF without OME-XML: the first page is the image.
fn decode_plain(
    mut decoder: FileDecoder,
    file_name: &str,
    scene: SceneSelector,
) -> Result<Decoded, AdapterError> {
    let (w, h) = decoder.dimensions()?;
    let (width, height) = (w as usize, h as usize);
    let scenes = vec![SceneDescriptor::new(0, file_name, w as u64, h as u64)];
    scene.resolve(&scenes)?;

    let (data, spp) = read_page(&mut decoder, 0, width, height)?;
    let raw = if spp == 1 {
        RawArray::new(vec![height, width], AxisLayout::YX, data)
    } else {
        RawArray::new(vec![1, 1, 1, height, width, spp], AxisLayout::TCZYXS, data)
    };

    let mut decoded = Decoded::new(raw, ImageMetadata::new(file_name, SourceFormat::OmeTiff));
    decoded
        .warnings
        .push(format!("{} has no OME-XML; read the first page only", file_name));
    decoded.scenes = scenes;
    Ok(decoded)
}

async fn run_blocking<T, F>(f: F) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AdapterError::Io(IoError::Io(format!("TIFF worker failed: {}", e))))?
}

// =============================================================================
// Adapter
// =============================================================================

/// OME-TIFF reader and writer.
#[derive(Debug, Clone, Default)]
pub struct OmeTiffAdapter;

impl OmeTiffAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FormatAdapter for OmeTiffAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::OmeTiff
    }

    async fn list_scenes(&self, path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
        let path: PathBuf = path.to_path_buf();
        run_blocking(move || list_scenes_blocking(&path)).await
    }

    async fn decode(&self, path: &Path, request: &DecodeRequest) -> Result<Decoded, AdapterError> {
        let path: PathBuf = path.to_path_buf();
        let scene = request.scene;
        run_blocking(move || decode_blocking(&path, scene)).await
    }

    async fn encode(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
    ) -> Result<u64, AdapterError> {
        let settings = TiffWriteSettings {
            compression: PageCompression::from_options(options)?,
            rows_per_strip: None,
        };
        write_ome_tiff(pyramid, metadata, path, &settings)
    }
}
