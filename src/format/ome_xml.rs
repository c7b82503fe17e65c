//! Minimal OME-XML writer and reader.
//!
//! Only the parts of the schema the OME-TIFF adapter needs: `Image` names,
//! `Pixels` dimensions and physical sizes, `Channel` names and samples per
//! pixel, and the first `TiffData` IFD of each image.

use std::collections::HashMap;

use crate::error::AdapterError;
use crate::model::{PhysicalSize, PixelType, DEFAULT_UNIT};

const OME_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

// =============================================================================
// DimensionOrder
// =============================================================================

/// Order in which planes are stored, fastest-varying first after X and Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionOrder {
    XYZCT,
    XYZTC,
    XYCTZ,
    XYCZT,
    XYTCZ,
    XYTZC,
}

impl DimensionOrder {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DimensionOrder::XYZCT => "XYZCT",
            DimensionOrder::XYZTC => "XYZTC",
            DimensionOrder::XYCTZ => "XYCTZ",
            DimensionOrder::XYCZT => "XYCZT",
            DimensionOrder::XYTCZ => "XYTCZ",
            DimensionOrder::XYTZC => "XYTZC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "XYZCT" => Some(DimensionOrder::XYZCT),
            "XYZTC" => Some(DimensionOrder::XYZTC),
            "XYCTZ" => Some(DimensionOrder::XYCTZ),
            "XYCZT" => Some(DimensionOrder::XYCZT),
            "XYTCZ" => Some(DimensionOrder::XYTCZ),
            "XYTZC" => Some(DimensionOrder::XYTZC),
            _ => None,
        }
    }

    /// Index of plane `(z, c, t)` among `sizes = (Z, C, T)` planes.
    pub fn plane_index(&self, z: usize, c: usize, t: usize, sizes: (usize, usize, usize)) -> usize {
        let (sz, sc, st) = sizes;
        let axes = &self.as_str().as_bytes()[2..];
        let mut index = 0;
        for &axis in axes.iter().rev() {
            let (i, n) = match axis {
                b'Z' => (z, sz),
                b'C' => (c, sc),
                _ => (t, st),
            };
            index = index * n + i;
        }
        index
    }
}

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OmeChannel {
    pub name: Option<String>,
    pub samples_per_pixel: usize,
}

/// One `Image` element.
#[derive(Debug, Clone, PartialEq)]
pub struct OmeImage {
    pub name: String,
    pub dimension_order: DimensionOrder,
    pub pixel_type: Option<PixelType>,
    pub size_x: usize,
    pub size_y: usize,
    pub size_z: usize,
    pub size_c: usize,
    pub size_t: usize,
    pub physical_size: PhysicalSize,
    pub channels: Vec<OmeChannel>,
    /// IFD holding the first plane of this image.
    pub first_ifd: usize,
}

impl OmeImage {
    /// Planes stored for this image: one per Z, T and channel element.
    pub fn plane_count(&self) -> usize {
        self.size_z * self.size_t * self.effective_channels()
    }

    /// Samples per pixel of the stored pages.
    pub fn samples_per_pixel(&self) -> usize {
        self.channels
            .first()
            .map(|c| c.samples_per_pixel.max(1))
            .unwrap_or(1)
    }

    /// Channel planes per `(z, t)`, with interleaved samples counted once.
    pub fn effective_channels(&self) -> usize {
        (self.size_c / self.samples_per_pixel()).max(1)
    }

    pub fn channel_names(&self) -> Vec<String> {
        if self.channels.iter().all(|c| c.name.is_none()) {
            return Vec::new();
        }
        self.channels
            .iter()
            .enumerate()
            .map(|(i, c)| c.name.clone().unwrap_or_else(|| format!("Channel_{}", i)))
            .collect()
    }
}

// =============================================================================
// Writing
// =============================================================================

/// Escape markup and every non-ASCII character.
///
/// TIFF stores the description as an ASCII field, so `µm` goes out as
/// `&#181;m`.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            ch if ch.is_ascii() => out.push(ch),
            ch => out.push_str(&format!("&#{};", u32::from(ch))),
        }
    }
    out
}

/// Render `images` as an OME-XML document.
pub fn to_xml(images: &[OmeImage], creator: &str) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<OME xmlns=\"{}\" Creator=\"{}\">\n",
        OME_NAMESPACE,
        escape(creator)
    ));

    for (i, image) in images.iter().enumerate() {
        let ps = &image.physical_size;
        xml.push_str(&format!(
            "  <Image ID=\"Image:{}\" Name=\"{}\">\n",
            i,
            escape(&image.name)
        ));
        xml.push_str(&format!(
            "    <Pixels ID=\"Pixels:{i}\" DimensionOrder=\"{}\" Type=\"{}\" \
             SizeX=\"{}\" SizeY=\"{}\" SizeZ=\"{}\" SizeC=\"{}\" SizeT=\"{}\" \
             PhysicalSizeX=\"{}\" PhysicalSizeXUnit=\"{unit}\" \
             PhysicalSizeY=\"{}\" PhysicalSizeYUnit=\"{unit}\" \
             PhysicalSizeZ=\"{}\" PhysicalSizeZUnit=\"{unit}\" \
             BigEndian=\"false\" Interleaved=\"false\">\n",
            image.dimension_order.as_str(),
            image.pixel_type.map(|p| p.ome_name()).unwrap_or("uint8"),
            image.size_x,
            image.size_y,
            image.size_z,
            image.size_c,
            image.size_t,
            ps.x,
            ps.y,
            ps.z,
            unit = escape(&ps.unit),
        ));
        for (c, channel) in image.channels.iter().enumerate() {
            let name = channel
                .name
                .as_ref()
                .map(|n| format!(" Name=\"{}\"", escape(n)))
                .unwrap_or_default();
            xml.push_str(&format!(
                "      <Channel ID=\"Channel:{}:{}\"{} SamplesPerPixel=\"{}\"/>\n",
                i, c, name, channel.samples_per_pixel
            ));
        }
        xml.push_str(&format!(
            "      <TiffData IFD=\"{}\" PlaneCount=\"{}\"/>\n",
            image.first_ifd,
            image.plane_count()
        ));
        xml.push_str("    </Pixels>\n  </Image>\n");
    }

    xml.push_str("</OME>\n");
    xml
}

// =============================================================================
// Reading
// =============================================================================

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            break;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "amp" => Some('&'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                .and_then(|code| code.ok())
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// An element found by [`elements`]: its attributes and inner text.
struct Element<'a> {
    attrs: HashMap<String, String>,
    body: &'a str,
}

/// Every `<tag ...>` element in `xml`, with an optional namespace prefix.
fn elements<'a>(xml: &'a str, tag: &str) -> Vec<Element<'a>> {
    let mut out = Vec::new();
    let mut rest = xml;

    while let Some(lt) = rest.find('<') {
        rest = &rest[lt + 1..];
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        let local = name.rsplit(':').next().unwrap_or(name);
        if local != tag || name.starts_with('/') {
            continue;
        }

        let Some(close) = find_tag_end(rest) else {
            break;
        };
        let head = &rest[name_end..close];
        let self_closing = head.trim_end().ends_with('/');
        let attrs = parse_attrs(head.trim_end().trim_end_matches('/'));
        rest = &rest[close + 1..];

        let body = if self_closing {
            ""
        } else {
            let end_tag = format!("</{}>", name);
            match rest.find(&end_tag) {
                Some(end) => &rest[..end],
                None => rest,
            }
        };
        out.push(Element { attrs, body });
    }
    out
}

/// Position of the `>` closing a start tag, skipping quoted values.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in s.char_indices() {
        match (quote, ch) {
            (None, '"') | (None, '\'') => quote = Some(ch),
            (Some(q), c) if c == q => quote = None,
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_attrs(head: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = head;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let Some(q) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let value_start = &after[1..];
        let Some(end) = value_start.find(q) else {
            break;
        };
        let local = key.rsplit(':').next().unwrap_or(key);
        attrs.insert(local.to_string(), unescape(&value_start[..end]));
        rest = &value_start[end + 1..];
    }
    attrs
}

/// Length conversion factor into micrometres. Accepts OME symbols and
/// the NGFF long names; anything unknown is taken as micrometres.
pub(crate) fn micrometres_per(unit: &str) -> f64 {
    match unit.trim() {
        "nm" | "nanometer" => 1e-3,
        "mm" | "millimeter" => 1e3,
        "cm" | "centimeter" => 1e4,
        "m" | "meter" => 1e6,
        "Å" | "angstrom" => 1e-4,
        _ => 1.0,
    }
}

/// Parse the `Image` elements of an OME-XML document.
pub fn parse(xml: &str) -> Result<Vec<OmeImage>, AdapterError> {
    let mut images = Vec::new();
    let mut next_ifd = 0usize;

    for image in elements(xml, "Image") {
        let Some(pixels) = elements(image.body, "Pixels").into_iter().next() else {
            return Err(AdapterError::Malformed(
                "OME Image without Pixels".to_string(),
            ));
        };
        let attrs = &pixels.attrs;
        let size = |key: &str| -> Result<usize, AdapterError> {
            attrs
                .get(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| AdapterError::Malformed(format!("Pixels {} missing or invalid", key)))
        };
        let length = |key: &str| -> Option<f64> {
            let value: f64 = attrs.get(key)?.trim().parse().ok()?;
            let unit = attrs
                .get(&format!("{}Unit", key))
                .map(String::as_str)
                .unwrap_or(DEFAULT_UNIT);
            Some(value * micrometres_per(unit))
        };

        let channels: Vec<OmeChannel> = elements(pixels.body, "Channel")
            .into_iter()
            .map(|c| OmeChannel {
                name: c.attrs.get("Name").cloned().filter(|n| !n.is_empty()),
                samples_per_pixel: c
                    .attrs
                    .get("SamplesPerPixel")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
            })
            .collect();

        let first_ifd = elements(pixels.body, "TiffData")
            .iter()
            .filter_map(|t| t.attrs.get("IFD").and_then(|v| v.parse().ok()))
            .min()
            .unwrap_or(next_ifd);

        let ome = OmeImage {
            name: image.attrs.get("Name").cloned().unwrap_or_default(),
            dimension_order: attrs
                .get("DimensionOrder")
                .and_then(|v| DimensionOrder::parse(v))
                .unwrap_or(DimensionOrder::XYZCT),
            pixel_type: attrs.get("Type").and_then(|v| PixelType::from_ome_name(v)),
            size_x: size("SizeX")?,
            size_y: size("SizeY")?,
            size_z: size("SizeZ")?,
            size_c: size("SizeC")?,
            size_t: size("SizeT")?,
            physical_size: PhysicalSize::new(
                length("PhysicalSizeX"),
                length("PhysicalSizeY"),
                length("PhysicalSizeZ"),
            ),
            channels,
            first_ifd,
        };
        next_ifd = ome.first_ifd + ome.plane_count();
        images.push(ome);
    }

    if images.is_empty() {
        return Err(AdapterError::Malformed(
            "OME-XML holds no Image".to_string(),
        ));
    }
    Ok(images)
}

/// Whether an ImageDescription carries OME-XML.
pub fn is_ome_xml(description: &str) -> bool {
    description.contains("<OME") && description.contains("Pixels")
}
