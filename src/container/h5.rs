//! Attribute, dataset and snapshot helpers over the `hdf5` crate.

use std::str::FromStr;

use hdf5::types::{FloatSize, H5Type, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group, Location};
use ndarray::{s, Ix5};
use tracing::debug;

use crate::error::ContainerError;
use crate::model::{PixelBuffer, PixelType};

use super::codec::ChunkFilter;
use super::layout::{child_path, AttrValue, Attrs, ContainerIndex, DatasetLayout, Node, ROOT};

// =============================================================================
// Attributes
// =============================================================================

fn text(value: &str) -> Result<VarLenUnicode, ContainerError> {
    VarLenUnicode::from_str(value).map_err(|e| {
        ContainerError::CorruptContainer(format!("cannot store text {:?}: {}", value, e))
    })
}

/// Set one scalar attribute, replacing any attribute of the same name.
pub fn set_attr(location: &Location, name: &str, value: &AttrValue) -> Result<(), ContainerError> {
    if location.attr_names()?.iter().any(|n| n == name) {
        location.delete_attr(name)?;
    }
    match value {
        AttrValue::Int(v) => location.new_attr::<i64>().create(name)?.write_scalar(v)?,
        AttrValue::Float(v) => location.new_attr::<f64>().create(name)?.write_scalar(v)?,
        AttrValue::Text(v) => location
            .new_attr::<VarLenUnicode>()
            .create(name)?
            .write_scalar(&text(v)?)?,
    }
    Ok(())
}

pub fn set_attrs(location: &Location, attrs: &Attrs) -> Result<(), ContainerError> {
    for (name, value) in attrs {
        set_attr(location, name, value)?;
    }
    Ok(())
}

/// Every scalar numeric or string attribute of `location`.
///
/// Attributes of other shapes or types are skipped.
pub fn read_attrs(location: &Location) -> Result<Attrs, ContainerError> {
    let mut out = Attrs::new();
    for name in location.attr_names()? {
        let attr = location.attr(&name)?;
        let value = match attr.dtype()?.to_descriptor()? {
            TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
                attr.read_scalar::<i64>().map(AttrValue::Int)
            }
            TypeDescriptor::Float(_) => attr.read_scalar::<f64>().map(AttrValue::Float),
            TypeDescriptor::VarLenUnicode => attr
                .read_scalar::<VarLenUnicode>()
                .map(|v| AttrValue::Text(v.to_string())),
            TypeDescriptor::VarLenAscii => attr
                .read_scalar::<VarLenAscii>()
                .map(|v| AttrValue::Text(v.to_string())),
            other => {
                debug!("Skipping attribute {} of type {:?}", name, other);
                continue;
            }
        };
        match value {
            Ok(value) => {
                out.insert(name, value);
            }
            Err(e) => debug!("Skipping attribute {}: {}", name, e),
        }
    }
    Ok(out)
}

// =============================================================================
// Datasets
// =============================================================================

/// Pixel type of a dataset, or `None` for other element types.
pub fn pixel_type_of(dataset: &Dataset) -> Result<Option<PixelType>, ContainerError> {
    Ok(match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::Unsigned(IntSize::U1) => Some(PixelType::Uint8),
        TypeDescriptor::Unsigned(IntSize::U2) => Some(PixelType::Uint16),
        TypeDescriptor::Float(FloatSize::U4) => Some(PixelType::Float32),
        TypeDescriptor::Float(FloatSize::U8) => Some(PixelType::Float64),
        _ => None,
    })
}

fn create<T: H5Type, const N: usize>(
    group: &Group,
    name: &str,
    shape: [usize; N],
    chunk: [usize; N],
    filter: ChunkFilter,
) -> Result<Dataset, ContainerError> {
    let builder = group.new_dataset::<T>().shape(&shape[..]).chunk(&chunk[..]);
    let builder = match filter {
        ChunkFilter::None => builder,
        ChunkFilter::Deflate { level } => builder.deflate(level),
        ChunkFilter::Lzf => builder.lzf(),
        ChunkFilter::ShuffleDeflate { level } => builder.shuffle().deflate(level),
    };
    Ok(builder.create(name)?)
}

/// Create a chunked dataset named `name` in `group` and fill it with `data`.
pub fn write_samples<const N: usize>(
    group: &Group,
    name: &str,
    shape: [usize; N],
    chunk: [usize; N],
    filter: ChunkFilter,
    data: &PixelBuffer,
) -> Result<Dataset, ContainerError> {
    let dataset = match data {
        PixelBuffer::U8(v) => {
            let ds = create::<u8, N>(group, name, shape, chunk, filter)?;
            ds.write_raw(v.as_slice())?;
            ds
        }
        PixelBuffer::U16(v) => {
            let ds = create::<u16, N>(group, name, shape, chunk, filter)?;
            ds.write_raw(v.as_slice())?;
            ds
        }
        PixelBuffer::F32(v) => {
            let ds = create::<f32, N>(group, name, shape, chunk, filter)?;
            ds.write_raw(v.as_slice())?;
            ds
        }
        PixelBuffer::F64(v) => {
            let ds = create::<f64, N>(group, name, shape, chunk, filter)?;
            ds.write_raw(v.as_slice())?;
            ds
        }
    };
    Ok(dataset)
}

/// Read every sample of `dataset`.
pub fn read_samples(dataset: &Dataset, dtype: PixelType) -> Result<PixelBuffer, ContainerError> {
    Ok(match dtype {
        PixelType::Uint8 => PixelBuffer::U8(dataset.read_raw::<u8>()?),
        PixelType::Uint16 => PixelBuffer::U16(dataset.read_raw::<u16>()?),
        PixelType::Float32 => PixelBuffer::F32(dataset.read_raw::<f32>()?),
        PixelType::Float64 => PixelBuffer::F64(dataset.read_raw::<f64>()?),
    })
}

fn block_as<T: H5Type>(
    dataset: &Dataset,
    origin: [usize; 5],
    extent: [usize; 5],
) -> Result<Vec<T>, ContainerError> {
    let end: [usize; 5] = std::array::from_fn(|i| origin[i] + extent[i]);
    let block = dataset.read_slice::<T, _, Ix5>(s![
        origin[0]..end[0],
        origin[1]..end[1],
        origin[2]..end[2],
        origin[3]..end[3],
        origin[4]..end[4]
    ])?;
    Ok(block.into_iter().collect())
}

/// Read the box `origin..origin + extent` of a rank-5 dataset, in C order.
pub fn read_block(
    dataset: &Dataset,
    dtype: PixelType,
    origin: [usize; 5],
    extent: [usize; 5],
) -> Result<PixelBuffer, ContainerError> {
    Ok(match dtype {
        PixelType::Uint8 => PixelBuffer::U8(block_as(dataset, origin, extent)?),
        PixelType::Uint16 => PixelBuffer::U16(block_as(dataset, origin, extent)?),
        PixelType::Float32 => PixelBuffer::F32(block_as(dataset, origin, extent)?),
        PixelType::Float64 => PixelBuffer::F64(block_as(dataset, origin, extent)?),
    })
}

/// Create a scalar UTF-8 string dataset.
pub fn write_text(group: &Group, name: &str, value: &str) -> Result<Dataset, ContainerError> {
    let dataset = group.new_dataset::<VarLenUnicode>().shape(()).create(name)?;
    dataset.write_scalar(&text(value)?)?;
    Ok(dataset)
}

/// Read a scalar string dataset.
pub fn read_text(dataset: &Dataset) -> Result<String, ContainerError> {
    match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenAscii => Ok(dataset.read_scalar::<VarLenAscii>()?.to_string()),
        _ => Ok(dataset.read_scalar::<VarLenUnicode>()?.to_string()),
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Walk the whole hierarchy of `file`, recording attributes and dataset
/// layouts. No sample is read.
pub fn snapshot(file: &File) -> Result<ContainerIndex, ContainerError> {
    let mut nodes = Vec::new();
    visit(file, ROOT, &mut nodes)?;
    Ok(ContainerIndex { nodes })
}

fn visit(group: &Group, path: &str, nodes: &mut Vec<Node>) -> Result<(), ContainerError> {
    nodes.push(Node::Group {
        path: path.to_string(),
        attrs: read_attrs(group)?,
    });

    for name in group.member_names()? {
        let child = child_path(path, &name);
        if let Ok(sub) = group.group(&name) {
            visit(&sub, &child, nodes)?;
        } else if let Ok(dataset) = group.dataset(&name) {
            let layout = DatasetLayout {
                shape: dataset.shape(),
                dtype: pixel_type_of(&dataset)?,
                chunk_shape: dataset.chunk(),
            };
            nodes.push(Node::Dataset {
                path: child,
                attrs: read_attrs(&dataset)?,
                layout,
            });
        } else {
            debug!("Skipping link {}", child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::layout::attrs;

    #[test]
    fn test_attrs_keep_their_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("a.h5")).unwrap();
        let group = file.create_group("Metadata").unwrap();
        let written = attrs([
            ("SizeX", AttrValue::from(10usize)),
            ("X", AttrValue::from(0.25)),
            ("Unit", AttrValue::from("µm")),
        ]);
        set_attrs(&group, &written).unwrap();
        assert_eq!(read_attrs(&group).unwrap(), written);

        set_attr(&group, "X", &AttrValue::from(-1.0)).unwrap();
        assert_eq!(read_attrs(&group).unwrap()["X"], AttrValue::Float(-1.0));
    }

    #[test]
    fn test_samples_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("b.h5")).unwrap();
        let data = PixelBuffer::U16((0..2 * 6 * 5).map(|i| i as u16).collect());
        let ds = write_samples(
            &file,
            "level",
            [1, 2, 1, 6, 5],
            [1, 1, 1, 4, 4],
            ChunkFilter::ShuffleDeflate { level: 4 },
            &data,
        )
        .unwrap();

        assert_eq!(pixel_type_of(&ds).unwrap(), Some(PixelType::Uint16));
        assert_eq!(ds.chunk(), Some(vec![1, 1, 1, 4, 4]));
        assert_eq!(read_samples(&ds, PixelType::Uint16).unwrap(), data);

        let block = read_block(&ds, PixelType::Uint16, [0, 1, 0, 4, 3], [1, 1, 1, 2, 2]).unwrap();
        assert_eq!(block, PixelBuffer::U16(vec![53, 54, 58, 59]));
    }

    #[test]
    fn test_snapshot_walks_groups_and_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("c.h5")).unwrap();
        set_attr(&file, "format", &AttrValue::from("univ")).unwrap();
        let provenance = file.create_group("Provenance").unwrap();
        write_text(&provenance, "conversion_history", "{\"a\":1}").unwrap();
        write_samples(
            &file,
            "Thumbnail",
            [1, 2, 2],
            [1, 2, 2],
            ChunkFilter::Lzf,
            &PixelBuffer::U8(vec![1, 2, 3, 4]),
        )
        .unwrap();

        let index = snapshot(&file).unwrap();
        assert_eq!(index.attrs_of("/").unwrap()["format"], AttrValue::from("univ"));
        assert!(index.contains("/Provenance"));

        let history = index.dataset("/Provenance/conversion_history").unwrap();
        assert_eq!(history.dtype, None);
        assert!(history.shape.is_empty());
        assert_eq!(
            read_text(&provenance.dataset("conversion_history").unwrap()).unwrap(),
            "{\"a\":1}"
        );

        let thumbnail = index.dataset("/Thumbnail").unwrap();
        assert_eq!(thumbnail.shape, vec![1, 2, 2]);
        assert_eq!(thumbnail.dtype, Some(PixelType::Uint8));
    }
}
