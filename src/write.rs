//! PSD encoding.
//!
//! Sections go out in file order. Every length-prefixed section is written through [ByteWriter::length_prefixed], and each layer channel's
//! length field is reserved in the layer record and filled in once its data has been written.

use std::io::Write;

use tracing::{debug, trace};

use crate::color;
use crate::cursor::{ByteWriter, Placeholder};
use crate::error::{PsdError, Result};
use crate::model::{self, ColorMode, GuideOrientation, ImageResources, Layer, LayerMask, Limits, PsdDocument, PsdHeader, Rect};
use crate::packbits::{self, Encoded, EncodedRows};
use crate::read::{
    BLOCK_SIGNATURE, FILE_SIGNATURE, RES_ACTIVE_LAYER, RES_CAPTION, RES_CHANNEL_NAMES, RES_GUIDES, RES_RESOLUTION, RES_TRANSPARENT_INDEX,
};

/// Guide positions are written in 1/32 pixel.
const GUIDE_SCALE : i32 = 32;

/// Encode a document with the default [Limits].
pub fn save_psd(doc : &PsdDocument) -> Result<Vec<u8>>
{
    save_psd_with_limits(doc, &Limits::default())
}

/// Encode a document.
///
/// The document is checked with [PsdDocument::validate] first and nothing is produced if that fails.
pub fn save_psd_with_limits(doc : &PsdDocument, limits : &Limits) -> Result<Vec<u8>>
{
    doc.validate(limits)?;
    let mut w = ByteWriter::new();
    write_header(&mut w, &doc.header)?;
    write_color_mode_data(&mut w, doc)?;
    w.length_prefixed(1, |w| write_resources(w, doc))?;
    write_layer_section(&mut w, doc)?;
    write_merged_image(&mut w, doc)?;
    debug!(bytes = w.position(), layers = doc.layers.len(), "encoded PSD");
    Ok(w.into_inner())
}

/// [save_psd] into a stream.
pub fn write_psd<W : Write>(doc : &PsdDocument, mut writer : W) -> Result<()>
{
    let bytes = save_psd(doc)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

fn write_header(w : &mut ByteWriter, header : &PsdHeader) -> Result<()>
{
    w.write_bytes(&FILE_SIGNATURE)?;
    w.write_u16(1)?;
    w.write_zeros(6)?;
    w.write_u16(header.channels)?;
    w.write_u32(header.rows)?;
    w.write_u32(header.columns)?;
    w.write_u16(header.depth)?;
    w.write_u16(header.mode.to_u16())
}

fn write_color_mode_data(w : &mut ByteWriter, doc : &PsdDocument) -> Result<()>
{
    if doc.header.mode != ColorMode::Indexed
    {
        return w.write_u32(0);
    }
    w.length_prefixed(1, |w| w.write_bytes(&color::interleaved_to_planar(&doc.palette)))
}

/// One image resource: signature, id, empty name, then the payload with its exact size and a pad byte if that size is odd.
fn write_resource<F>(w : &mut ByteWriter, id : u16, body : F) -> Result<()>
where
    F : FnOnce(&mut ByteWriter) -> Result<()>,
{
    w.write_bytes(&BLOCK_SIGNATURE)?;
    w.write_u16(id)?;
    w.write_pascal_string("", 2)?;
    let start = w.position();
    w.length_prefixed(1, body)?;
    if (w.position() - start) % 2 == 1
    {
        w.write_u8(0)?;
    }
    Ok(())
}

fn write_resources(w : &mut ByteWriter, doc : &PsdDocument) -> Result<()>
{
    let resources : &ImageResources = &doc.resources;

    if !resources.channel_names.is_empty()
    {
        write_resource(w, RES_CHANNEL_NAMES, |w| {
            for name in &resources.channel_names
            {
                w.write_pascal_string(name, 1)?;
            }
            Ok(())
        })?;
    }

    if let Some(resolution) = &resources.resolution
    {
        write_resource(w, RES_RESOLUTION, |w| {
            let unit = resolution.unit.to_u16();
            w.write_u32(to_fixed(resolution.horizontal))?;
            w.write_u16(unit)?;
            w.write_u16(unit)?;
            w.write_u32(to_fixed(resolution.vertical))?;
            w.write_u16(unit)?;
            w.write_u16(unit)
        })?;
    }

    if let Some(caption) = &resources.caption
    {
        write_resource(w, RES_CAPTION, |w| w.write_pascal_string(caption, 1))?;
    }

    if let Some(active) = resources.active_layer
    {
        let index = model::flip_index(doc.layers.len(), active as usize)
            .ok_or_else(|| PsdError::InvalidDocument(format!("active layer {} of {} layers", active, doc.layers.len())))?;
        write_resource(w, RES_ACTIVE_LAYER, |w| w.write_u16(index as u16))?;
    }

    if !resources.guides.is_empty()
    {
        write_resource(w, RES_GUIDES, |w| {
            // version, then 1/32 pixel scale for both axes
            w.write_u32(1)?;
            w.write_u32(0x0240)?;
            w.write_u32(0x0240)?;
            w.write_u32(resources.guides.len() as u32)?;
            for guide in &resources.guides
            {
                let position = guide.position.checked_mul(GUIDE_SCALE)
                    .ok_or_else(|| PsdError::InvalidDocument(format!("guide at {} is too far out to store", guide.position)))?;
                w.write_i32(position)?;
                w.write_u8((guide.orientation == GuideOrientation::Horizontal) as u8)?;
            }
            Ok(())
        })?;
    }

    if let Some(index) = resources.transparent_index
    {
        write_resource(w, RES_TRANSPARENT_INDEX, |w| w.write_u16(index))?;
    }
    Ok(())
}

/// 16.16 fixed point, rounded.
fn to_fixed(value : f64) -> u32
{
    (value * 65536.0 + 0.5) as u32
}

fn write_layer_section(w : &mut ByteWriter, doc : &PsdDocument) -> Result<()>
{
    if doc.layers.is_empty()
    {
        return w.write_u32(0);
    }
    w.length_prefixed(1, |w| {
        w.length_prefixed(2, |w| write_layer_info(w, doc))?;
        // no global layer mask info
        w.write_u32(0)
    })
}

fn write_layer_info(w : &mut ByteWriter, doc : &PsdDocument) -> Result<()>
{
    let count = doc.layers.len() as i16;
    w.write_i16(if doc.merged_alpha { -count } else { count })?;

    let mut length_slots = Vec::with_capacity(doc.layers.len());
    for layer in model::in_file_order(&doc.layers)
    {
        length_slots.push(write_layer_record(w, layer)?);
    }

    for (layer, slots) in model::in_file_order(&doc.layers).zip(length_slots)
    {
        for (channel, slot) in layer.channels.iter().zip(slots)
        {
            let rect = layer.info.channel_rect(channel.kind);
            let start = w.position();
            write_channel(w, &channel.data, rect)?;
            let len = w.position() - start;
            let len = u32::try_from(len).map_err(|_| PsdError::InvalidDocument(format!("channel of {} bytes does not fit a 32-bit length", len)))?;
            w.patch_u32(slot, len);
        }
    }
    Ok(())
}

fn write_rect(w : &mut ByteWriter, rect : &Rect) -> Result<()>
{
    w.write_i32(rect.top)?;
    w.write_i32(rect.left)?;
    w.write_i32(rect.bottom)?;
    w.write_i32(rect.right)
}

/// Write one layer record and return the reserved channel length slots, in channel order.
fn write_layer_record(w : &mut ByteWriter, layer : &Layer) -> Result<Vec<Placeholder>>
{
    let info = &layer.info;
    write_rect(w, &info.rect)?;
    w.write_u16(layer.channels.len() as u16)?;
    let mut slots = Vec::with_capacity(layer.channels.len());
    for channel in &layer.channels
    {
        w.write_i16(channel.kind.id())?;
        slots.push(w.placeholder_u32()?);
    }

    w.write_bytes(&BLOCK_SIGNATURE)?;
    w.write_bytes(&info.blend_mode.key())?;
    w.write_u8(info.opacity)?;
    w.write_u8(info.clipping)?;
    w.write_u8(info.flag_byte())?;
    w.write_u8(0)?;

    w.length_prefixed(1, |w| {
        match &info.mask
        {
            Some(mask) => w.length_prefixed(1, |w| write_mask(w, mask))?,
            None => w.write_u32(0)?,
        }
        // blending ranges
        w.write_u32(0)?;
        w.write_pascal_string(&info.name, 4)?;
        if !info.name.is_empty()
        {
            w.write_bytes(&BLOCK_SIGNATURE)?;
            w.write_bytes(b"luni")?;
            w.length_prefixed(4, |w| {
                let mut units : Vec<u16> = info.name.encode_utf16().collect();
                // readers drop one trailing NUL as a terminator
                if info.name.ends_with('\0')
                {
                    units.push(0);
                }
                w.write_u32(units.len() as u32)?;
                for unit in units
                {
                    w.write_u16(unit)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    })?;
    trace!(name = %info.name, channels = layer.channels.len(), "wrote layer record");
    Ok(slots)
}

fn write_mask(w : &mut ByteWriter, mask : &LayerMask) -> Result<()>
{
    write_rect(w, &mask.rect)?;
    w.write_u8(mask.default_color)?;
    w.write_u8(mask.flags)?;
    w.write_zeros(2)
}

/// Compression id, then raw bytes or the row table and PackBits rows, whichever is smaller.
fn write_channel(w : &mut ByteWriter, plane : &[u8], rect : Rect) -> Result<()>
{
    let encoded = packbits::choose_encoding(plane, rect.width() as usize, rect.height() as usize);
    trace!(compression = encoded.compression_id(), width = rect.width(), height = rect.height(), "writing channel");
    w.write_u16(encoded.compression_id())?;
    match encoded
    {
        Encoded::Raw(bytes) => w.write_bytes(bytes),
        Encoded::Rle(rows) =>
        {
            write_row_table(w, &rows)?;
            w.write_bytes(&rows.data)
        }
    }
}

fn write_row_table(w : &mut ByteWriter, rows : &EncodedRows) -> Result<()>
{
    for &len in &rows.row_lengths
    {
        w.write_u16(len as u16)?;
    }
    Ok(())
}

/// The merged image has one compression id for all its channels, so raw and RLE are compared over the whole image.
fn write_merged_image(w : &mut ByteWriter, doc : &PsdDocument) -> Result<()>
{
    let width = doc.header.columns as usize;
    let height = doc.header.rows as usize;
    let encoded : Vec<EncodedRows> = doc.composite.iter().map(|plane| packbits::encode_rows(plane, width, height)).collect();
    let fits = encoded.iter().all(|rows| rows.row_lengths.iter().all(|&len| len <= u16::MAX as usize));
    let rle_len : usize = encoded.iter().map(EncodedRows::stored_len).sum();
    let raw_len : usize = doc.composite.iter().map(Vec::len).sum();

    if fits && rle_len < raw_len
    {
        debug!(rle_len, raw_len, "merged image is RLE");
        w.write_u16(1)?;
        for rows in &encoded
        {
            write_row_table(w, rows)?;
        }
        for rows in &encoded
        {
            w.write_bytes(&rows.data)?;
        }
    }
    else
    {
        debug!(rle_len, raw_len, "merged image is raw");
        w.write_u16(0)?;
        for plane in &doc.composite
        {
            w.write_bytes(plane)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::SliceCursor;
    use crate::model::{Guide, Resolution};
    use crate::read::load_psd;

    #[test]
    fn header_layout()
    {
        let doc = PsdDocument::new(ColorMode::Grayscale, 3, 2, 1);
        let bytes = save_psd(&doc).unwrap();
        assert_eq!(&bytes[..4], b"8BPS");
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..12], &[0; 6]);
        assert_eq!(&bytes[12..14], &[0, 1]);
        assert_eq!(&bytes[14..18], &[0, 0, 0, 2]);
        assert_eq!(&bytes[18..22], &[0, 0, 0, 3]);
        assert_eq!(&bytes[22..26], &[0, 8, 0, 1]);
        // empty color mode data, resources and layer section, then a raw merged image
        assert_eq!(&bytes[26..40], &[0; 14]);
        assert_eq!(bytes.len(), 40 + 6);
    }

    #[test]
    fn odd_resources_are_padded()
    {
        let mut w = ByteWriter::new();
        write_resource(&mut w, 0x1234, |w| w.write_u8(9)).unwrap();
        assert_eq!(w.as_bytes(), &[b'8', b'B', b'I', b'M', 0x12, 0x34, 0, 0, 0, 0, 0, 1, 9, 0]);
    }

    #[test]
    fn resources_survive()
    {
        let mut doc = PsdDocument::new(ColorMode::Rgb, 2, 2, 4);
        doc.resources.channel_names = vec!["Alpha 1".to_string()];
        doc.resources.caption = Some("a caption".to_string());
        doc.resources.guides = vec![
            Guide { position : 1, orientation : GuideOrientation::Horizontal },
            Guide { position : -3, orientation : GuideOrientation::Vertical },
        ];
        doc.resources.resolution = Some(Resolution { horizontal : 300.0, vertical : 150.5, unit : model::ResolutionUnit::PixelsPerCentimeter });
        let back = load_psd(&save_psd(&doc).unwrap()).unwrap();
        assert_eq!(back.resources, doc.resources);
    }

    #[test]
    fn active_layer_is_stored_bottom_up()
    {
        let mut doc = PsdDocument::new(ColorMode::Grayscale, 1, 1, 1);
        for name in ["top", "middle", "bottom"]
        {
            doc.layers.push(Layer
            {
                info : model::LayerInfo { name : name.to_string(), rect : Rect::from_size(0, 0, 1, 1), ..Default::default() },
                channels : vec![model::Channel { kind : model::ChannelKind::Color(0), data : vec![0] }],
            });
        }
        doc.resources.active_layer = Some(0);
        let mut w = ByteWriter::new();
        write_resources(&mut w, &doc).unwrap();
        let bytes = w.into_inner();
        // 8BIM, id, empty name, size 2, value
        let mut c = SliceCursor::new(&bytes);
        c.skip(4).unwrap();
        assert_eq!(c.read_u16().unwrap(), RES_ACTIVE_LAYER);
        c.skip(2).unwrap();
        assert_eq!(c.read_u32().unwrap(), 2);
        assert_eq!(c.read_u16().unwrap(), 2);

        let back = load_psd(&save_psd(&doc).unwrap()).unwrap();
        assert_eq!(back.resources.active_layer, Some(0));
        assert_eq!(back.layers[0].info.name, "top");
    }

    #[test]
    fn merged_image_shares_one_row_table()
    {
        let mut doc = PsdDocument::new(ColorMode::Rgb, 16, 2, 3);
        doc.composite[1] = (0..32).collect();
        let bytes = save_psd(&doc).unwrap();
        // color mode, resources and layer section are all empty
        let mut c = SliceCursor::new(&bytes[38..]);
        assert_eq!(c.read_u16().unwrap(), 1);
        let table : Vec<u16> = (0..6).map(|_| c.read_u16().unwrap()).collect();
        assert_eq!(table, vec![2, 2, 17, 17, 2, 2]);
        assert_eq!(c.remaining(), 42);
        assert_eq!(load_psd(&bytes).unwrap(), doc);
    }

    #[test]
    fn invalid_documents_are_refused()
    {
        let mut doc = PsdDocument::new(ColorMode::Rgb, 2, 2, 3);
        doc.composite[0].push(0);
        assert!(matches!(save_psd(&doc), Err(PsdError::InvalidDocument(_))));

        let doc = PsdDocument::new(ColorMode::Rgb, 2, 2, model::MAX_CHANNELS + 1);
        assert!(matches!(save_psd(&doc), Err(PsdError::FormatLimitExceeded { .. })));

        let mut doc = PsdDocument::new(ColorMode::Grayscale, 1, 1, 1);
        doc.merged_alpha = true;
        assert!(matches!(save_psd(&doc), Err(PsdError::InvalidDocument(_))));
    }

    #[test]
    fn write_psd_matches_save_psd()
    {
        let doc = PsdDocument::new(ColorMode::Indexed, 4, 4, 1);
        let mut out = Vec::new();
        write_psd(&doc, &mut out).unwrap();
        assert_eq!(out, save_psd(&doc).unwrap());
        assert_eq!(crate::read::read_psd(out.as_slice()).unwrap(), doc);
    }
}
