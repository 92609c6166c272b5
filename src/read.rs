//! PSD decoding.
//!
//! Loading walks the file strictly front to back: header, color mode data, image resources, the layer and mask section, then the merged image.
//! Layers come out of two stages. [parse_layer_records] reads every layer record and remembers where each channel's data sits;
//! [decode_layer_pixels] then turns those positions into planes.

use std::io::Read;

use tracing::{debug, trace, warn};

use crate::color;
use crate::cursor::SliceCursor;
use crate::error::{PsdError, Result};
use crate::model::{
    self, BlendMode, Channel, ChannelKind, ChannelRecord, ColorMode, Guide, GuideOrientation, ImageResources, Layer, LayerInfo,
    LayerMask, LayerRecord, Limits, PsdDocument, PsdHeader, Rect, Resolution, ResolutionUnit,
};
use crate::packbits;

pub (crate) const FILE_SIGNATURE : [u8; 4] = *b"8BPS";
pub (crate) const BLOCK_SIGNATURE : [u8; 4] = *b"8BIM";
const BLOCK_SIGNATURE_64 : [u8; 4] = *b"8B64";

pub (crate) const RES_RESOLUTION : u16 = 0x03ED;
pub (crate) const RES_CHANNEL_NAMES : u16 = 0x03EE;
pub (crate) const RES_CAPTION : u16 = 0x03F0;
pub (crate) const RES_ACTIVE_LAYER : u16 = 0x0400;
pub (crate) const RES_GUIDES : u16 = 0x0408;
pub (crate) const RES_TRANSPARENT_INDEX : u16 = 0x0417;

/// Smallest mask record that still holds a rectangle, a default color and flags.
const MIN_MASK_RECORD : usize = 18;
/// Mask record holding a vector mask ahead of the pixel mask.
const DUAL_MASK_RECORD : usize = 36;

/// Load a whole PSD file held in memory, with the default [Limits].
pub fn load_psd(data : &[u8]) -> Result<PsdDocument>
{
    load_psd_with_limits(data, &Limits::default())
}

/// Load a whole PSD file held in memory.
///
/// Fails on the first problem found; there is no partially loaded document.
pub fn load_psd_with_limits(data : &[u8], limits : &Limits) -> Result<PsdDocument>
{
    let mut cursor = SliceCursor::new(data);

    let header = read_header(&mut cursor, limits)?;
    debug!(channels = header.channels, rows = header.rows, columns = header.columns, mode = ?header.mode, "read PSD header");

    let palette = read_color_mode_data(&mut cursor, header.mode)?;
    let mut resources = read_resources(&mut cursor, limits)?;
    let section = read_layer_section(&mut cursor, limits)?;
    debug!(layers = section.records.len(), merged_alpha = section.merged_alpha, "read layer records");

    let layers = decode_layer_pixels(data, section.records)?;
    let composite = read_merged_image(&mut cursor, &header)?;

    if let Some(active) = resources.active_layer
    {
        resources.active_layer = model::flip_index(layers.len(), active as usize).map(|i| i as u16);
        if resources.active_layer.is_none()
        {
            warn!(active, layers = layers.len(), "active layer index is out of range, dropping it");
        }
    }

    Ok(PsdDocument
    {
        header,
        palette,
        resources,
        layers : model::from_file_order(layers),
        merged_alpha : section.merged_alpha,
        composite,
    })
}

/// Buffer a whole stream, then [load_psd] it.
pub fn read_psd<R : Read>(mut reader : R) -> Result<PsdDocument>
{
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    load_psd(&data)
}

/// Read and check just the file header.
pub fn parse_psd_header(data : &[u8]) -> Result<PsdHeader>
{
    read_header(&mut SliceCursor::new(data), &Limits::default())
}

/// First layer stage: every layer record of a PSD file, bottom-most first as stored, with the position of each channel's data.
///
/// No pixel data is touched.
pub fn parse_layer_records(data : &[u8]) -> Result<Vec<LayerRecord>>
{
    let limits = Limits::default();
    let mut cursor = SliceCursor::new(data);
    read_header(&mut cursor, &limits)?;
    skip_block(&mut cursor)?;
    skip_block(&mut cursor)?;
    Ok(read_layer_section(&mut cursor, &limits)?.records)
}

/// Second layer stage: decode the channels of each record out of the same file data [parse_layer_records] ran over.
///
/// Layers keep the order of `records`.
pub fn decode_layer_pixels(data : &[u8], records : Vec<LayerRecord>) -> Result<Vec<Layer>>
{
    let mut layers = Vec::with_capacity(records.len());
    for record in records
    {
        let mut channels = Vec::with_capacity(record.channels.len());
        for channel in &record.channels
        {
            let rect = record.info.channel_rect(channel.kind);
            let stored = data
                .get(channel.offset..channel.offset.saturating_add(channel.length as usize))
                .ok_or(PsdError::Truncated { needed : channel.length as usize, available : data.len().saturating_sub(channel.offset) })?;
            let plane = decode_channel(stored, rect.width() as usize, rect.height() as usize)
                .map_err(|err| annotate(err, &record.info.name, channel.kind))?;
            channels.push(Channel { kind : channel.kind, data : plane });
        }
        layers.push(Layer { info : record.info, channels });
    }
    Ok(layers)
}

fn annotate(err : PsdError, layer : &str, kind : ChannelKind) -> PsdError
{
    match err
    {
        PsdError::CorruptData(msg) => PsdError::CorruptData(format!("layer '{}' channel {:?}: {}", layer, kind, msg)),
        other => other,
    }
}

fn read_header(cursor : &mut SliceCursor, limits : &Limits) -> Result<PsdHeader>
{
    let signature = cursor.read_b4()?;
    if signature != FILE_SIGNATURE
    {
        return Err(PsdError::InvalidSignature(format!("file starts with {:?}, not 8BPS", String::from_utf8_lossy(&signature))));
    }
    let version = cursor.read_u16()?;
    if version != 1
    {
        return Err(PsdError::InvalidSignature(format!("version {} (only version 1 is PSD)", version)));
    }
    cursor.skip(6)?;

    let channels = cursor.read_u16()?;
    let rows = cursor.read_u32()?;
    let columns = cursor.read_u32()?;
    let depth = cursor.read_u16()?;
    let mode_id = cursor.read_u16()?;

    if depth != 8
    {
        return Err(PsdError::UnsupportedFormat(format!("{} bits per channel", depth)));
    }
    let mode = ColorMode::from_u16(mode_id).ok_or_else(|| PsdError::UnsupportedFormat(format!("unknown color mode {}", mode_id)))?;
    if !mode.can_read()
    {
        return Err(PsdError::UnsupportedFormat(format!("{:?} images", mode)));
    }
    limits.check_channels("channel count", channels)?;
    if channels < mode.base_channel_count()
    {
        return Err(PsdError::CorruptData(format!("{:?} image with only {} channels", mode, channels)));
    }
    if rows == 0 || columns == 0
    {
        return Err(PsdError::CorruptData(format!("{}x{} canvas", columns, rows)));
    }
    limits.check_dimension("image height", rows)?;
    limits.check_dimension("image width", columns)?;

    Ok(PsdHeader { channels, rows, columns, depth, mode })
}

fn skip_block(cursor : &mut SliceCursor) -> Result<()>
{
    let len = cursor.read_u32()? as usize;
    cursor.skip(len)
}

fn read_color_mode_data(cursor : &mut SliceCursor, mode : ColorMode) -> Result<Vec<[u8; 3]>>
{
    let len = cursor.read_u32()? as usize;
    let data = cursor.read_bytes(len)?;
    if mode == ColorMode::Indexed
    {
        return color::planar_to_interleaved(data);
    }
    if len != 0
    {
        trace!(len, "skipping color mode data");
    }
    Ok(Vec::new())
}

fn read_resources(cursor : &mut SliceCursor, limits : &Limits) -> Result<ImageResources>
{
    let len = cursor.read_u32()? as usize;
    let mut block = cursor.take(len)?;
    let mut resources = ImageResources::default();
    debug!(len, "reading image resources");

    while !block.is_empty()
    {
        let signature = block.read_b4()?;
        if signature != BLOCK_SIGNATURE
        {
            return Err(PsdError::InvalidSignature(format!("image resource tagged {:?}, not 8BIM", String::from_utf8_lossy(&signature))));
        }
        let id = block.read_u16()?;
        let _name = block.read_pascal_string(2)?;
        let size = block.read_u32()? as usize;
        let mut payload = block.take(size)?;
        // the pad byte after an odd payload is sometimes left off the last resource
        if size % 2 == 1 && !block.is_empty()
        {
            block.skip(1)?;
        }

        match id
        {
            RES_CHANNEL_NAMES =>
            {
                while !payload.is_empty()
                {
                    resources.channel_names.push(payload.read_pascal_string(1)?.unwrap_or_default());
                }
            }
            RES_ACTIVE_LAYER => resources.active_layer = Some(payload.read_u16()?),
            RES_GUIDES => resources.guides = read_guides(&mut payload, limits)?,
            RES_RESOLUTION => resources.resolution = Some(read_resolution(&mut payload)?),
            RES_CAPTION => resources.caption = Some(payload.read_pascal_string(1)?.unwrap_or_default()),
            RES_TRANSPARENT_INDEX => resources.transparent_index = Some(payload.read_u16()?),
            _ => debug!("skipping image resource 0x{:04X} of {} bytes", id, size),
        }
    }
    Ok(resources)
}

/// Guide positions are stored scaled; the fourth and sixth header shorts hold the horizontal and vertical scale as `numerator << 8 | denominator`.
fn read_guides(payload : &mut SliceCursor, limits : &Limits) -> Result<Vec<Guide>>
{
    let mut magic = [0u16; 6];
    for m in magic.iter_mut()
    {
        *m = payload.read_u16()?;
    }
    let count = payload.read_u32()? as u64;
    limits.check_guides(count)?;
    if payload.remaining() as u64 != count * 5
    {
        return Err(PsdError::CorruptData(format!("{} guides in {} bytes of guide data", count, payload.remaining())));
    }

    let scale = |m : u16| -> Result<f64>
    {
        let denominator = m & 0xFF;
        if denominator == 0
        {
            return Err(PsdError::CorruptData(format!("guide scale 0x{:04X} divides by zero", m)));
        }
        Ok((m >> 8) as f64 / denominator as f64)
    };
    let horizontal_scale = scale(magic[3])?;
    let vertical_scale = scale(magic[5])?;

    let mut guides = Vec::with_capacity(count as usize);
    for _ in 0..count
    {
        let stored = payload.read_i32()?;
        let (orientation, scale) = if payload.read_u8()? == 1
        {
            (GuideOrientation::Horizontal, horizontal_scale)
        }
        else
        {
            (GuideOrientation::Vertical, vertical_scale)
        };
        guides.push(Guide { position : (stored as f64 * scale).round() as i32, orientation });
    }
    Ok(guides)
}

fn read_resolution(payload : &mut SliceCursor) -> Result<Resolution>
{
    let horizontal = payload.read_u32()? as f64 / 65536.0;
    let unit = ResolutionUnit::from_u16(payload.read_u16()?);
    let _width_unit = payload.read_u16()?;
    let vertical = payload.read_u32()? as f64 / 65536.0;
    Ok(Resolution { horizontal, vertical, unit })
}

struct LayerSection
{
    records : Vec<LayerRecord>,
    merged_alpha : bool,
}

fn read_layer_section(cursor : &mut SliceCursor, limits : &Limits) -> Result<LayerSection>
{
    let section_len = cursor.read_u32()? as usize;
    let section_start = cursor.position();
    let mut section = cursor.take(section_len)?;
    if section_len == 0
    {
        return Ok(LayerSection { records : Vec::new(), merged_alpha : false });
    }

    let info_len = section.read_u32()? as usize;
    let info_start = section_start + section.position();
    let mut info = section.take(info_len)?;
    // the global layer mask info and any tagged blocks after it are left to the section length
    if info_len == 0
    {
        return Ok(LayerSection { records : Vec::new(), merged_alpha : false });
    }

    let count = info.read_i16()?;
    let merged_alpha = count < 0;
    let count = count.unsigned_abs();
    limits.check_layers(count as u64)?;

    let mut records = Vec::with_capacity(count as usize);
    for index in 0..count
    {
        let record = read_layer_record(&mut info, limits)?;
        trace!(index, name = %record.info.name, channels = record.channels.len(), "read layer record");
        records.push(record);
    }

    // channel data follows the records in the same layer and channel order
    let info_end = info_start + info_len;
    let mut offset = info_start + info.position();
    for record in &mut records
    {
        for channel in &mut record.channels
        {
            channel.offset = offset;
            offset = offset.saturating_add(channel.length as usize);
        }
    }
    if offset > info_end
    {
        return Err(PsdError::CorruptData(format!("layer channel data runs to 0x{:X}, past the end of layer info at 0x{:X}", offset, info_end)));
    }
    Ok(LayerSection { records, merged_alpha })
}

fn read_rect(cursor : &mut SliceCursor) -> Result<Rect>
{
    let top = cursor.read_i32()?;
    let left = cursor.read_i32()?;
    let bottom = cursor.read_i32()?;
    let right = cursor.read_i32()?;
    Ok(Rect { top, left, bottom, right })
}

fn read_layer_record(cursor : &mut SliceCursor, limits : &Limits) -> Result<LayerRecord>
{
    let rect = read_rect(cursor)?;
    rect.validate("layer", limits, PsdError::CorruptData)?;

    let channel_count = cursor.read_u16()?;
    limits.check_channels("layer channel count", channel_count)?;
    let mut channels = Vec::with_capacity(channel_count as usize);
    for _ in 0..channel_count
    {
        let kind = ChannelKind::from_id(cursor.read_i16()?)?;
        let length = cursor.read_u32()?;
        channels.push(ChannelRecord { kind, length, offset : 0 });
    }

    let signature = cursor.read_b4()?;
    if signature != BLOCK_SIGNATURE
    {
        return Err(PsdError::InvalidSignature("layer blend mode signature is not 8BIM".to_string()));
    }
    let key = cursor.read_b4()?;
    let blend_mode = BlendMode::from_key(&key).unwrap_or_else(||
    {
        warn!(key = %String::from_utf8_lossy(&key), "unknown blend mode, using normal");
        BlendMode::Normal
    });
    let opacity = cursor.read_u8()?;
    let clipping = cursor.read_u8()?;
    let flags = cursor.read_u8()?;
    let _filler = cursor.read_u8()?;

    let extra_len = cursor.read_u32()? as usize;
    let mut extra = cursor.take(extra_len)?;

    let mask_len = extra.read_u32()? as usize;
    let mut mask_data = extra.take(mask_len)?;
    let mask = match mask_len
    {
        0 => None,
        n if n < MIN_MASK_RECORD => return Err(PsdError::CorruptData(format!("layer mask record of {} bytes", n))),
        n if n >= DUAL_MASK_RECORD =>
        {
            // vector mask first; the pixel mask's color, flags and rectangle follow it
            let _vector_rect = read_rect(&mut mask_data)?;
            mask_data.skip(2)?;
            let default_color = mask_data.read_u8()?;
            let flags = mask_data.read_u8()?;
            let rect = read_rect(&mut mask_data)?;
            Some(LayerMask { rect, default_color, flags })
        }
        _ =>
        {
            let rect = read_rect(&mut mask_data)?;
            let default_color = mask_data.read_u8()?;
            let flags = mask_data.read_u8()?;
            Some(LayerMask { rect, default_color, flags })
        }
    };
    let mask = mask.map(|mask| widen_empty_mask(mask, rect, &channels));
    if let Some(mask) = &mask
    {
        mask.rect.validate("layer mask", limits, PsdError::CorruptData)?;
    }

    let ranges_len = extra.read_u32()? as usize;
    extra.skip(ranges_len)?;

    let mut name = extra.read_pascal_string(4)?.unwrap_or_default();

    while !extra.is_empty()
    {
        let signature = extra.read_b4()?;
        if signature != BLOCK_SIGNATURE && signature != BLOCK_SIGNATURE_64
        {
            return Err(PsdError::InvalidSignature(format!("layer '{}' extra data tagged {:?}", name, String::from_utf8_lossy(&signature))));
        }
        let key = extra.read_b4()?;
        let len = extra.read_u32()? as usize;
        let mut block = extra.take(len)?;
        match &key
        {
            b"luni" => name = read_unicode_name(&mut block)?,
            _ => trace!(key = %String::from_utf8_lossy(&key), len, "skipping layer extra data"),
        }
    }

    if mask.is_none() && channels.iter().any(|c| c.kind == ChannelKind::LayerMask)
    {
        return Err(PsdError::CorruptData(format!("layer '{}' has a mask channel but no mask record", name)));
    }

    let info = LayerInfo
    {
        name,
        rect,
        blend_mode,
        opacity,
        clipping,
        preserve_transparency : flags & 1 != 0,
        visible : flags & 2 == 0,
        mask,
    };
    Ok(LayerRecord { info, channels })
}

/// A mask record with no width or height whose channel still carries pixels covers the layer along that axis.
fn widen_empty_mask(mut mask : LayerMask, layer : Rect, channels : &[ChannelRecord]) -> LayerMask
{
    let has_pixels = channels.iter().any(|c| c.kind == ChannelKind::LayerMask && c.length > 2);
    if !has_pixels || (mask.rect.width() != 0 && mask.rect.height() != 0)
    {
        return mask;
    }
    if mask.rect.top == mask.rect.bottom
    {
        mask.rect.top = layer.top;
        mask.rect.bottom = layer.bottom;
    }
    if mask.rect.left == mask.rect.right
    {
        mask.rect.left = layer.left;
        mask.rect.right = layer.right;
    }
    debug!(rect = ?mask.rect, "empty layer mask rectangle with mask data, using the layer's");
    mask
}

fn read_unicode_name(block : &mut SliceCursor) -> Result<String>
{
    let len = block.read_u32()? as usize;
    if len.saturating_mul(2) > block.remaining()
    {
        return Err(PsdError::CorruptData(format!("unicode layer name of {} characters in {} bytes", len, block.remaining())));
    }
    let units = (0..len).map(|_| block.read_u16()).collect::<Result<Vec<u16>>>()?;
    let mut name = String::from_utf16_lossy(&units);
    if name.ends_with('\0')
    {
        name.pop();
    }
    Ok(name)
}

/// Decode one stored channel: a compression id, then raw bytes or a row table and PackBits rows.
///
/// The stored length has to be used up exactly.
fn decode_channel(stored : &[u8], width : usize, height : usize) -> Result<Vec<u8>>
{
    let mut cursor = SliceCursor::new(stored);
    let compression = cursor.read_u16()?;
    let plane = match compression
    {
        0 => cursor.read_bytes(width * height)?.to_vec(),
        1 =>
        {
            let rows = read_row_lengths(&mut cursor, height)?;
            decode_rows(&mut cursor, &rows, width)?
        }
        n => return Err(PsdError::UnsupportedFormat(format!("compression method {}", n))),
    };
    trace!(compression, width, height, "decoded channel");
    if !cursor.is_empty()
    {
        return Err(PsdError::CorruptData(format!("{} bytes left over after channel data", cursor.remaining())));
    }
    Ok(plane)
}

fn read_row_lengths(cursor : &mut SliceCursor, rows : usize) -> Result<Vec<u16>>
{
    if rows.saturating_mul(2) > cursor.remaining()
    {
        return Err(PsdError::Truncated { needed : rows.saturating_mul(2), available : cursor.remaining() });
    }
    (0..rows).map(|_| cursor.read_u16()).collect()
}

/// Decode PackBits rows whose stored lengths are listed in `rows`, each expanding to `width` bytes.
fn decode_rows(cursor : &mut SliceCursor, rows : &[u16], width : usize) -> Result<Vec<u8>>
{
    let mut plane = Vec::new();
    for &len in rows
    {
        let row = cursor.read_bytes(len as usize)?;
        let used = packbits::decode_into(row, width, &mut plane)?;
        if used != row.len()
        {
            trace!(used, stored = row.len(), "row has trailing bytes");
        }
    }
    Ok(plane)
}

/// The flattened image: one compression id for everything, and with RLE a single row table covering every channel ahead of all row data.
fn read_merged_image(cursor : &mut SliceCursor, header : &PsdHeader) -> Result<Vec<Vec<u8>>>
{
    let width = header.columns as usize;
    let height = header.rows as usize;
    let channels = header.channels as usize;
    let compression = cursor.read_u16()?;
    debug!(compression, "reading merged image");
    match compression
    {
        0 => (0..channels).map(|_| cursor.read_bytes(width * height).map(|plane| plane.to_vec())).collect(),
        1 =>
        {
            let rows = read_row_lengths(cursor, channels * height)?;
            rows.chunks(height).map(|channel_rows| decode_rows(cursor, channel_rows, width)).collect()
        }
        n => Err(PsdError::UnsupportedFormat(format!("merged image compression method {}", n))),
    }
}
