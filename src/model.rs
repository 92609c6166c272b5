//! In-memory PSD document.
//!
//! Stability promise: every field of every struct in this module is public, and structs are safe to initialize with `{ ..., ..Default::default() }`.

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

use crate::color;
use crate::error::{PsdError, Result};

/// Default cap on the number of layers a document may have.
pub const MAX_LAYERS : u16 = 100;
/// Default cap on the channel count of the document and of each layer.
pub const MAX_CHANNELS : u16 = 30;
/// Default cap on the number of guides.
pub const MAX_GUIDES : u32 = 200;
/// Default cap on canvas and layer width and height. Version 1 PSD files cannot be bigger than this.
pub const MAX_IMAGE_DIMENSION : u32 = 30000;

/// Bounds that keep memory use predictable for untrusted input.
///
/// Going over one of these is [PsdError::FormatLimitExceeded] when loading and when saving.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits
{
    pub max_layers : u16,
    pub max_channels : u16,
    pub max_guides : u32,
    pub max_dimension : u32,
}

impl Default for Limits
{
    fn default() -> Self
    {
        Self
        {
            max_layers : MAX_LAYERS,
            max_channels : MAX_CHANNELS,
            max_guides : MAX_GUIDES,
            max_dimension : MAX_IMAGE_DIMENSION,
        }
    }
}

impl Limits
{
    pub (crate) fn check_channels(&self, what : &'static str, count : u16) -> Result<()>
    {
        if count > self.max_channels
        {
            return Err(PsdError::limit(what, count, self.max_channels));
        }
        Ok(())
    }

    pub (crate) fn check_dimension(&self, what : &'static str, value : u32) -> Result<()>
    {
        if value > self.max_dimension
        {
            return Err(PsdError::limit(what, value, self.max_dimension));
        }
        Ok(())
    }

    pub (crate) fn check_layers(&self, count : u64) -> Result<()>
    {
        let limit = self.max_layers.min(i16::MAX as u16);
        if count > limit as u64
        {
            return Err(PsdError::limit("layer count", count, limit));
        }
        Ok(())
    }

    pub (crate) fn check_guides(&self, count : u64) -> Result<()>
    {
        if count > self.max_guides as u64
        {
            return Err(PsdError::limit("guide count", count, self.max_guides));
        }
        Ok(())
    }
}

/// PSD-wide color mode. See <https://www.adobe.com/devnet-apps/photoshop/fileformatashtml/#50577409_pgfId-1055726>
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorMode
{
    Bitmap,
    Grayscale,
    Indexed,
    #[default]
    Rgb,
    Cmyk,
    Multichannel,
    Duotone,
    Lab,
}

impl ColorMode
{
    pub fn from_u16(value : u16) -> Option<Self>
    {
        match value
        {
            0 => Some(ColorMode::Bitmap),
            1 => Some(ColorMode::Grayscale),
            2 => Some(ColorMode::Indexed),
            3 => Some(ColorMode::Rgb),
            4 => Some(ColorMode::Cmyk),
            7 => Some(ColorMode::Multichannel),
            8 => Some(ColorMode::Duotone),
            9 => Some(ColorMode::Lab),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16
    {
        match self
        {
            ColorMode::Bitmap => 0,
            ColorMode::Grayscale => 1,
            ColorMode::Indexed => 2,
            ColorMode::Rgb => 3,
            ColorMode::Cmyk => 4,
            ColorMode::Multichannel => 7,
            ColorMode::Duotone => 8,
            ColorMode::Lab => 9,
        }
    }

    /// Channels the mode needs before any alpha or auxiliary channel.
    pub fn base_channel_count(self) -> u16
    {
        match self
        {
            ColorMode::Bitmap | ColorMode::Grayscale | ColorMode::Indexed | ColorMode::Duotone | ColorMode::Multichannel => 1,
            ColorMode::Rgb | ColorMode::Lab => 3,
            ColorMode::Cmyk => 4,
        }
    }

    pub fn can_read(self) -> bool
    {
        matches!(self, ColorMode::Grayscale | ColorMode::Indexed | ColorMode::Rgb | ColorMode::Cmyk)
    }

    pub fn can_write(self) -> bool
    {
        matches!(self, ColorMode::Grayscale | ColorMode::Indexed | ColorMode::Rgb)
    }
}

/// Layer blend modes, with the four-byte keys PSD stores for them.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode
{
    /// Only meaningful on groups.
    PassThrough,
    #[default]
    Normal,
    Dissolve,
    Darken,
    Multiply,
    ColorBurn,
    LinearBurn,
    DarkerColor,
    Lighten,
    Screen,
    ColorDodge,
    LinearDodge,
    LighterColor,
    Overlay,
    SoftLight,
    HardLight,
    VividLight,
    LinearLight,
    PinLight,
    HardMix,
    Difference,
    Exclusion,
    Subtract,
    Divide,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

const BLEND_KEYS : [(BlendMode, &[u8; 4]); 28] = [
    (BlendMode::PassThrough, b"pass"),
    (BlendMode::Normal, b"norm"),
    (BlendMode::Dissolve, b"diss"),
    (BlendMode::Darken, b"dark"),
    (BlendMode::Multiply, b"mul "),
    (BlendMode::ColorBurn, b"idiv"),
    (BlendMode::LinearBurn, b"lbrn"),
    (BlendMode::DarkerColor, b"dkCl"),
    (BlendMode::Lighten, b"lite"),
    (BlendMode::Screen, b"scrn"),
    (BlendMode::ColorDodge, b"div "),
    (BlendMode::LinearDodge, b"lddg"),
    (BlendMode::LighterColor, b"lgCl"),
    (BlendMode::Overlay, b"over"),
    (BlendMode::SoftLight, b"sLit"),
    (BlendMode::HardLight, b"hLit"),
    (BlendMode::VividLight, b"vLit"),
    (BlendMode::LinearLight, b"lLit"),
    (BlendMode::PinLight, b"pLit"),
    (BlendMode::HardMix, b"hMix"),
    (BlendMode::Difference, b"diff"),
    (BlendMode::Exclusion, b"smud"),
    (BlendMode::Subtract, b"fsub"),
    (BlendMode::Divide, b"fdiv"),
    (BlendMode::Hue, b"hue "),
    (BlendMode::Saturation, b"sat "),
    (BlendMode::Color, b"colr"),
    (BlendMode::Luminosity, b"lum "),
];

impl BlendMode
{
    pub fn from_key(key : &[u8; 4]) -> Option<Self>
    {
        BLEND_KEYS.iter().find(|(_, k)| *k == key).map(|(mode, _)| *mode)
    }

    pub fn key(self) -> [u8; 4]
    {
        BLEND_KEYS.iter().find(|(mode, _)| *mode == self).map(|(_, k)| **k).unwrap_or(*b"norm")
    }
}

/// File-wide header fields.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PsdHeader
{
    /// Channels in the merged image, including alpha and auxiliary channels.
    pub channels : u16,
    /// Canvas height in pixels.
    pub rows : u32,
    /// Canvas width in pixels.
    pub columns : u32,
    /// Bits per channel. Only 8 is supported.
    pub depth : u16,
    pub mode : ColorMode,
}

impl Default for PsdHeader
{
    fn default() -> Self
    {
        Self { channels : 3, rows : 1, columns : 1, depth : 8, mode : ColorMode::Rgb }
    }
}

impl PsdHeader
{
    pub fn new(mode : ColorMode, columns : u32, rows : u32, channels : u16) -> Self
    {
        Self { channels, rows, columns, depth : 8, mode }
    }

    pub fn pixel_count(&self) -> usize
    {
        self.rows as usize * self.columns as usize
    }
}

#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GuideOrientation
{
    #[default]
    Vertical,
    Horizontal,
}

/// A ruler guide. Horizontal guides sit at a y coordinate, vertical ones at an x coordinate.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Guide
{
    /// Pixel position.
    pub position : i32,
    pub orientation : GuideOrientation,
}

#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolutionUnit
{
    #[default]
    PixelsPerInch,
    PixelsPerCentimeter,
}

impl ResolutionUnit
{
    pub fn from_u16(value : u16) -> Self
    {
        if value == 2 { ResolutionUnit::PixelsPerCentimeter } else { ResolutionUnit::PixelsPerInch }
    }

    pub fn to_u16(self) -> u16
    {
        match self
        {
            ResolutionUnit::PixelsPerInch => 1,
            ResolutionUnit::PixelsPerCentimeter => 2,
        }
    }
}

/// Print resolution. Stored as 16.16 fixed point, so only values representable that way survive a save exactly.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Resolution
{
    pub horizontal : f64,
    pub vertical : f64,
    pub unit : ResolutionUnit,
}

impl Default for Resolution
{
    fn default() -> Self
    {
        Self { horizontal : 72.0, vertical : 72.0, unit : ResolutionUnit::PixelsPerInch }
    }
}

/// The image resources this crate understands. Everything else in the resource block is dropped on load.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageResources
{
    /// Names of the merged image's alpha and auxiliary channels, in channel order. (0x03EE)
    pub channel_names : Vec<String>,
    /// Index into [PsdDocument::layers] of the layer the editor had selected. (0x0400)
    pub active_layer : Option<u16>,
    /// (0x0408)
    pub guides : Vec<Guide>,
    /// (0x03ED)
    pub resolution : Option<Resolution>,
    /// (0x03F0)
    pub caption : Option<String>,
    /// Palette entry that is fully transparent in an indexed image. (0x0417)
    pub transparent_index : Option<u16>,
}

/// An axis-aligned rectangle in canvas coordinates. `bottom` and `right` are exclusive.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect
{
    pub top : i32,
    pub left : i32,
    pub bottom : i32,
    pub right : i32,
}

impl Rect
{
    pub fn new(top : i32, left : i32, bottom : i32, right : i32) -> Self
    {
        Self { top, left, bottom, right }
    }

    /// Rectangle at (`left`, `top`) with the given size.
    pub fn from_size(left : i32, top : i32, width : u32, height : u32) -> Self
    {
        let height = i32::try_from(height).unwrap_or(i32::MAX);
        let width = i32::try_from(width).unwrap_or(i32::MAX);
        Self { top, left, bottom : top.saturating_add(height), right : left.saturating_add(width) }
    }

    pub fn width(&self) -> u32
    {
        (self.right as i64 - self.left as i64).max(0) as u32
    }

    pub fn height(&self) -> u32
    {
        (self.bottom as i64 - self.top as i64).max(0) as u32
    }

    pub fn area(&self) -> usize
    {
        self.width() as usize * self.height() as usize
    }

    /// Check the rectangle is not inverted and fits the dimension limit. `invalid` builds the error for an inverted one.
    pub (crate) fn validate(&self, what : &'static str, limits : &Limits, invalid : fn(String) -> PsdError) -> Result<()>
    {
        if self.bottom < self.top || self.right < self.left
        {
            return Err(invalid(format!("{} rectangle {:?} is inverted", what, self)));
        }
        limits.check_dimension(what, self.width())?;
        limits.check_dimension(what, self.height())
    }
}

/// What a channel holds.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind
{
    /// Color plane by position: R, G, B for RGB; C, M, Y, K for CMYK; the single plane for grayscale and indexed.
    Color(u16),
    /// Transparency. (-1)
    Alpha,
    /// Layer mask, laid out in the mask's own rectangle. (-2)
    LayerMask,
    /// User-supplied mask, laid out like [ChannelKind::LayerMask]. (-3)
    UserMask,
}

impl ChannelKind
{
    pub fn from_id(id : i16) -> Result<Self>
    {
        match id
        {
            -1 => Ok(ChannelKind::Alpha),
            -2 => Ok(ChannelKind::LayerMask),
            -3 => Ok(ChannelKind::UserMask),
            n if n >= 0 => Ok(ChannelKind::Color(n as u16)),
            n => Err(PsdError::CorruptData(format!("unknown channel id {}", n))),
        }
    }

    pub fn id(self) -> i16
    {
        match self
        {
            ChannelKind::Color(n) => n.min(i16::MAX as u16) as i16,
            ChannelKind::Alpha => -1,
            ChannelKind::LayerMask => -2,
            ChannelKind::UserMask => -3,
        }
    }

    pub fn is_mask(self) -> bool
    {
        matches!(self, ChannelKind::LayerMask | ChannelKind::UserMask)
    }
}

/// Where a layer's mask sits and how to interpret it.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerMask
{
    /// Independent of the owning layer's rectangle.
    pub rect : Rect,
    /// Value of the mask outside its rectangle. 0 or 255.
    pub default_color : u8,
    /// Bit 0: position relative to layer. Bit 1: mask disabled. Bit 2: invert mask when blending.
    pub flags : u8,
}

impl LayerMask
{
    pub fn is_disabled(&self) -> bool { self.flags & 2 != 0 }
    pub fn is_inverted(&self) -> bool { self.flags & 4 != 0 }
}

/// Everything about a layer except its pixel data.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerInfo
{
    pub name : String,
    pub rect : Rect,
    pub blend_mode : BlendMode,
    /// 0 is transparent, 255 is opaque.
    pub opacity : u8,
    /// 0 = base, anything else = clipped to the layer below.
    pub clipping : u8,
    /// Alpha lock. Flag bit 0.
    pub preserve_transparency : bool,
    /// Stored inverted in the file, as the "hidden" flag bit 1.
    pub visible : bool,
    pub mask : Option<LayerMask>,
}

impl LayerInfo
{
    /// The rectangle a channel of the given kind covers.
    pub fn channel_rect(&self, kind : ChannelKind) -> Rect
    {
        match (kind.is_mask(), &self.mask)
        {
            (true, Some(mask)) => mask.rect,
            _ => self.rect,
        }
    }

    pub (crate) fn flag_byte(&self) -> u8
    {
        (self.preserve_transparency as u8) | ((!self.visible as u8) << 1)
    }
}

/// Position of one channel's encoded data inside the file.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelRecord
{
    pub kind : ChannelKind,
    /// Stored byte length, including the two-byte compression id.
    pub length : u32,
    /// Absolute offset of the compression id.
    pub offset : usize,
}

/// A layer as described by its record in the layer info section, before any pixel data is decoded.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerRecord
{
    pub info : LayerInfo,
    pub channels : Vec<ChannelRecord>,
}

/// One decoded plane, one byte per pixel.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel
{
    pub kind : ChannelKind,
    /// `width * height` of [LayerInfo::channel_rect], row-major.
    pub data : Vec<u8>,
}

/// A layer with its channels decoded.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layer
{
    pub info : LayerInfo,
    /// In the order they are stored.
    pub channels : Vec<Channel>,
}

impl Layer
{
    pub fn channel(&self, kind : ChannelKind) -> Option<&Channel>
    {
        self.channels.iter().find(|c| c.kind == kind)
    }

    pub fn channel_mut(&mut self, kind : ChannelKind) -> Option<&mut Channel>
    {
        self.channels.iter_mut().find(|c| c.kind == kind)
    }

    /// The layer mask cropped and padded to the layer's own rectangle.
    ///
    /// Pixels the mask rectangle does not cover take the mask's default color. `None` if the layer has no mask channel.
    pub fn mask_in_layer_space(&self) -> Option<Vec<u8>>
    {
        let mask = self.info.mask.as_ref()?;
        let plane = self.channel(ChannelKind::LayerMask)?;
        let layer = self.info.rect;
        let (mw, mh) = (mask.rect.width() as i64, mask.rect.height() as i64);
        let mut out = vec![mask.default_color; layer.area()];
        for y in 0..layer.height() as i64
        {
            let my = layer.top as i64 + y - mask.rect.top as i64;
            if my < 0 || my >= mh
            {
                continue;
            }
            for x in 0..layer.width() as i64
            {
                let mx = layer.left as i64 + x - mask.rect.left as i64;
                if mx < 0 || mx >= mw
                {
                    continue;
                }
                if let Some(&v) = plane.data.get((my * mw + mx) as usize)
                {
                    out[(y * layer.width() as i64 + x) as usize] = v;
                }
            }
        }
        Some(out)
    }

    /// Interleaved RGBA for this layer, in the layer's rectangle.
    ///
    /// Missing color planes read as 0 and a missing alpha plane as opaque. An enabled layer mask scales alpha.
    pub fn to_rgba(&self, doc : &PsdDocument) -> Result<Vec<u8>>
    {
        let pixels = self.info.rect.area();
        let base = doc.header.mode.base_channel_count();
        let blank = vec![0u8; pixels];
        let planes : Vec<&[u8]> = (0..base)
            .map(|i| self.channel(ChannelKind::Color(i)).map(|c| c.data.as_slice()).unwrap_or(blank.as_slice()))
            .collect();
        let alpha = self.channel(ChannelKind::Alpha).map(|c| c.data.as_slice());
        let mut rgba = color::planes_to_rgba(doc.header.mode, &planes, alpha, &doc.palette, doc.resources.transparent_index, pixels)?;
        if let (Some(mask), Some(plane)) = (self.info.mask, self.mask_in_layer_space())
        {
            if !mask.is_disabled()
            {
                for (px, &m) in rgba.chunks_exact_mut(4).zip(plane.iter())
                {
                    let m = if mask.is_inverted() { 255 - m } else { m };
                    px[3] = ((px[3] as u16 * m as u16 + 127) / 255) as u8;
                }
            }
        }
        Ok(rgba)
    }
}

/// PSD lists layers bottom-most first, while [PsdDocument::layers] runs top-most first.
/// The reader and the writer go through these functions and nowhere else flips the order.
pub (crate) fn in_file_order<T>(stack : &[T]) -> impl Iterator<Item = &T>
{
    stack.iter().rev()
}

pub (crate) fn from_file_order<T>(mut file_order : Vec<T>) -> Vec<T>
{
    file_order.reverse();
    file_order
}

/// Map a layer index between stack order and file order. Its own inverse; `None` when out of range.
pub (crate) fn flip_index(len : usize, index : usize) -> Option<usize>
{
    (index < len).then(|| len - 1 - index)
}

/// A whole PSD file.
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PsdDocument
{
    pub header : PsdHeader,
    /// 256 RGB entries for indexed images, empty otherwise.
    pub palette : Vec<[u8; 3]>,
    pub resources : ImageResources,
    /// Top-most layer first. Empty for flat images.
    pub layers : Vec<Layer>,
    /// The merged image's first extra channel is its transparency. Stored as a negative layer count.
    pub merged_alpha : bool,
    /// The flattened image, one `columns * rows` plane per header channel.
    pub composite : Vec<Vec<u8>>,
}

impl PsdDocument
{
    /// A flat document with zeroed planes.
    pub fn new(mode : ColorMode, columns : u32, rows : u32, channels : u16) -> Self
    {
        let header = PsdHeader::new(mode, columns, rows, channels);
        Self
        {
            header,
            palette : if mode == ColorMode::Indexed { vec![[0; 3]; 256] } else { Vec::new() },
            composite : vec![vec![0; header.pixel_count()]; channels as usize],
            ..Default::default()
        }
    }

    /// Check everything the writer relies on.
    pub fn validate(&self, limits : &Limits) -> Result<()>
    {
        let header = &self.header;
        if header.depth != 8
        {
            return Err(PsdError::UnsupportedFormat(format!("{} bits per channel", header.depth)));
        }
        if !header.mode.can_write()
        {
            return Err(PsdError::UnsupportedFormat(format!("writing {:?} images", header.mode)));
        }
        limits.check_channels("channel count", header.channels)?;
        if header.channels < header.mode.base_channel_count()
        {
            return Err(PsdError::InvalidDocument(format!("{:?} needs at least {} channels, header has {}", header.mode, header.mode.base_channel_count(), header.channels)));
        }
        if header.rows == 0 || header.columns == 0
        {
            return Err(PsdError::InvalidDocument("canvas has no pixels".to_string()));
        }
        limits.check_dimension("image height", header.rows)?;
        limits.check_dimension("image width", header.columns)?;

        let palette_len = if header.mode == ColorMode::Indexed { 256 } else { 0 };
        if self.palette.len() != palette_len
        {
            return Err(PsdError::InvalidDocument(format!("palette has {} entries, expected {}", self.palette.len(), palette_len)));
        }
        if self.composite.len() != header.channels as usize
        {
            return Err(PsdError::InvalidDocument(format!("{} composite planes for {} channels", self.composite.len(), header.channels)));
        }
        if let Some(plane) = self.composite.iter().find(|p| p.len() != header.pixel_count())
        {
            return Err(PsdError::InvalidDocument(format!("composite plane of {} bytes, expected {}", plane.len(), header.pixel_count())));
        }

        limits.check_guides(self.resources.guides.len() as u64)?;
        limits.check_layers(self.layers.len() as u64)?;
        if self.merged_alpha && self.layers.is_empty()
        {
            return Err(PsdError::InvalidDocument("merged transparency is recorded in the layer count, so it needs at least one layer".to_string()));
        }
        if let Some(active) = self.resources.active_layer
        {
            if active as usize >= self.layers.len()
            {
                return Err(PsdError::InvalidDocument(format!("active layer {} of {} layers", active, self.layers.len())));
            }
        }
        for layer in &self.layers
        {
            validate_layer(layer, limits)?;
        }
        Ok(())
    }

    /// The merged image as interleaved RGBA.
    pub fn composite_rgba(&self) -> Result<Vec<u8>>
    {
        let base = self.header.mode.base_channel_count() as usize;
        if self.composite.len() < base
        {
            return Err(PsdError::InvalidDocument(format!("{} composite planes, {:?} needs {}", self.composite.len(), self.header.mode, base)));
        }
        let planes : Vec<&[u8]> = self.composite[..base].iter().map(|p| p.as_slice()).collect();
        let alpha = if self.merged_alpha { self.composite.get(base).map(|p| p.as_slice()) } else { None };
        color::planes_to_rgba(self.header.mode, &planes, alpha, &self.palette, self.resources.transparent_index, self.header.pixel_count())
    }

    /// Swap the transparent palette entry into slot 0, renumbering every indexed pixel to match.
    ///
    /// Returns the old-index-to-new-index map; [color::invert_index_map] undoes it.
    pub fn move_transparent_index_to_zero(&mut self) -> Result<[u8; 256]>
    {
        if self.header.mode != ColorMode::Indexed
        {
            return Err(PsdError::InvalidDocument("only indexed images have a transparent index".to_string()));
        }
        let index = self.resources.transparent_index.ok_or_else(|| PsdError::InvalidDocument("no transparent index set".to_string()))?;
        let index = u8::try_from(index).map_err(|_| PsdError::InvalidDocument(format!("transparent index {} is past the palette", index)))?;
        if self.palette.len() != 256
        {
            return Err(PsdError::InvalidDocument(format!("palette has {} entries", self.palette.len())));
        }
        let map = color::remap_indexed_for_transparency(&mut self.palette, index);
        if let Some(plane) = self.composite.first_mut()
        {
            color::apply_index_map(plane, &map);
        }
        for layer in &mut self.layers
        {
            if let Some(channel) = layer.channel_mut(ChannelKind::Color(0))
            {
                color::apply_index_map(&mut channel.data, &map);
            }
        }
        self.resources.transparent_index = Some(0);
        Ok(map)
    }
}

fn validate_layer(layer : &Layer, limits : &Limits) -> Result<()>
{
    let info = &layer.info;
    let count = u16::try_from(layer.channels.len()).unwrap_or(u16::MAX);
    limits.check_channels("layer channel count", count)?;
    info.rect.validate("layer", limits, PsdError::InvalidDocument)?;
    if let Some(mask) = &info.mask
    {
        mask.rect.validate("layer mask", limits, PsdError::InvalidDocument)?;
    }
    for channel in &layer.channels
    {
        if channel.kind == ChannelKind::LayerMask && info.mask.is_none()
        {
            return Err(PsdError::InvalidDocument(format!("layer '{}' has a mask channel but no mask record", info.name)));
        }
        let expected = info.channel_rect(channel.kind).area();
        if channel.data.len() != expected
        {
            return Err(PsdError::InvalidDocument(format!("layer '{}' channel {:?} has {} bytes, expected {}", info.name, channel.kind, channel.data.len(), expected)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_layer(rect : Rect) -> Layer
    {
        Layer
        {
            info : LayerInfo { name : "layer".to_string(), rect, opacity : 255, visible : true, ..Default::default() },
            channels : (0..3).map(|i| Channel { kind : ChannelKind::Color(i), data : vec![i as u8; rect.area()] }).collect(),
        }
    }

    #[test]
    fn blend_keys_round_trip()
    {
        for (mode, key) in BLEND_KEYS.iter()
        {
            assert_eq!(BlendMode::from_key(key), Some(*mode));
            assert_eq!(&mode.key(), *key);
        }
        assert_eq!(BlendMode::from_key(b"zzzz"), None);
    }

    #[test]
    fn channel_ids()
    {
        for id in [-3i16, -2, -1, 0, 1, 4]
        {
            assert_eq!(ChannelKind::from_id(id).unwrap().id(), id);
        }
        assert!(ChannelKind::from_id(-4).is_err());
    }

    #[test]
    fn flags_invert_visibility()
    {
        let mut info = LayerInfo { visible : true, ..Default::default() };
        assert_eq!(info.flag_byte(), 0);
        info.visible = false;
        info.preserve_transparency = true;
        assert_eq!(info.flag_byte(), 3);
    }

    #[test]
    fn mask_is_cropped_into_layer_space()
    {
        let mut layer = rgb_layer(Rect::from_size(10, 10, 4, 2));
        layer.info.mask = Some(LayerMask { rect : Rect::from_size(12, 9, 3, 2), default_color : 255, flags : 0 });
        layer.channels.push(Channel { kind : ChannelKind::LayerMask, data : vec![1, 2, 3, 4, 5, 6] });
        // mask row 1 lines up with layer row 0, mask columns 0..2 with layer columns 2..4
        assert_eq!(layer.mask_in_layer_space().unwrap(), vec![255, 255, 4, 5, 255, 255, 255, 255]);
    }

    #[test]
    fn mask_scales_layer_alpha()
    {
        let doc = PsdDocument::new(ColorMode::Rgb, 2, 1, 3);
        let mut layer = rgb_layer(Rect::from_size(0, 0, 2, 1));
        layer.info.mask = Some(LayerMask { rect : Rect::from_size(0, 0, 2, 1), default_color : 0, flags : 0 });
        layer.channels.push(Channel { kind : ChannelKind::LayerMask, data : vec![0, 255] });
        assert_eq!(layer.to_rgba(&doc).unwrap(), vec![0, 1, 2, 0, 0, 1, 2, 255]);

        layer.info.mask.as_mut().unwrap().flags = 2;
        assert_eq!(layer.to_rgba(&doc).unwrap(), vec![0, 1, 2, 255, 0, 1, 2, 255]);
    }

    #[test]
    fn file_order_flips_once()
    {
        let stack = vec!["top", "middle", "bottom"];
        let file : Vec<&str> = in_file_order(&stack).copied().collect();
        assert_eq!(file, ["bottom", "middle", "top"]);
        assert_eq!(from_file_order(file), stack);
        assert_eq!(flip_index(3, 0), Some(2));
        assert_eq!(flip_index(3, 2), Some(0));
        assert_eq!(flip_index(3, 3), None);
    }

    #[test]
    fn validation_catches_bad_buffers()
    {
        let limits = Limits::default();
        let mut doc = PsdDocument::new(ColorMode::Rgb, 4, 4, 3);
        doc.validate(&limits).unwrap();

        doc.layers.push(rgb_layer(Rect::from_size(0, 0, 2, 2)));
        doc.validate(&limits).unwrap();

        doc.layers[0].channels[1].data.pop();
        assert!(matches!(doc.validate(&limits), Err(PsdError::InvalidDocument(_))));

        let mut doc = PsdDocument::new(ColorMode::Rgb, 4, 4, 3);
        doc.composite.pop();
        assert!(matches!(doc.validate(&limits), Err(PsdError::InvalidDocument(_))));

        let doc = PsdDocument::new(ColorMode::Cmyk, 4, 4, 4);
        assert!(matches!(doc.validate(&limits), Err(PsdError::UnsupportedFormat(_))));
    }

    #[test]
    fn inverted_rectangles_are_invalid_documents()
    {
        let limits = Limits::default();
        let mut doc = PsdDocument::new(ColorMode::Rgb, 4, 4, 3);
        let mut layer = rgb_layer(Rect::from_size(0, 0, 0, 0));
        layer.info.rect = Rect::new(2, 0, 1, 0);
        doc.layers.push(layer);
        assert!(matches!(doc.validate(&limits), Err(PsdError::InvalidDocument(_))));

        let mut layer = rgb_layer(Rect::from_size(0, 0, 1, 1));
        layer.info.mask = Some(LayerMask { rect : Rect::new(0, 3, 0, 1), ..Default::default() });
        doc.layers = vec![layer];
        assert!(matches!(doc.validate(&limits), Err(PsdError::InvalidDocument(_))));
    }

    #[test]
    fn huge_sizes_saturate()
    {
        let rect = Rect::from_size(0, -5, u32::MAX, 0x8000_0000);
        assert_eq!(rect.right, i32::MAX);
        assert_eq!(rect.bottom, i32::MAX - 5);
        assert!(rect.bottom >= rect.top && rect.right >= rect.left);
    }

    #[test]
    fn validation_enforces_limits()
    {
        let limits = Limits { max_layers : 1, max_guides : 1, ..Default::default() };
        let mut doc = PsdDocument::new(ColorMode::Grayscale, 2, 2, 1);
        doc.resources.guides = vec![Guide::default(); 2];
        assert!(matches!(doc.validate(&limits), Err(PsdError::FormatLimitExceeded { what : "guide count", .. })));

        doc.resources.guides.clear();
        let gray = |name : &str| Layer
        {
            info : LayerInfo { name : name.to_string(), rect : Rect::from_size(0, 0, 1, 1), ..Default::default() },
            channels : vec![Channel { kind : ChannelKind::Color(0), data : vec![0] }],
        };
        doc.layers = vec![gray("a"), gray("b")];
        assert!(matches!(doc.validate(&limits), Err(PsdError::FormatLimitExceeded { what : "layer count", .. })));

        let doc = PsdDocument::new(ColorMode::Rgb, MAX_IMAGE_DIMENSION + 1, 1, 3);
        assert!(matches!(doc.validate(&Limits::default()), Err(PsdError::FormatLimitExceeded { .. })));
    }

    #[test]
    fn transparent_index_moves_to_zero()
    {
        let mut doc = PsdDocument::new(ColorMode::Indexed, 3, 1, 1);
        for (i, entry) in doc.palette.iter_mut().enumerate()
        {
            *entry = [i as u8, 0, 0];
        }
        doc.composite[0] = vec![0, 7, 3];
        doc.resources.transparent_index = Some(7);
        let map = doc.move_transparent_index_to_zero().unwrap();
        assert_eq!(doc.palette[0], [7, 0, 0]);
        assert_eq!(doc.palette[7], [0, 0, 0]);
        assert_eq!(doc.composite[0], vec![7, 0, 3]);
        assert_eq!(doc.resources.transparent_index, Some(0));

        let mut back = doc.composite[0].clone();
        color::apply_index_map(&mut back, &color::invert_index_map(&map));
        assert_eq!(back, vec![0, 7, 3]);
    }
}
