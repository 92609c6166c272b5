//! psd-codec reads and writes layered 8-bit Photoshop (PSD) files. Loading gives you a [PsdDocument] with the header, the palette of indexed images, a handful of image resources (channel names, the active layer, guides, resolution, caption, the transparent palette index), every layer with its decoded channels and mask, and the flattened merged image. Saving takes the same struct and produces a file Photoshop opens, compressing each channel with PackBits whenever that is smaller than storing it raw.
//!
//! psd-codec reads Grayscale, Indexed, RGB and CMYK images, and writes Grayscale, Indexed and RGB. It does not support 16- or 32-bit channels, the large document PSB variant, adjustment layers, layer effects, or text layers. Image resources it does not understand are dropped on load.
//!
//! Layers in [PsdDocument::layers] run top-most first, the way a layer panel shows them, even though the file stores them the other way around.
//!
//! Untrusted files are bounded by [Limits]: too many layers, channels or guides, or a canvas that is too large, fail with [PsdError::FormatLimitExceeded] before anything large is allocated.
//!
//! You want [load_psd] and [save_psd].
//!
//! Example:
//!
//!```rs
//!let data = std::fs::read("image.psd").expect("Failed to open image.psd");
//!let doc = psd_codec::load_psd(&data).expect("Failed to parse image.psd");
//!for layer in &doc.layers
//!{
//!    println!("{} at {:?}, {} channels", layer.info.name, layer.info.rect, layer.channels.len());
//!}
//!std::fs::write("copy.psd", psd_codec::save_psd(&doc).expect("Failed to encode")).expect("Failed to write copy.psd");
//!```

#![allow(clippy::manual_range_contains)] // bad idiom
#![allow(clippy::field_reassign_with_default)] // bad idiom

pub mod color;
pub mod cursor;
pub mod error;
pub mod model;
pub mod packbits;
pub mod read;
pub mod write;

pub use error::{PsdError, Result};
pub use model::{
    BlendMode, Channel, ChannelKind, ChannelRecord, ColorMode, Guide, GuideOrientation, ImageResources, Layer, LayerInfo, LayerMask,
    LayerRecord, Limits, PsdDocument, PsdHeader, Rect, Resolution, ResolutionUnit, MAX_CHANNELS, MAX_GUIDES, MAX_IMAGE_DIMENSION,
    MAX_LAYERS,
};
pub use read::{decode_layer_pixels, load_psd, load_psd_with_limits, parse_layer_records, parse_psd_header, read_psd};
pub use write::{save_psd, save_psd_with_limits, write_psd};
