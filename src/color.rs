//! Palette layout changes, index remapping, and conversion of planes to RGBA.

use crate::error::{PsdError, Result};
use crate::model::ColorMode;

/// Subtractive CMYK to RGB over ink amounts (0 = no ink, 255 = full ink).
///
/// PSD stores CMYK planes the other way around (255 = no ink); [planes_to_rgba] inverts them before calling this.
pub fn cmyk_to_rgb(c : u8, m : u8, y : u8, k : u8) -> (u8, u8, u8)
{
    let channel = |ink : u8| (255 - (ink as u16 + k as u16).min(255)) as u8;
    (channel(c), channel(m), channel(y))
}

/// Turn the 768-byte color mode data of an indexed image (all reds, then all greens, then all blues) into 256 RGB triplets.
pub fn planar_to_interleaved(planar : &[u8]) -> Result<Vec<[u8; 3]>>
{
    if planar.len() != 768
    {
        return Err(PsdError::CorruptData(format!("indexed color table is {} bytes, expected 768", planar.len())));
    }
    Ok((0..256).map(|i| [planar[i], planar[i + 256], planar[i + 512]]).collect())
}

/// Inverse of [planar_to_interleaved].
pub fn interleaved_to_planar(palette : &[[u8; 3]]) -> Vec<u8>
{
    let mut planar = vec![0u8; palette.len() * 3];
    for (i, rgb) in palette.iter().enumerate()
    {
        for (c, &v) in rgb.iter().enumerate()
        {
            planar[c * palette.len() + i] = v;
        }
    }
    planar
}

/// Swap palette entries 0 and `transparent_index`.
///
/// Returns the permutation pixel values must go through to keep showing the same colors: `map[old] == new`.
pub fn remap_indexed_for_transparency(palette : &mut [[u8; 3]], transparent_index : u8) -> [u8; 256]
{
    let mut map = [0u8; 256];
    for (i, slot) in map.iter_mut().enumerate()
    {
        *slot = i as u8;
    }
    let t = transparent_index as usize;
    if t < palette.len()
    {
        palette.swap(0, t);
        map.swap(0, t);
    }
    map
}

pub fn apply_index_map(pixels : &mut [u8], map : &[u8; 256])
{
    for p in pixels.iter_mut()
    {
        *p = map[*p as usize];
    }
}

pub fn invert_index_map(map : &[u8; 256]) -> [u8; 256]
{
    let mut inverse = [0u8; 256];
    for (old, &new) in map.iter().enumerate()
    {
        inverse[new as usize] = old as u8;
    }
    inverse
}

/// Interleave color planes (and optionally an alpha plane) into RGBA.
///
/// `planes` holds the mode's base channels in order. Indexed images look colors up in `palette`, and pixels equal to `transparent_index` come out fully transparent.
pub fn planes_to_rgba(mode : ColorMode, planes : &[&[u8]], alpha : Option<&[u8]>, palette : &[[u8; 3]], transparent_index : Option<u16>, pixels : usize) -> Result<Vec<u8>>
{
    let base = mode.base_channel_count() as usize;
    if planes.len() < base
    {
        return Err(PsdError::InvalidDocument(format!("{:?} needs {} planes, got {}", mode, base, planes.len())));
    }
    if let Some(short) = planes.iter().chain(alpha.iter()).find(|p| p.len() < pixels)
    {
        return Err(PsdError::InvalidDocument(format!("plane of {} bytes for {} pixels", short.len(), pixels)));
    }
    let mut rgba = vec![255u8; pixels * 4];
    for (i, px) in rgba.chunks_exact_mut(4).enumerate()
    {
        let (r, g, b) = match mode
        {
            ColorMode::Grayscale => (planes[0][i], planes[0][i], planes[0][i]),
            ColorMode::Rgb => (planes[0][i], planes[1][i], planes[2][i]),
            ColorMode::Cmyk => cmyk_to_rgb(255 - planes[0][i], 255 - planes[1][i], 255 - planes[2][i], 255 - planes[3][i]),
            ColorMode::Indexed =>
            {
                let index = planes[0][i];
                if transparent_index == Some(index as u16)
                {
                    px[3] = 0;
                }
                let [r, g, b] = palette.get(index as usize).copied().unwrap_or([0, 0, 0]);
                (r, g, b)
            }
            other => return Err(PsdError::UnsupportedFormat(format!("{:?} images cannot be converted to RGB", other))),
        };
        px[0] = r;
        px[1] = g;
        px[2] = b;
        if let Some(a) = alpha
        {
            px[3] = px[3].min(a[i]);
        }
    }
    Ok(rgba)
}
