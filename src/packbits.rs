//! PackBits run-length coding as used for PSD channel rows.
//!
//! Each control byte `n` (read as `i8`) is followed either by `n + 1` literal bytes (`n >= 0`) or by one byte repeated `1 - n` times (`n < 0`). `-128` is a no-op.

use crate::error::{PsdError, Result};

/// Longest run or literal stretch a single control byte can describe.
const MAX_RUN : usize = 128;

/// Decode `src` until `expected` bytes have been produced, appending to `output`.
///
/// Returns how many bytes of `src` were consumed. No-op control bytes directly after the last needed byte are consumed too, so a row that ends on `0x80` still reads back as fully consumed.
pub fn decode_into(src : &[u8], expected : usize, output : &mut Vec<u8>) -> Result<usize>
{
    let target = output.len() + expected;
    output.reserve(expected.min(src.len().saturating_mul(MAX_RUN)));
    let mut i = 0;
    while output.len() < target
    {
        let Some(&control) = src.get(i) else
        {
            return Err(PsdError::CorruptData(format!("PackBits data ran out after {} of {} bytes", expected - (target - output.len()), expected)));
        };
        i += 1;
        let n = control as i8;
        if n >= 0
        {
            let count = n as usize + 1;
            if i + count > src.len()
            {
                return Err(PsdError::CorruptData("PackBits literal run is cut short".to_string()));
            }
            if output.len() + count > target
            {
                return Err(PsdError::CorruptData("PackBits literal run overruns the row".to_string()));
            }
            output.extend_from_slice(&src[i..i + count]);
            i += count;
        }
        else if n != -128
        {
            let count = (1 - n as i32) as usize;
            let Some(&value) = src.get(i) else
            {
                return Err(PsdError::CorruptData("PackBits repeat run is missing its value".to_string()));
            };
            i += 1;
            if output.len() + count > target
            {
                return Err(PsdError::CorruptData("PackBits repeat run overruns the row".to_string()));
            }
            output.extend(core::iter::repeat_n(value, count));
        }
    }
    while src.get(i) == Some(&0x80)
    {
        i += 1;
    }
    Ok(i)
}

/// Decode a PackBits stream into a fresh buffer of exactly `expected` bytes.
pub fn decode(src : &[u8], expected : usize) -> Result<Vec<u8>>
{
    let mut out = Vec::new();
    decode_into(src, expected, &mut out)?;
    Ok(out)
}

/// Encode one scanline.
///
/// Only runs of three or more equal bytes become repeat runs; shorter repeats would not shrink and stay in the surrounding literal.
pub fn encode_row(row : &[u8]) -> Vec<u8>
{
    let mut out = Vec::with_capacity(row.len() + row.len() / MAX_RUN + 1);
    let starts_run = |i : usize| i + 2 < row.len() && row[i] == row[i + 1] && row[i] == row[i + 2];
    let mut i = 0;
    while i < row.len()
    {
        if starts_run(i)
        {
            let mut run = 3;
            while i + run < row.len() && run < MAX_RUN && row[i + run] == row[i]
            {
                run += 1;
            }
            out.push((1 - run as i32) as i8 as u8);
            out.push(row[i]);
            i += run;
        }
        else
        {
            let start = i;
            i += 1;
            while i < row.len() && i - start < MAX_RUN && !starts_run(i)
            {
                i += 1;
            }
            out.push((i - start - 1) as u8);
            out.extend_from_slice(&row[start..i]);
        }
    }
    out
}

/// A plane compressed one scanline at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedRows
{
    /// All compressed rows back to back.
    pub data : Vec<u8>,
    /// Compressed byte length of each row.
    pub row_lengths : Vec<usize>,
}

impl EncodedRows
{
    /// Size on disk including the `u16` per-row length table.
    pub fn stored_len(&self) -> usize
    {
        self.data.len() + 2 * self.row_lengths.len()
    }
}

/// Encode a `width * rows` plane row by row.
pub fn encode_rows(plane : &[u8], width : usize, rows : usize) -> EncodedRows
{
    let mut encoded = EncodedRows::default();
    if width == 0
    {
        encoded.row_lengths = vec![0; rows];
        return encoded;
    }
    for row in plane.chunks(width).take(rows)
    {
        let packed = encode_row(row);
        encoded.row_lengths.push(packed.len());
        encoded.data.extend_from_slice(&packed);
    }
    encoded
}

/// How a channel ends up being stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Encoded<'a>
{
    Raw(&'a [u8]),
    Rle(EncodedRows),
}

impl Encoded<'_>
{
    /// The compression id PSD stores in front of channel data.
    pub fn compression_id(&self) -> u16
    {
        match self
        {
            Encoded::Raw(_) => 0,
            Encoded::Rle(_) => 1,
        }
    }
}

/// Pick whichever of raw or RLE storage is smaller for one plane.
///
/// RLE has to beat the raw size including its row table, and every row has to fit the table's `u16` slots.
pub fn choose_encoding(plane : &[u8], width : usize, rows : usize) -> Encoded<'_>
{
    let rle = encode_rows(plane, width, rows);
    let fits = rle.row_lengths.iter().all(|&len| len <= u16::MAX as usize);
    if fits && rle.stored_len() < plane.len()
    {
        Encoded::Rle(rle)
    }
    else
    {
        Encoded::Raw(plane)
    }
}
