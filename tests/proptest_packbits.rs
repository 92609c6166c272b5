//! Property-based tests for PackBits coding and whole-document round trips.

use proptest::prelude::*;
use psd_codec::packbits::{self, Encoded};
use psd_codec::{
    load_psd, save_psd, BlendMode, Channel, ChannelKind, ColorMode, Guide, GuideOrientation, Layer, LayerInfo, LayerMask, PsdDocument, Rect,
};

// =============================================================================
// PackBits
// =============================================================================

/// Rows built from runs, so long repeats and short literals both show up.
fn runs() -> impl Strategy<Value = Vec<u8>>
{
    prop::collection::vec((any::<u8>(), 1usize..300), 0..12)
        .prop_map(|runs| runs.into_iter().flat_map(|(value, len)| std::iter::repeat_n(value, len)).collect())
}

proptest! {
    #[test]
    fn roundtrip_random_rows(row in prop::collection::vec(any::<u8>(), 0..2000)) {
        let packed = packbits::encode_row(&row);
        prop_assert_eq!(packbits::decode(&packed, row.len()).unwrap(), row);
    }

    #[test]
    fn roundtrip_run_heavy_rows(row in runs()) {
        let packed = packbits::encode_row(&row);
        prop_assert_eq!(packbits::decode(&packed, row.len()).unwrap(), row);
    }

    #[test]
    fn roundtrip_alternating_rows(a in any::<u8>(), b in any::<u8>(), len in 0usize..600) {
        let row : Vec<u8> = (0..len).map(|i| if i % 2 == 0 { a } else { b }).collect();
        let packed = packbits::encode_row(&row);
        prop_assert_eq!(packbits::decode(&packed, row.len()).unwrap(), row);
    }

    /// Encoded output never grows by more than one control byte per 128 input bytes.
    #[test]
    fn encoding_overhead_is_bounded(row in prop::collection::vec(any::<u8>(), 1..1000)) {
        let packed = packbits::encode_row(&row);
        prop_assert!(packed.len() <= row.len() + row.len().div_ceil(128));
    }

    /// No-op control bytes anywhere between runs change nothing.
    #[test]
    fn no_op_bytes_are_ignored(row in runs(), at in any::<prop::sample::Index>()) {
        let packed = packbits::encode_row(&row);
        let mut noisy = vec![0x80];
        noisy.extend_from_slice(&packed);
        noisy.push(0x80);
        let decoded = packbits::decode(&noisy, row.len()).unwrap();
        prop_assert_eq!(&decoded, &row);

        // a no-op inserted between control groups: find a boundary by decoding group by group
        let mut boundaries = vec![0];
        let mut i = 0;
        while i < packed.len()
        {
            let n = packed[i] as i8;
            i += if n >= 0 { n as usize + 2 } else { 2 };
            boundaries.push(i);
        }
        let cut = boundaries[at.index(boundaries.len())];
        let mut spliced = packed[..cut].to_vec();
        spliced.push(0x80);
        spliced.extend_from_slice(&packed[cut..]);
        prop_assert_eq!(packbits::decode(&spliced, row.len()).unwrap(), row);
    }

    /// Whatever the data, the chosen storage is never larger than raw.
    #[test]
    fn chosen_encoding_is_never_larger_than_raw(width in 1usize..40, rows in 1usize..20, seed in any::<u64>()) {
        let plane : Vec<u8> = (0..width * rows)
            .map(|i| ((seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64 / 3)) >> 56) as u8)
            .collect();
        match packbits::choose_encoding(&plane, width, rows)
        {
            Encoded::Raw(raw) => {
                prop_assert_eq!(raw, plane.as_slice());
            }
            Encoded::Rle(rle) => {
                prop_assert!(rle.stored_len() < plane.len());
                prop_assert_eq!(rle.row_lengths.len(), rows);
            }
        }
    }
}

// =============================================================================
// Documents
// =============================================================================

fn plane(len : usize) -> impl Strategy<Value = Vec<u8>>
{
    prop_oneof![
        prop::collection::vec(any::<u8>(), len),
        any::<u8>().prop_map(move |v| vec![v; len]),
    ]
}

fn blend_mode() -> impl Strategy<Value = BlendMode>
{
    prop::sample::select(vec![BlendMode::Normal, BlendMode::Multiply, BlendMode::Screen, BlendMode::Overlay, BlendMode::PassThrough, BlendMode::Luminosity])
}

fn layer(mode : ColorMode) -> impl Strategy<Value = Layer>
{
    let base = mode.base_channel_count();
    (
        ("[a-zA-Z0-9 ]{0,20}", -4i32..8, -4i32..8, 0u32..6, 0u32..6),
        (blend_mode(), any::<u8>(), 0u8..2, any::<bool>(), any::<bool>()),
        any::<bool>(),
        prop::option::of((0i32..4, 0i32..4, 1u32..4, 1u32..4, prop::sample::select(vec![0u8, 255]), 0u8..8)),
    )
        .prop_flat_map(move |((name, left, top, w, h), (blend_mode, opacity, clipping, preserve_transparency, visible), alpha, mask)| {
            let rect = Rect::from_size(left, top, w, h);
            let mask = mask.map(|(ml, mt, mw, mh, default_color, flags)| LayerMask { rect : Rect::from_size(ml, mt, mw, mh), default_color, flags });
            let info = LayerInfo { name, rect, blend_mode, opacity, clipping, preserve_transparency, visible, mask };

            let mut kinds : Vec<ChannelKind> = (0..base).map(ChannelKind::Color).collect();
            if alpha
            {
                kinds.insert(0, ChannelKind::Alpha);
            }
            if mask.is_some()
            {
                kinds.push(ChannelKind::LayerMask);
            }
            let planes : Vec<_> = kinds.iter().map(|&kind| plane(info.channel_rect(kind).area())).collect();
            (Just(info), Just(kinds), planes)
        })
        .prop_map(|(info, kinds, planes)| Layer
        {
            info,
            channels : kinds.into_iter().zip(planes).map(|(kind, data)| Channel { kind, data }).collect(),
        })
}

fn document() -> impl Strategy<Value = PsdDocument>
{
    (prop::sample::select(vec![ColorMode::Grayscale, ColorMode::Indexed, ColorMode::Rgb]), 1u32..10, 1u32..10, 0u16..2)
        .prop_flat_map(|(mode, columns, rows, extra)| {
            let channels = mode.base_channel_count() + extra;
            let pixels = (columns * rows) as usize;
            (
                Just(PsdDocument::new(mode, columns, rows, channels)),
                prop::collection::vec(plane(pixels), channels as usize),
                prop::collection::vec(layer(mode), 0..4),
                prop::collection::vec(any::<[u8; 3]>(), 256),
                any::<bool>(),
                prop::collection::vec((-50i32..50, any::<bool>()), 0..4),
            )
        })
        .prop_map(|(mut doc, composite, layers, palette, merged_alpha, guides)| {
            doc.composite = composite;
            if doc.header.mode == ColorMode::Indexed
            {
                doc.palette = palette;
            }
            doc.merged_alpha = merged_alpha && !layers.is_empty();
            doc.resources.active_layer = if layers.is_empty() { None } else { Some(layers.len() as u16 - 1) };
            doc.layers = layers;
            doc.resources.guides = guides
                .into_iter()
                .map(|(position, horizontal)| Guide
                {
                    position,
                    orientation : if horizontal { GuideOrientation::Horizontal } else { GuideOrientation::Vertical },
                })
                .collect();
            doc
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn documents_round_trip(doc in document()) {
        let bytes = save_psd(&doc).unwrap();
        let back = load_psd(&bytes).unwrap();
        prop_assert_eq!(back, doc);
    }
}
