//! Offline placeholder JPEG, rendered once per geometry and cached.

use std::collections::HashMap;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use parking_lot::Mutex;
use tracing::debug;

/// Rendered and cached "no signal" frames, keyed by geometry.
pub struct PlaceholderCache {
    quality: u8,
    cache: Mutex<HashMap<(u32, u32), Bytes>>,
}

impl PlaceholderCache {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The placeholder for a geometry, rendering it on first use.
    pub fn get(&self, width: u32, height: u32) -> Bytes {
        let mut cache = self.cache.lock();
        cache
            .entry((width, height))
            .or_insert_with(|| {
                debug!(width, height, "rendering offline placeholder");
                Bytes::from(render(width, height, self.quality))
            })
            .clone()
    }
}

/// A dark field with a lighter center band, enough for a viewer to see
/// the stream is alive but the source is not.
fn render(width: u32, height: u32, quality: u8) -> Vec<u8> {
    let w = width.max(16) as usize;
    let h = height.max(16) as usize;

    let band_top = h / 2 - h / 12;
    let band_bottom = h / 2 + h / 12;
    let border = (h / 48).max(1);

    let mut rgb = vec![0u8; w * h * 3];
    for y in 0..h {
        let shade: u8 = if y < border || y >= h - border {
            0x10
        } else if y >= band_top && y < band_bottom {
            0x58
        } else {
            0x24
        };
        let row = &mut rgb[y * w * 3..(y + 1) * w * 3];
        for px in row.chunks_exact_mut(3) {
            px[0] = shade;
            px[1] = shade;
            px[2] = shade;
        }
    }

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(&rgb, w as u32, h as u32, ExtendedColorType::Rgb8)
        .expect("placeholder encode cannot fail");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::is_valid_jpeg;

    #[test]
    fn test_placeholder_is_jpeg() {
        let cache = PlaceholderCache::new(80);
        let jpeg = cache.get(640, 480);
        assert!(is_valid_jpeg(&jpeg));
    }

    #[test]
    fn test_cache_reuses_render() {
        let cache = PlaceholderCache::new(80);
        let a = cache.get(320, 240);
        let b = cache.get(320, 240);
        // Same Bytes allocation, not a re-render.
        assert_eq!(a.as_ptr(), b.as_ptr());

        let c = cache.get(640, 480);
        assert_ne!(a.len(), 0);
        assert_ne!(a.as_ptr(), c.as_ptr());
    }
}
