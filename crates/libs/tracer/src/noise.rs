use cfg_if::cfg_if;

use crate::Extent;

/// PCG output permutation of a 32 bit state.
fn pcg(state: u32) -> u32 {
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    let word = (word >> 22) ^ word;

    word.rotate_right(state >> 28)
}

/// 64 random bits for one pixel of a row `width` pixels wide.
pub fn pixel_noise(x: u32, y: u32, width: u32, seed: u32) -> u64 {
    let index = y.wrapping_mul(width).wrapping_add(x);
    let state = index ^ seed.wrapping_mul(1_664_525) ^ 0xdead_beef;
    let low = pcg(state);
    let high = pcg(state ^ low.wrapping_mul(747_796_405));

    (high as u64) << 32 | low as u64
}

/// Row major noise seeds, one per pixel.
pub fn noise_pattern(extent: Extent, seed: u32) -> Vec<u64> {
    let Extent { width, height } = extent;

    cfg_if! {
        if #[cfg(feature = "rayon")] {
            use rayon::prelude::*;

            (0..height)
                .into_par_iter()
                .flat_map_iter(|y| (0..width).map(move |x| pixel_noise(x, y, width, seed)))
                .collect()
        } else {
            (0..height)
                .flat_map(|y| (0..width).map(move |x| pixel_noise(x, y, width, seed)))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pattern_is_row_major_and_deterministic() {
        let extent = Extent {
            width: 7,
            height: 5,
        };
        let pattern = noise_pattern(extent, 3);

        assert_eq!(pattern.len(), 35);
        assert_eq!(pattern[2 + 4 * 7], pixel_noise(2, 4, 7, 3));
        assert_eq!(pattern, noise_pattern(extent, 3));
    }

    #[test]
    fn seeds_and_pixels_decorrelate() {
        let extent = Extent {
            width: 32,
            height: 32,
        };
        let pattern = noise_pattern(extent, 1);
        let distinct = pattern.iter().collect::<HashSet<_>>();

        assert_eq!(distinct.len(), pattern.len());
        assert_ne!(pattern, noise_pattern(extent, 2));
    }

    #[test]
    fn wide_rows_do_not_repeat_seeds() {
        let width = 65_537;

        assert_ne!(pixel_noise(0, 1, width, 3), pixel_noise(65_536, 0, width, 3));
    }
}
