//! Marker-controlled watershed flooding on an RGB frame.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use image::RgbImage;

/// Label given to pixels where two basins meet, and to the image border
pub const BOUNDARY: i32 = -1;
const IN_QUEUE: i32 = -2;

fn color_distance(image: &RgbImage, a: usize, b: usize) -> u8 {
    let width = image.width() as usize;
    let pa = image.get_pixel((a % width) as u32, (a / width) as u32);
    let pb = image.get_pixel((b % width) as u32, (b / width) as u32);
    (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0)
}

fn neighbours(idx: usize, width: usize, height: usize) -> impl Iterator<Item = usize> {
    let (x, y) = (idx % width, idx / width);
    [
        (y > 0).then(|| idx - width),
        (x > 0).then(|| idx - 1),
        (x + 1 < width).then(|| idx + 1),
        (y + 1 < height).then(|| idx + width),
    ]
    .into_iter()
    .flatten()
}

/// Flood `markers` in place.
///
/// `markers` is row-major, one entry per pixel: positive values are seeds,
/// zero is unknown. On return every reachable unknown pixel carries the
/// label of the basin that reached it first, or [`BOUNDARY`] where basins
/// meet. The outer one-pixel frame is always [`BOUNDARY`].
pub fn flood(image: &RgbImage, markers: &mut [i32]) {
    let (width, height) = (image.width() as usize, image.height() as usize);
    debug_assert_eq!(markers.len(), width * height);
    if width == 0 || height == 0 {
        return;
    }

    for x in 0..width {
        markers[x] = BOUNDARY;
        markers[(height - 1) * width + x] = BOUNDARY;
    }
    for y in 0..height {
        markers[y * width] = BOUNDARY;
        markers[y * width + width - 1] = BOUNDARY;
    }

    // (priority, insertion order, pixel); the order keeps equal priorities FIFO
    let mut queue: BinaryHeap<Reverse<(u8, u64, usize)>> = BinaryHeap::new();
    let mut seq = 0u64;

    for idx in 0..markers.len() {
        if markers[idx] != 0 {
            continue;
        }
        let priority = neighbours(idx, width, height)
            .filter(|&n| markers[n] > 0)
            .map(|n| color_distance(image, idx, n))
            .min();
        if let Some(priority) = priority {
            queue.push(Reverse((priority, seq, idx)));
            seq += 1;
            markers[idx] = IN_QUEUE;
        }
    }

    while let Some(Reverse((_, _, idx))) = queue.pop() {
        let mut label = 0;
        for n in neighbours(idx, width, height) {
            let other = markers[n];
            if other <= 0 {
                continue;
            }
            if label == 0 {
                label = other;
            } else if label != other {
                label = BOUNDARY;
            }
        }
        if label == 0 {
            label = BOUNDARY;
        }
        markers[idx] = label;
        if label == BOUNDARY {
            continue;
        }

        for n in neighbours(idx, width, height) {
            if markers[n] == 0 {
                queue.push(Reverse((color_distance(image, idx, n), seq, n)));
                seq += 1;
                markers[n] = IN_QUEUE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_two_seeds_split_at_edge() {
        // left half dark, right half light
        let image = RgbImage::from_fn(10, 5, |x, _| if x < 5 { Rgb([20, 20, 20]) } else { Rgb([220, 220, 220]) });
        let mut markers = vec![0; 50];
        markers[2 * 10 + 1] = 2;
        markers[2 * 10 + 8] = 3;

        flood(&image, &mut markers);

        for y in 1..4 {
            for x in 1..9 {
                let label = markers[y * 10 + x];
                match x {
                    1..=3 => assert_eq!(label, 2, "pixel ({}, {})", x, y),
                    6..=8 => assert_eq!(label, 3, "pixel ({}, {})", x, y),
                    4 => assert!(label == 2 || label == BOUNDARY),
                    _ => assert!(label == 3 || label == BOUNDARY),
                }
            }
        }
        assert_eq!(markers[0], BOUNDARY);
    }

    #[test]
    fn test_single_seed_fills_interior() {
        let image = RgbImage::from_pixel(6, 6, Rgb([100, 100, 100]));
        let mut markers = vec![0; 36];
        markers[2 * 6 + 2] = 5;
        flood(&image, &mut markers);
        let interior = (1..5).flat_map(|y| (1..5).map(move |x| y * 6 + x));
        assert!(interior.into_iter().all(|i| markers[i] == 5));
    }
}
