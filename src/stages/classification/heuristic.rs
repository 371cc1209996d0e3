use anyhow::Result;
use image::RgbImage;

use super::{ProbabilityModel, prepare_input, softmax};
use crate::stages::preprocessing::to_grayscale;

const DARK_MEAN: f64 = 100.0;
const LARGE_CROP_PX: u64 = 10_000;
const WINNER_BONUS: f64 = 2.0;

/// Rule-based stand-in for a trained network.
///
/// Dark crops lean to the first class, large crops to the second and
/// everything else to the third. The same crop always yields the same
/// probabilities.
pub struct HeuristicModel {
    class_names: Vec<String>,
    input_size: u32,
}

impl HeuristicModel {
    pub fn new(class_names: Vec<String>, input_size: u32) -> Self {
        Self {
            class_names,
            input_size,
        }
    }

    fn logits(&self, mean_gray: f64, crop_area: u64) -> Vec<f64> {
        let n = self.class_names.len();
        let mut logits = vec![0.0; n];
        if n == 0 {
            return logits;
        }

        let (index, score) = if mean_gray < DARK_MEAN {
            (0, 3.0)
        } else if crop_area > LARGE_CROP_PX {
            (1, 2.5)
        } else {
            (2, 2.0)
        };
        logits[index.min(n - 1)] += score + WINNER_BONUS;
        logits
    }
}

impl ProbabilityModel for HeuristicModel {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&self, crop: &RgbImage) -> Result<Vec<f64>> {
        let resized = prepare_input(crop, self.input_size);
        let gray = to_grayscale(&resized);
        let count = (gray.width() as f64 * gray.height() as f64).max(1.0);
        let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
        let area = crop.width() as u64 * crop.height() as u64;
        Ok(softmax(&self.logits(mean, area)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn model() -> HeuristicModel {
        let names = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        HeuristicModel::new(names, 16)
    }

    fn argmax(p: &[f64]) -> usize {
        p.iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn test_dark_crop_is_first_class() {
        let crop = RgbImage::from_pixel(40, 40, Rgb([30, 30, 30]));
        let p = model().predict(&crop).unwrap();
        assert_eq!(argmax(&p), 0);
        assert!(p[0] > 0.9);
    }

    #[test]
    fn test_large_light_crop_is_second_class() {
        let crop = RgbImage::from_pixel(120, 120, Rgb([200, 200, 200]));
        assert_eq!(argmax(&model().predict(&crop).unwrap()), 1);
    }

    #[test]
    fn test_deterministic() {
        let crop = RgbImage::from_pixel(30, 30, Rgb([150, 150, 150]));
        let m = model();
        assert_eq!(m.predict(&crop).unwrap(), m.predict(&crop).unwrap());
        assert_eq!(argmax(&m.predict(&crop).unwrap()), 2);
    }

    #[test]
    fn test_single_class_vocabulary() {
        let m = HeuristicModel::new(vec!["Only".to_string()], 8);
        let crop = RgbImage::from_pixel(200, 200, Rgb([250, 250, 250]));
        assert_eq!(m.predict(&crop).unwrap(), vec![1.0]);
    }
}
