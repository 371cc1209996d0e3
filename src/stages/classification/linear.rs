use std::path::Path;

use anyhow::{Context, Result, bail};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::{ProbabilityModel, prepare_input, softmax};
use crate::stages::preprocessing::to_grayscale;

pub const FEATURE_NAMES: [&str; 8] = [
    "mean_red",
    "mean_green",
    "mean_blue",
    "gray_std",
    "dark_fraction",
    "edge_density",
    "aspect_ratio",
    "log_area",
];

const DARK_LEVEL: u8 = 100;

/// Hand-crafted descriptors of a crop, all roughly in `[0, 1]`
pub fn crop_features(crop: &RgbImage, input_size: u32) -> [f64; 8] {
    let aspect_ratio = crop.width() as f64 / crop.height().max(1) as f64;
    let log_area = ((crop.width() as f64 * crop.height() as f64).max(1.0)).ln() / 10.0;

    let resized = prepare_input(crop, input_size);
    let gray = to_grayscale(&resized);
    let n = (resized.width() as f64 * resized.height() as f64).max(1.0);

    let mut channel_sums = [0.0f64; 3];
    for p in resized.pixels() {
        for c in 0..3 {
            channel_sums[c] += p[c] as f64;
        }
    }

    let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let variance = gray
        .pixels()
        .map(|p| (p[0] as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let dark = gray.pixels().filter(|p| p[0] < DARK_LEVEL).count() as f64 / n;

    let mut edges = 0.0;
    for y in 0..gray.height() {
        for x in 0..gray.width() {
            let v = gray.get_pixel(x, y)[0] as f64;
            let right = gray.get_pixel((x + 1).min(gray.width() - 1), y)[0] as f64;
            let below = gray.get_pixel(x, (y + 1).min(gray.height() - 1))[0] as f64;
            edges += ((right - v).abs() + (below - v).abs()) / 2.0;
        }
    }

    [
        channel_sums[0] / n / 255.0,
        channel_sums[1] / n / 255.0,
        channel_sums[2] / n / 255.0,
        variance.sqrt() / 255.0,
        dark,
        edges / n / 255.0,
        aspect_ratio,
        log_area,
    ]
}

/// Softmax regression over [`crop_features`], stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub class_names: Vec<String>,
    pub input_size: u32,
    /// One row of feature weights per class
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl LinearModel {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        let model: LinearModel = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse model file {}", path.display()))?;
        model.check()?;
        Ok(model)
    }

    pub fn check(&self) -> Result<()> {
        let n = self.class_names.len();
        if n == 0 {
            bail!("model has no classes");
        }
        if self.input_size == 0 {
            bail!("model input_size must be positive");
        }
        if self.weights.len() != n || self.bias.len() != n {
            bail!(
                "model has {} classes but {} weight rows and {} biases",
                n,
                self.weights.len(),
                self.bias.len()
            );
        }
        if let Some(row) = self.weights.iter().find(|row| row.len() != FEATURE_NAMES.len()) {
            bail!(
                "weight row has {} entries, expected {}",
                row.len(),
                FEATURE_NAMES.len()
            );
        }
        Ok(())
    }
}

impl ProbabilityModel for LinearModel {
    fn name(&self) -> &str {
        "linear"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&self, crop: &RgbImage) -> Result<Vec<f64>> {
        let features = crop_features(crop, self.input_size);
        let logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&features).map(|(w, f)| w * f).sum::<f64>() + b)
            .collect();
        Ok(softmax(&logits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn dark_vs_light() -> LinearModel {
        // class 0 follows dark_fraction, class 1 its absence
        let mut dark = vec![0.0; 8];
        dark[4] = 10.0;
        LinearModel {
            class_names: vec!["Dark".into(), "Light".into()],
            input_size: 16,
            weights: vec![dark, vec![0.0; 8]],
            bias: vec![0.0, 5.0],
        }
    }

    #[test]
    fn test_features_of_flat_crop() {
        let crop = RgbImage::from_pixel(20, 10, Rgb([255, 0, 51]));
        let f = crop_features(&crop, 8);
        assert!((f[0] - 1.0).abs() < 1e-9);
        assert!(f[1].abs() < 1e-9);
        assert!((f[2] - 0.2).abs() < 1e-9);
        assert!(f[3].abs() < 1e-9);
        assert!(f[5].abs() < 1e-9);
        assert_eq!(f[6], 2.0);
    }

    #[test]
    fn test_predicts_by_weights() {
        let model = dark_vs_light();
        let dark = model.predict(&RgbImage::from_pixel(10, 10, Rgb([10, 10, 10]))).unwrap();
        let light = model.predict(&RgbImage::from_pixel(10, 10, Rgb([240, 240, 240]))).unwrap();
        assert!(dark[0] > dark[1]);
        assert!(light[1] > light[0]);
    }

    #[test]
    fn test_load_checks_shapes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.json");

        std::fs::write(&path, serde_json::to_string(&dark_vs_light())?)?;
        assert_eq!(LinearModel::load(&path)?.class_names.len(), 2);

        let mut broken = dark_vs_light();
        broken.bias.pop();
        std::fs::write(&path, serde_json::to_string(&broken)?)?;
        assert!(LinearModel::load(&path).is_err());
        Ok(())
    }
}
