use std::collections::BTreeMap;
use std::path::Path;

use image::{Rgb, RgbImage};
use plankton_pipeline::config::{DenoiseMethod, PipelineConfig};
use plankton_pipeline::stages::acquisition::fill_disc;
use tempfile::NamedTempFile;

pub const BACKGROUND: Rgb<u8> = Rgb([215, 215, 215]);
pub const ORGANISM: Rgb<u8> = Rgb([0, 0, 0]);

/// Light frame with dark discs at `(cx, cy, radius)`
pub fn blob_frame(width: u32, height: u32, discs: &[(u32, u32, u32)]) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    for &(cx, cy, r) in discs {
        fill_disc(&mut image, cx, cy, r, ORGANISM);
    }
    image
}

/// Saves the frame as a temporary PNG.
/// The file will be automatically cleaned up when dropped.
pub fn save_frame(image: &RgbImage) -> NamedTempFile {
    let file = tempfile::Builder::new()
        .suffix(".png")
        .tempfile()
        .expect("Failed to create temp image file");
    image
        .save_with_format(file.path(), image::ImageFormat::Png)
        .expect("Failed to save test image");
    file
}

/// Small seeded synthetic frames, exports into `output_dir`
pub fn synthetic_config(output_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.acquisition.synthetic.width = 384;
    config.acquisition.synthetic.height = 384;
    config.acquisition.synthetic.seed = Some(42);
    config.preprocessing.denoise_method = DenoiseMethod::Gaussian;
    config.export.output_dir = output_dir.to_path_buf();
    config
}

/// Frames go straight to segmentation: no denoise, background or stretch
pub fn raw_frame_config(output_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.preprocessing.denoise_method = DenoiseMethod::None;
    config.preprocessing.background_correction = false;
    config.preprocessing.normalize = false;
    config.export.output_dir = output_dir.to_path_buf();
    config
}

pub fn make_counts(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}
