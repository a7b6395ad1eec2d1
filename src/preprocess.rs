//! Turns a decoded image into the `[1, 3, H, W]` float tensor a classifier
//! expects, driven by a Hugging Face style `preprocessor_config.json`

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use std::path::Path;
use tch::Tensor;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Above this edge length `crop_pct` is ignored and the image is resized
/// straight to a square
const CROP_PCT_MAX_EDGE: u32 = 384;

/// The target size of a resize or crop
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Size {
    Exact { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
    Square(u32),
}

impl Size {
    fn edge(&self) -> u32 {
        match *self {
            Size::Exact { height, width } => height.min(width),
            Size::ShortestEdge { shortest_edge } => shortest_edge,
            Size::Square(s) => s,
        }
    }
}

/// Parameters of the image processor paired with a model
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageProcessor {
    pub do_resize: bool,
    pub size: Size,
    /// PIL resampling filter id
    pub resample: u32,
    pub crop_pct: Option<f32>,
    pub do_center_crop: bool,
    pub crop_size: Option<Size>,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
}

impl Default for ImageProcessor {
    fn default() -> Self {
        ImageProcessor {
            do_resize: true,
            size: Size::Exact {
                height: 224,
                width: 224,
            },
            resample: 2,
            crop_pct: None,
            do_center_crop: false,
            crop_size: None,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: IMAGENET_MEAN.to_vec(),
            image_std: IMAGENET_STD.to_vec(),
        }
    }
}

impl ImageProcessor {
    /// Read and validate a `preprocessor_config.json`
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("invalid {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let processor: ImageProcessor = serde_json::from_str(json)?;
        processor.validate()?;
        Ok(processor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_mean.len() != 3 || self.image_std.len() != 3 {
            return Err(anyhow!(
                "image_mean/std must have length 3, got mean={} std={}",
                self.image_mean.len(),
                self.image_std.len()
            ));
        }
        if self.image_std.iter().any(|s| *s == 0.0) {
            return Err(anyhow!("image_std must not contain zeros"));
        }
        if self.size.edge() == 0 || self.crop_size.map_or(false, |s| s.edge() == 0) {
            return Err(anyhow!("size and crop_size must be positive"));
        }
        if let Some(pct) = self.crop_pct {
            if !(pct > 0.0 && pct <= 1.0) {
                return Err(anyhow!("crop_pct must be in (0, 1], got {pct}"));
            }
        }
        Ok(())
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            3 => FilterType::CatmullRom,
            _ => FilterType::Triangle,
        }
    }

    /// Run the full pipeline, returning a batch of one
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let mut rgb = image.to_rgb8();

        if self.do_resize {
            rgb = self.resize(&rgb);
        }
        if self.do_center_crop {
            if let Some(crop) = self.crop_size {
                let (height, width) = target_dims(crop, rgb.height(), rgb.width());
                rgb = center_crop(&rgb, height, width);
            }
        }

        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("image is empty after preprocessing"));
        }

        Ok(Tensor::from_slice(&self.to_chw(&rgb)).view([1, 3, height as i64, width as i64]))
    }

    fn resize(&self, rgb: &RgbImage) -> RgbImage {
        let filter = self.filter();
        let (height, width) = (rgb.height(), rgb.width());

        match (self.size, self.crop_pct) {
            (Size::ShortestEdge { shortest_edge }, Some(pct))
                if shortest_edge < CROP_PCT_MAX_EDGE =>
            {
                let resize_edge = (shortest_edge as f32 / pct) as u32;
                let (h, w) = shortest_edge_dims(resize_edge, height, width);
                let resized = image::imageops::resize(rgb, w, h, filter);
                center_crop(&resized, shortest_edge, shortest_edge)
            }
            (Size::ShortestEdge { shortest_edge }, Some(_)) => {
                image::imageops::resize(rgb, shortest_edge, shortest_edge, filter)
            }
            (size, _) => {
                let (h, w) = target_dims(size, height, width);
                image::imageops::resize(rgb, w, h, filter)
            }
        }
    }

    /// Rescale and normalize into planar channel order
    fn to_chw(&self, rgb: &RgbImage) -> Vec<f32> {
        let plane = (rgb.width() * rgb.height()) as usize;
        let mut data = vec![0f32; plane * 3];

        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let mut value = pixel[c] as f32;
                if self.do_rescale {
                    value *= self.rescale_factor;
                }
                if self.do_normalize {
                    value = (value - self.image_mean[c]) / self.image_std[c];
                }
                data[c * plane + i] = value;
            }
        }
        data
    }
}

/// `(height, width)` of a resize to `size`
fn target_dims(size: Size, height: u32, width: u32) -> (u32, u32) {
    match size {
        Size::Exact { height, width } => (height, width),
        Size::Square(s) => (s, s),
        Size::ShortestEdge { shortest_edge } => shortest_edge_dims(shortest_edge, height, width),
    }
}

/// Scale so the short side equals `edge`, keeping the aspect ratio
fn shortest_edge_dims(edge: u32, height: u32, width: u32) -> (u32, u32) {
    if height <= width {
        let long = (edge as u64 * width as u64 / height.max(1) as u64) as u32;
        (edge, long.max(1))
    } else {
        let long = (edge as u64 * height as u64 / width.max(1) as u64) as u32;
        (long.max(1), edge)
    }
}

fn center_crop(rgb: &RgbImage, height: u32, width: u32) -> RgbImage {
    let height = height.min(rgb.height());
    let width = width.min(rgb.width());
    let top = (rgb.height() - height) / 2;
    let left = (rgb.width() - width) / 2;
    image::imageops::crop_imm(rgb, left, top, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const RESNET_CONFIG: &str = r#"{
        "crop_pct": 0.875,
        "do_normalize": true,
        "do_resize": true,
        "image_mean": [0.485, 0.456, 0.406],
        "image_processor_type": "ConvNextImageProcessor",
        "image_std": [0.229, 0.224, 0.225],
        "resample": 3,
        "size": {"shortest_edge": 224}
    }"#;

    const VIT_CONFIG: &str = r#"{
        "do_normalize": true,
        "do_rescale": true,
        "do_resize": true,
        "image_mean": [0.5, 0.5, 0.5],
        "image_processor_type": "ViTImageProcessor",
        "image_std": [0.5, 0.5, 0.5],
        "resample": 2,
        "rescale_factor": 0.00392156862745098,
        "size": {"height": 224, "width": 224}
    }"#;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn test_parse_resnet_config() {
        let processor = ImageProcessor::from_json(RESNET_CONFIG).unwrap();
        assert_eq!(processor.size, Size::ShortestEdge { shortest_edge: 224 });
        assert_eq!(processor.crop_pct, Some(0.875));
        assert_eq!(processor.filter(), FilterType::CatmullRom);
        assert!(processor.do_rescale);
    }

    #[test]
    fn test_parse_legacy_int_size() {
        let processor = ImageProcessor::from_json(r#"{"size": 256}"#).unwrap();
        assert_eq!(processor.size, Size::Square(256));
        assert_eq!(processor.image_mean, IMAGENET_MEAN.to_vec());
    }

    #[test]
    fn test_invalid_config() {
        assert!(ImageProcessor::from_json(r#"{"image_mean": [0.5, 0.5]}"#).is_err());
        assert!(ImageProcessor::from_json(r#"{"image_std": [0.5, 0.0, 0.5]}"#).is_err());
        assert!(ImageProcessor::from_json(r#"{"size": {"shortest_edge": 0}}"#).is_err());
        assert!(ImageProcessor::from_json("not json").is_err());
    }

    #[test]
    fn test_shortest_edge_dims() {
        assert_eq!(shortest_edge_dims(256, 480, 640), (256, 341));
        assert_eq!(shortest_edge_dims(256, 640, 480), (341, 256));
        assert_eq!(shortest_edge_dims(224, 100, 100), (224, 224));
    }

    #[test]
    fn test_resnet_pipeline_shape() {
        let processor = ImageProcessor::from_json(RESNET_CONFIG).unwrap();
        let tensor = processor.preprocess(&gradient(640, 480)).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 224, 224]);
    }

    #[test]
    fn test_large_crop_pct_model_is_square() {
        let processor = ImageProcessor::from_json(
            r#"{"size": {"shortest_edge": 384}, "crop_pct": 0.875, "resample": 3}"#,
        )
        .unwrap();
        let tensor = processor.preprocess(&gradient(640, 480)).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 384, 384]);
    }

    #[test]
    fn test_shortest_edge_without_crop_keeps_aspect() {
        let processor = ImageProcessor::from_json(r#"{"size": {"shortest_edge": 64}}"#).unwrap();
        let tensor = processor.preprocess(&gradient(640, 480)).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 64, 85]);
    }

    #[test]
    fn test_vit_pipeline_values() {
        let processor = ImageProcessor::from_json(VIT_CONFIG).unwrap();
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(31, 17, Rgb([255, 255, 255])));
        let tensor = processor.preprocess(&white).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 224, 224]);
        // (1.0 - 0.5) / 0.5
        let value = tensor.double_value(&[0, 1, 100, 100]);
        assert!((value - 1.0).abs() < 1e-5, "got {value}");
    }

    #[test]
    fn test_channel_layout() {
        let processor = ImageProcessor {
            do_resize: false,
            do_normalize: false,
            do_rescale: false,
            ..Default::default()
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));
        let tensor = processor.preprocess(&image).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 2, 2]);
        assert_eq!(tensor.double_value(&[0, 0, 1, 1]), 10.0);
        assert_eq!(tensor.double_value(&[0, 1, 0, 1]), 20.0);
        assert_eq!(tensor.double_value(&[0, 2, 1, 0]), 30.0);
    }

    #[test]
    fn test_grayscale_is_converted() {
        let processor = ImageProcessor::from_json(VIT_CONFIG).unwrap();
        let gray = DynamicImage::ImageLuma8(image::GrayImage::new(50, 60));
        let tensor = processor.preprocess(&gray).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 224, 224]);
    }
}
