use ndarray::Array4;
use image::DynamicImage;
use anyhow::{Result, anyhow};

use crate::ml::scorer::{ContentLabel, ScorerOutput};

pub const INPUT_SIZE: u32 = 224;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 1x3x224x224 CHW tensor with ImageNet per-channel mean/std normalization.
pub fn to_input_tensor(image: &DynamicImage) -> Array4<f32> {
    let side = INPUT_SIZE as usize;
    let rgb = image
        .resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let mut tensor = Array4::zeros((1, 3, side, side));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    tensor
}

/// Maps classifier logits (one per `ContentLabel::ALL` entry) to a score:
/// the probability mass on the photo labels, labelled by the argmax.
pub fn interpret_logits(logits: &[f32]) -> Result<ScorerOutput> {
    if logits.len() != ContentLabel::ALL.len() {
        return Err(anyhow!(
            "classifier produced {} logits, expected {}",
            logits.len(),
            ContentLabel::ALL.len()
        ));
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();

    let mut best = 0;
    let mut photo_mass = 0.0;
    for (i, e) in exps.iter().enumerate() {
        if *e > exps[best] {
            best = i;
        }
        if ContentLabel::ALL[i].is_photo() {
            photo_mass += e / total;
        }
    }

    Ok(ScorerOutput { raw_score: photo_mass, label: ContentLabel::ALL[best] })
}
