use std::fmt;
use std::str::FromStr;
use anyhow::{Result, anyhow};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentLabel {
    PortraitPhoto,
    GroupPhoto,
    SubjectPhoto,
    Artwork,
    UiElement,
    Unknown,
}

impl ContentLabel {
    /// Output order of the classifier head.
    pub const ALL: [ContentLabel; 6] = [
        ContentLabel::PortraitPhoto,
        ContentLabel::GroupPhoto,
        ContentLabel::SubjectPhoto,
        ContentLabel::Artwork,
        ContentLabel::UiElement,
        ContentLabel::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentLabel::PortraitPhoto => "portrait_photo",
            ContentLabel::GroupPhoto => "group_photo",
            ContentLabel::SubjectPhoto => "subject_photo",
            ContentLabel::Artwork => "artwork",
            ContentLabel::UiElement => "ui_element",
            ContentLabel::Unknown => "unknown",
        }
    }

    pub fn is_photo(self) -> bool {
        matches!(
            self,
            ContentLabel::PortraitPhoto | ContentLabel::GroupPhoto | ContentLabel::SubjectPhoto
        )
    }
}

impl fmt::Display for ContentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ContentLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| anyhow!("unknown content label: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorerOutput {
    pub raw_score: f32,
    pub label: ContentLabel,
}

/// Relevance model contract. Implementations are called concurrently from
/// every download worker and must not keep per-call mutable state.
pub trait Scorer: Send + Sync {
    fn score(&self, image: &DynamicImage, query: &str, source_domain: &str) -> Result<ScorerOutput>;

    fn name(&self) -> &'static str;
}

/// Model-free fallback that classifies by shape and tonal spread.
pub struct HeuristicScorer;

const FLAT_LUMA_STDDEV: f32 = 18.0;

impl Scorer for HeuristicScorer {
    fn score(&self, image: &DynamicImage, _query: &str, _source_domain: &str) -> Result<ScorerOutput> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("empty image"));
        }
        let aspect = width as f32 / height as f32;
        let spread = luma_stddev(image);

        let output = if spread < FLAT_LUMA_STDDEV {
            // Flat graphics: logos, banners, icons, cover art.
            let label = if (0.8..=1.2).contains(&aspect) && width < 300 {
                ContentLabel::UiElement
            } else {
                ContentLabel::Artwork
            };
            ScorerOutput { raw_score: 0.2, label }
        } else if (0.8..=1.2).contains(&aspect) && width < 300 {
            ScorerOutput { raw_score: 0.35, label: ContentLabel::UiElement }
        } else if aspect < 0.8 {
            ScorerOutput { raw_score: 0.6, label: ContentLabel::PortraitPhoto }
        } else if aspect > 1.5 {
            ScorerOutput { raw_score: 0.45, label: ContentLabel::GroupPhoto }
        } else {
            ScorerOutput { raw_score: 0.5, label: ContentLabel::SubjectPhoto }
        };
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

fn luma_stddev(image: &DynamicImage) -> f32 {
    // Point-sampled so fine texture is not averaged away.
    let thumb = image.resize_exact(64, 64, FilterType::Nearest).to_luma8();
    let n = (thumb.width() * thumb.height()) as f32;
    if n == 0.0 {
        return 0.0;
    }
    let mean = thumb.pixels().map(|p| p[0] as f32).sum::<f32>() / n;
    let var = thumb.pixels().map(|p| (p[0] as f32 - mean).powi(2)).sum::<f32>() / n;
    var.sqrt()
}
