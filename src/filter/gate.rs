use std::fmt;
use std::sync::Arc;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filter::patterns::DenyPatterns;
use crate::media::normalize::DecodedImage;
use crate::ml::scorer::{ContentLabel, Scorer, ScorerOutput};

/// Thresholds and score adjustments. The weights are tunable policy; only
/// their direction is fixed (portrait framing and photo labels help, artwork
/// and UI labels hurt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    pub min_width: u32,
    pub min_height: u32,
    pub min_bytes: u64,
    pub threshold: f32,
    pub portrait_bonus: f32,
    pub large_bonus: f32,
    pub large_side: u32,
    pub portrait_photo_adjust: f32,
    pub group_photo_adjust: f32,
    pub subject_photo_adjust: f32,
    pub artwork_adjust: f32,
    pub ui_element_adjust: f32,
    /// Raw score assumed when the scorer itself fails on an image.
    pub scorer_error_score: f32,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_width: 150,
            min_height: 150,
            min_bytes: 8 * 1024,
            threshold: 0.4,
            portrait_bonus: 0.15,
            large_bonus: 0.1,
            large_side: 400,
            portrait_photo_adjust: 0.25,
            group_photo_adjust: 0.1,
            subject_photo_adjust: 0.2,
            artwork_adjust: -0.4,
            ui_element_adjust: -0.4,
            scorer_error_score: 0.1,
        }
    }
}

impl GatePolicy {
    pub fn label_adjustment(&self, label: ContentLabel) -> f32 {
        match label {
            ContentLabel::PortraitPhoto => self.portrait_photo_adjust,
            ContentLabel::GroupPhoto => self.group_photo_adjust,
            ContentLabel::SubjectPhoto => self.subject_photo_adjust,
            ContentLabel::Artwork => self.artwork_adjust,
            ContentLabel::UiElement => self.ui_element_adjust,
            ContentLabel::Unknown => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterReason {
    TooFewBytes { bytes: u64, min: u64 },
    TooSmall { width: u32, height: u32 },
    DenyPattern(String),
    LowScore { score: f32, threshold: f32 },
}

impl FilterReason {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterReason::TooFewBytes { .. } => "too_few_bytes",
            FilterReason::TooSmall { .. } => "too_small",
            FilterReason::DenyPattern(_) => "deny_pattern",
            FilterReason::LowScore { .. } => "low_score",
        }
    }

    pub fn is_prefilter(&self) -> bool {
        !matches!(self, FilterReason::LowScore { .. })
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::TooFewBytes { bytes, min } => write!(f, "{} bytes is below {}", bytes, min),
            FilterReason::TooSmall { width, height } => write!(f, "{}x{} is too small", width, height),
            FilterReason::DenyPattern(name) => write!(f, "url matches deny pattern '{}'", name),
            FilterReason::LowScore { score, threshold } => {
                write!(f, "score {:.2} is below threshold {:.2}", score, threshold)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub accept: bool,
    pub score: f32,
    pub label: ContentLabel,
    pub rejection: Option<FilterReason>,
}

impl Verdict {
    fn prefiltered(reason: FilterReason) -> Self {
        Self { accept: false, score: 0.0, label: ContentLabel::Unknown, rejection: Some(reason) }
    }
}

/// Accept/reject decision for a decoded image. Holds no mutable state, so
/// one gate is shared by every worker.
pub struct RelevanceGate {
    policy: GatePolicy,
    deny: DenyPatterns,
    scorer: Arc<dyn Scorer>,
}

impl RelevanceGate {
    pub fn new(policy: GatePolicy, deny: DenyPatterns, scorer: Arc<dyn Scorer>) -> Self {
        debug!(
            "Relevance gate: scorer={}, threshold={:.2}, {} deny patterns",
            scorer.name(),
            policy.threshold,
            deny.pattern_count()
        );
        Self { policy, deny, scorer }
    }

    #[cfg(test)]
    pub fn with_defaults(scorer: Arc<dyn Scorer>) -> Result<Self> {
        Ok(Self::new(GatePolicy::default(), DenyPatterns::builtin()?, scorer))
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Deny-pattern check that needs nothing but the URL; run before fetching.
    pub fn screen_url(&self, url: &str) -> Option<FilterReason> {
        self.deny.first_match(url).map(|name| FilterReason::DenyPattern(name.to_string()))
    }

    /// Byte-size check that needs nothing but the payload length; run before decoding.
    pub fn screen_payload(&self, len: u64) -> Option<FilterReason> {
        (len < self.policy.min_bytes).then(|| FilterReason::TooFewBytes { bytes: len, min: self.policy.min_bytes })
    }

    pub fn evaluate(&self, image: &DecodedImage, image_url: &str, query: &str, source_domain: &str) -> Verdict {
        if let Some(reason) = self.screen_payload(image.payload_len as u64) {
            return Verdict::prefiltered(reason);
        }
        let (width, height) = (image.width(), image.height());
        if width < self.policy.min_width || height < self.policy.min_height {
            return Verdict::prefiltered(FilterReason::TooSmall { width, height });
        }
        if let Some(reason) = self.screen_url(image_url) {
            return Verdict::prefiltered(reason);
        }

        let output = match self.scorer.score(&image.image, query, source_domain) {
            Ok(output) => output,
            Err(e) => {
                warn!("Scorer {} failed on {}: {}", self.scorer.name(), image_url, e);
                ScorerOutput { raw_score: self.policy.scorer_error_score, label: ContentLabel::Unknown }
            }
        };

        let score = self.adjust(output, width, height);
        let accept = score >= self.policy.threshold;
        let rejection = (!accept).then_some(FilterReason::LowScore { score, threshold: self.policy.threshold });
        Verdict { accept, score, label: output.label, rejection }
    }

    fn adjust(&self, output: ScorerOutput, width: u32, height: u32) -> f32 {
        let policy = &self.policy;
        let aspect = width as f32 / height as f32;

        let mut score = output.raw_score;
        if (0.7..=1.4).contains(&aspect) {
            score += policy.portrait_bonus;
        }
        if width >= policy.large_side && height >= policy.large_side {
            score += policy.large_bonus;
        }
        score += policy.label_adjustment(output.label);

        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::normalize::decode;
    use crate::testing::{jpeg_payload, flat_png_payload, FakeScorer};

    fn gate(scorer: Arc<FakeScorer>) -> Result<RelevanceGate> {
        RelevanceGate::with_defaults(scorer)
    }

    #[test]
    fn small_payload_is_rejected_before_scoring() -> Result<()> {
        let scorer = Arc::new(FakeScorer::constant(0.9, ContentLabel::PortraitPhoto));
        let gate = gate(scorer.clone())?;
        let image = decode(&flat_png_payload(100, 100))?;
        assert!(image.payload_len < 8 * 1024);

        let verdict = gate.evaluate(&image, "https://a.com/p.png", "abc", "a.com");
        assert!(!verdict.accept);
        assert_eq!(verdict.rejection.as_ref().map(FilterReason::kind), Some("too_few_bytes"));
        assert_eq!(scorer.calls(), 0);
        Ok(())
    }

    #[test]
    fn small_dimensions_are_rejected_before_scoring() -> Result<()> {
        let scorer = Arc::new(FakeScorer::constant(0.9, ContentLabel::PortraitPhoto));
        let gate = gate(scorer.clone())?;
        let image = decode(&jpeg_payload(120, 400, 3))?;

        let verdict = gate.evaluate(&image, "https://a.com/p.jpg", "abc", "a.com");
        assert_eq!(verdict.rejection, Some(FilterReason::TooSmall { width: 120, height: 400 }));
        assert_eq!(scorer.calls(), 0);
        Ok(())
    }

    #[test]
    fn deny_pattern_rejection_names_the_pattern() -> Result<()> {
        let scorer = Arc::new(FakeScorer::constant(0.9, ContentLabel::PortraitPhoto));
        let gate = gate(scorer.clone())?;
        let image = decode(&jpeg_payload(300, 300, 4))?;

        let verdict = gate.evaluate(&image, "https://a.com/assets/site-logo.jpg", "abc", "a.com");
        assert_eq!(verdict.rejection, Some(FilterReason::DenyPattern("logo".into())));
        assert_eq!(scorer.calls(), 0);
        assert!(gate.screen_url("https://a.com/assets/site-logo.jpg").is_some());
        Ok(())
    }

    #[test]
    fn adjustments_follow_label_and_shape() -> Result<()> {
        let image = decode(&jpeg_payload(300, 300, 5))?;

        let photo = gate(Arc::new(FakeScorer::constant(0.3, ContentLabel::PortraitPhoto)))?;
        let verdict = photo.evaluate(&image, "https://a.com/p.jpg", "abc", "a.com");
        // 0.3 raw + 0.15 square-ish framing + 0.25 portrait label
        assert!((verdict.score - 0.7).abs() < 1e-5);
        assert!(verdict.accept);

        let art = gate(Arc::new(FakeScorer::constant(0.5, ContentLabel::Artwork)))?;
        let verdict = art.evaluate(&image, "https://a.com/p.jpg", "abc", "a.com");
        assert!(!verdict.accept);
        assert_eq!(verdict.rejection.as_ref().map(FilterReason::kind), Some("low_score"));
        Ok(())
    }

    #[test]
    fn score_is_clamped_to_unit_range() -> Result<()> {
        let image = decode(&jpeg_payload(500, 500, 6))?;
        let high = gate(Arc::new(FakeScorer::constant(0.95, ContentLabel::PortraitPhoto)))?;
        assert_eq!(high.evaluate(&image, "https://a.com/p.jpg", "q", "a.com").score, 1.0);

        let low = gate(Arc::new(FakeScorer::constant(0.0, ContentLabel::UiElement)))?;
        let verdict = low.evaluate(&image, "https://a.com/p.jpg", "q", "a.com");
        assert_eq!(verdict.score, 0.0);
        Ok(())
    }

    #[test]
    fn evaluation_is_deterministic() -> Result<()> {
        let gate = gate(Arc::new(FakeScorer::constant(0.42, ContentLabel::SubjectPhoto)))?;
        let image = decode(&jpeg_payload(320, 480, 7))?;
        let first = gate.evaluate(&image, "https://a.com/p.jpg", "abc", "a.com");
        for _ in 0..10 {
            assert_eq!(gate.evaluate(&image, "https://a.com/p.jpg", "abc", "a.com"), first);
        }
        Ok(())
    }

    #[test]
    fn scorer_failure_degrades_to_low_score() -> Result<()> {
        let gate = gate(Arc::new(FakeScorer::failing()))?;
        let image = decode(&jpeg_payload(300, 300, 8))?;
        let verdict = gate.evaluate(&image, "https://a.com/p.jpg", "abc", "a.com");
        assert_eq!(verdict.label, ContentLabel::Unknown);
        assert!(!verdict.accept);
        Ok(())
    }
}
