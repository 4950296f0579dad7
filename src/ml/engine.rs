use std::path::Path;
use image::DynamicImage;
use ort::session::Session;
use anyhow::{Result, Context, anyhow};

use crate::ml::pipeline;
use crate::ml::scorer::{Scorer, ScorerOutput};

/// Relevance classifier backed by an ONNX model with a six-way head.
pub struct OnnxScorer {
    session: Session,
}

impl OnnxScorer {
    pub fn new(model_path: &Path) -> Result<Self> {
        // Commits the process-wide environment; a second commit is harmless.
        let _ = ort::init()
            .with_name("pic-harvester-relevance")
            .commit();

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load relevance model {:?}", model_path))?;

        Ok(Self { session })
    }
}

impl Scorer for OnnxScorer {
    fn score(&self, image: &DynamicImage, _query: &str, _source_domain: &str) -> Result<ScorerOutput> {
        let input = pipeline::to_input_tensor(image);
        let outputs = self.session.run(ort::inputs![input]?)?;
        let logits = outputs[0].try_extract_tensor::<f32>()?;
        let logits: Vec<f32> = logits.iter().copied().collect();
        if logits.is_empty() {
            return Err(anyhow!("relevance model returned no logits"));
        }
        pipeline::interpret_logits(&logits)
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}
