//! Euclidean face template matcher.
//!
//! Maps a captured feature vector to the enrolled template it is closest to,
//! provided the similarity clears the configured threshold.

use crate::types::{CaptureSample, FaceTemplate};

/// Distance at which two feature vectors score zero similarity.
pub const DEFAULT_SIMILARITY_SCALE: f32 = 100.0;

/// Minimum sample confidence and template similarity for a match.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Result of matching a capture sample against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Similarity of the best match in [0, 1], or 0 when nothing matched.
    pub similarity: f32,
    /// Owner of the matched template (if any).
    pub owner_id: Option<String>,
    /// Templates actually scored.
    pub compared: usize,
    /// Templates skipped because their length differs from the query.
    pub skipped: usize,
    /// Enrolled users left out because their template could not be loaded.
    pub unreadable: usize,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            owner_id: None,
            compared: 0,
            skipped: 0,
            unreadable: 0,
        }
    }
}

/// Strategy for comparing a capture sample against a gallery of templates.
pub trait Matcher {
    fn compare(&self, query: &CaptureSample, gallery: &[FaceTemplate], threshold: f32) -> MatchResult;
}

/// Linear-scan matcher scoring `1 - distance / scale`.
#[derive(Debug, Clone, Copy)]
pub struct FaceMatcher {
    scale: f32,
}

impl Default for FaceMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_SCALE)
    }
}

impl FaceMatcher {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Owner id of the best matching template, if any clears `threshold`.
    pub fn identify(
        &self,
        query: &CaptureSample,
        gallery: &[FaceTemplate],
        threshold: f32,
    ) -> Option<String> {
        self.compare(query, gallery, threshold).owner_id
    }
}

impl Matcher for FaceMatcher {
    fn compare(&self, query: &CaptureSample, gallery: &[FaceTemplate], threshold: f32) -> MatchResult {
        if !query.detected || query.confidence < threshold {
            tracing::debug!(
                detected = query.detected,
                confidence = query.confidence,
                threshold,
                "sample below confidence threshold; not compared"
            );
            return MatchResult::no_match();
        }

        let mut result = MatchResult::no_match();
        let mut best_idx: Option<usize> = None;

        for (i, template) in gallery.iter().enumerate() {
            let sim = match query.features.similarity(&template.features, self.scale) {
                Ok(sim) => sim,
                Err(err) => {
                    tracing::warn!(owner = %template.owner_id, error = %err, "skipping template");
                    result.skipped += 1;
                    continue;
                }
            };
            result.compared += 1;

            // Strict comparison keeps the first of equal candidates.
            if sim > result.similarity && sim > threshold {
                result.similarity = sim;
                best_idx = Some(i);
            }
        }

        if let Some(idx) = best_idx {
            result.matched = true;
            result.owner_id = Some(gallery[idx].owner_id.clone());
        }
        result
    }
}
