use std::collections::BTreeMap;
use std::fmt;
use serde::Serialize;

use crate::database::repo::SearchId;
use crate::pipeline::candidate::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    DiscoveryExhausted,
    IdleRounds,
    MaxRounds,
    Aborted,
    Deadline,
}

impl StopReason {
    /// Whether the run ended on its own terms rather than being cut short.
    pub fn is_graceful(self) -> bool {
        !matches!(self, StopReason::Aborted | StopReason::Deadline)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::TargetReached => "target reached",
            StopReason::DiscoveryExhausted => "discovery exhausted",
            StopReason::IdleRounds => "too many rounds without new images",
            StopReason::MaxRounds => "round limit reached",
            StopReason::Aborted => "aborted",
            StopReason::Deadline => "deadline passed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub search_id: SearchId,
    pub query: String,
    pub target: usize,
    pub accepted: usize,
    pub filtered: usize,
    pub filtered_by_reason: BTreeMap<String, usize>,
    pub duplicate: usize,
    pub failed: usize,
    pub failed_by_kind: BTreeMap<String, usize>,
    pub rounds: u32,
    pub stop_reason: Option<StopReason>,
    pub elapsed_secs: f64,
    pub diagnosis: Option<String>,
}

impl RunSummary {
    pub fn new(search_id: SearchId, query: &str, target: usize) -> Self {
        Self {
            search_id,
            query: query.to_string(),
            target,
            accepted: 0,
            filtered: 0,
            filtered_by_reason: BTreeMap::new(),
            duplicate: 0,
            failed: 0,
            failed_by_kind: BTreeMap::new(),
            rounds: 0,
            stop_reason: None,
            elapsed_secs: 0.0,
            diagnosis: None,
        }
    }

    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Recorded { .. } => self.accepted += 1,
            Outcome::Filtered(reason) => {
                self.filtered += 1;
                *self.filtered_by_reason.entry(reason.kind().to_string()).or_default() += 1;
            }
            Outcome::Duplicate(_) => self.duplicate += 1,
            Outcome::Failed(err) => {
                self.failed += 1;
                *self.failed_by_kind.entry(err.kind().to_string()).or_default() += 1;
            }
        }
    }

    pub fn finish(&mut self, reason: StopReason, elapsed_secs: f64) {
        self.stop_reason = Some(reason);
        self.elapsed_secs = elapsed_secs;
        self.diagnosis = self.diagnose();
    }

    /// One-line hint about why a run fell short, from whichever
    /// rejection cause dominates.
    fn diagnose(&self) -> Option<String> {
        if self.accepted >= self.target {
            return None;
        }
        let rejected = self.filtered + self.duplicate + self.failed;
        if rejected == 0 {
            return Some("no candidates were processed: discovery found nothing usable".to_string());
        }

        let hint = if self.filtered * 2 > rejected {
            match dominant(&self.filtered_by_reason) {
                Some("low_score") => "mostly filtered by score: the threshold may be too strict",
                Some("deny_pattern") => "mostly filtered by url pattern: sources link mostly site chrome",
                _ => "mostly filtered as too small: sources serve thumbnails",
            }
        } else if self.failed * 2 > rejected {
            match dominant(&self.failed_by_kind) {
                Some("permanent_fetch") => "mostly permanent fetch errors: sources may be blocking automated access",
                Some("transient_fetch") => "mostly transient fetch errors: the network or sources are unreliable",
                Some("decode") => "mostly undecodable payloads: sources serve unsupported formats",
                _ => "mostly storage failures: check the output directory and database",
            }
        } else if self.duplicate * 2 > rejected {
            "mostly duplicates: sources keep returning images already stored"
        } else {
            return None;
        };
        Some(hint.to_string())
    }
}

fn dominant(counts: &BTreeMap<String, usize>) -> Option<&str> {
    counts.iter().max_by_key(|(_, n)| **n).map(|(k, _)| k.as_str())
}

fn breakdown(counts: &BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = counts.iter().map(|(k, n)| format!("{} {}", k, n)).collect();
    format!(" ({})", parts.join(", "))
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Search #{} \"{}\"", self.search_id, self.query)?;
        writeln!(f, "  accepted:  {}/{}", self.accepted, self.target)?;
        writeln!(f, "  filtered:  {}{}", self.filtered, breakdown(&self.filtered_by_reason))?;
        writeln!(f, "  duplicate: {}", self.duplicate)?;
        writeln!(f, "  failed:    {}{}", self.failed, breakdown(&self.failed_by_kind))?;
        write!(f, "  rounds:    {}, {:.1}s", self.rounds, self.elapsed_secs)?;
        if let Some(reason) = self.stop_reason {
            write!(f, ", stopped: {}", reason)?;
        }
        if let Some(hint) = &self.diagnosis {
            write!(f, "\n  hint:      {}", hint)?;
        }
        Ok(())
    }
}
