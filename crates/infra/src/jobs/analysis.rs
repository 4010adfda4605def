//! Per-item labels and the aggregated analysis result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One classified content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemLabel {
    pub item_id: String,
    pub label: String,
    pub confidence: f64,
}

impl ItemLabel {
    pub fn new(item_id: impl Into<String>, label: impl Into<String>, confidence: f64) -> Self {
        Self {
            item_id: item_id.into(),
            label: label.into(),
            confidence,
        }
    }
}

/// Aggregate figures for a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_items: u64,
    pub counts_per_label: BTreeMap<String, u64>,
    pub average_confidence: f64,
    pub average_confidence_per_label: BTreeMap<String, f64>,
}

/// Result payload: every item label in classification order plus a summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub items: Vec<ItemLabel>,
    pub summary: AnalysisSummary,
}

impl AnalysisResult {
    pub fn from_items(items: Vec<ItemLabel>) -> Self {
        let summary = AnalysisSummary::from_items(&items);
        Self { items, summary }
    }

    /// Approximate stored size in bytes (serialized JSON length).
    pub fn size_estimate(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}

impl AnalysisSummary {
    pub fn from_items(items: &[ItemLabel]) -> Self {
        if items.is_empty() {
            return Self::default();
        }

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_confidence = 0.0;

        for item in items {
            *counts.entry(item.label.clone()).or_default() += 1;
            *sums.entry(item.label.clone()).or_default() += item.confidence;
            total_confidence += item.confidence;
        }

        let average_confidence_per_label = sums
            .into_iter()
            .map(|(label, sum)| {
                let n = counts.get(&label).copied().unwrap_or(1) as f64;
                (label, sum / n)
            })
            .collect();

        Self {
            total_items: items.len() as u64,
            counts_per_label: counts,
            average_confidence: total_confidence / items.len() as f64,
            average_confidence_per_label,
        }
    }
}
