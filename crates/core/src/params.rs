//! Classification parameters supplied with a submission.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

const MAX_MODEL_LEN: usize = 128;
const MAX_LABELS: usize = 64;
const MAX_LABEL_LEN: usize = 64;

/// Parameters forwarded to the classification service.
///
/// Part of the request fingerprint: two submissions with equal params (after
/// normalisation) and the same source/count share one computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationParams {
    /// Model identifier understood by the classification service.
    pub model: String,
    /// Candidate label set. Empty means "the model's default labels".
    #[serde(default)]
    pub labels: Vec<String>,
    /// Optional language hint (BCP-47-ish, e.g. `en`, `pt-BR`).
    #[serde(default)]
    pub language: Option<String>,
}

impl ClassificationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            labels: Vec::new(),
            language: None,
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Reject malformed params.
    pub fn validate(&self) -> DomainResult<()> {
        let model = self.model.trim();
        if model.is_empty() {
            return Err(DomainError::validation("params.model must not be empty"));
        }
        if model.len() > MAX_MODEL_LEN {
            return Err(DomainError::validation(format!(
                "params.model longer than {MAX_MODEL_LEN} characters"
            )));
        }
        if !model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':' | '/'))
        {
            return Err(DomainError::validation(
                "params.model contains unsupported characters",
            ));
        }

        if self.labels.len() > MAX_LABELS {
            return Err(DomainError::validation(format!(
                "at most {MAX_LABELS} labels are supported"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for label in &self.labels {
            let norm = label.trim().to_lowercase();
            if norm.is_empty() {
                return Err(DomainError::validation("labels must not be blank"));
            }
            if norm.len() > MAX_LABEL_LEN {
                return Err(DomainError::validation(format!(
                    "label '{label}' longer than {MAX_LABEL_LEN} characters"
                )));
            }
            if !seen.insert(norm) {
                return Err(DomainError::validation(format!("duplicate label '{label}'")));
            }
        }

        if let Some(lang) = &self.language {
            let ok = (2..=8).contains(&lang.len())
                && lang.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
            if !ok {
                return Err(DomainError::validation(format!(
                    "params.language '{lang}' is not a language tag"
                )));
            }
        }

        Ok(())
    }

    /// Canonical form used for fingerprinting: trimmed, lowercased labels in
    /// sorted order and a lowercased language tag.
    pub fn normalized(&self) -> Self {
        let mut labels: Vec<String> = self
            .labels
            .iter()
            .map(|l| l.trim().to_lowercase())
            .collect();
        labels.sort();
        Self {
            model: self.model.trim().to_string(),
            labels,
            language: self.language.as_ref().map(|l| l.to_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_params() {
        assert!(ClassificationParams::new("sentiment-v2").validate().is_ok());
    }

    #[test]
    fn rejects_blank_model() {
        let err = ClassificationParams::new("  ").validate().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_labels_case_insensitively() {
        let params = ClassificationParams::new("m").with_labels(["Positive", "positive "]);
        assert!(matches!(params.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn rejects_bad_language_tag() {
        let params = ClassificationParams::new("m").with_language("english!");
        assert!(params.validate().is_err());
        let params = ClassificationParams::new("m").with_language("pt-BR");
        assert!(params.validate().is_ok());
    }

    #[test]
    fn normalized_sorts_and_lowercases_labels() {
        let params = ClassificationParams::new(" m ")
            .with_labels(["Neutral", "negative", "POSITIVE"])
            .with_language("EN");
        let n = params.normalized();
        assert_eq!(n.model, "m");
        assert_eq!(n.labels, vec!["negative", "neutral", "positive"]);
        assert_eq!(n.language.as_deref(), Some("en"));
    }
}
