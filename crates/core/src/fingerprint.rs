//! Request fingerprint: deterministic hash of the semantically relevant inputs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::SourceRef;
use crate::params::ClassificationParams;

/// Bumped whenever the canonical encoding changes, so old cache entries stop matching.
const FINGERPRINT_VERSION: &str = "bulklabel/v1";

/// Hex-encoded SHA-256 of `(source_ref, requested_count, normalized params)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    version: &'static str,
    source_ref: &'a str,
    requested_count: u64,
    params: ClassificationParams,
}

impl Fingerprint {
    pub fn compute(
        source_ref: &SourceRef,
        requested_count: u64,
        params: &ClassificationParams,
    ) -> Self {
        let canonical = CanonicalRequest {
            version: FINGERPRINT_VERSION,
            source_ref: source_ref.as_str().trim(),
            requested_count,
            params: params.normalized(),
        };
        // Serializing a plain struct of strings/ints cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed fingerprint (e.g. loaded from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> ClassificationParams {
        ClassificationParams::new("sentiment-v2").with_labels(["positive", "negative"])
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let a = Fingerprint::compute(&SourceRef::new("vid-1"), 250, &params());
        let b = Fingerprint::compute(&SourceRef::new("vid-1"), 250, &params());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn label_order_does_not_matter() {
        let reordered = ClassificationParams::new("sentiment-v2").with_labels(["Negative", "positive"]);
        let a = Fingerprint::compute(&SourceRef::new("vid-1"), 250, &params());
        let b = Fingerprint::compute(&SourceRef::new("vid-1"), 250, &reordered);
        assert_eq!(a, b);
    }

    #[test]
    fn count_and_source_change_the_fingerprint() {
        let base = Fingerprint::compute(&SourceRef::new("vid-1"), 250, &params());
        assert_ne!(base, Fingerprint::compute(&SourceRef::new("vid-1"), 251, &params()));
        assert_ne!(base, Fingerprint::compute(&SourceRef::new("vid-2"), 250, &params()));
        assert_ne!(
            base,
            Fingerprint::compute(&SourceRef::new("vid-1"), 250, &ClassificationParams::new("other"))
        );
    }

    #[test]
    fn short_tolerates_non_ascii_and_short_input() {
        assert_eq!(Fingerprint::from_hex("abc").short(), "abc");
        assert_eq!(Fingerprint::from_hex("aéééééé").short(), "aéééééé");
        assert_eq!(Fingerprint::from_hex("0123456789abcdef").short(), "0123456789ab");
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic(source in "[a-z0-9]{1,16}", count in 1u64..100_000) {
            let a = Fingerprint::compute(&SourceRef::new(source.clone()), count, &params());
            let b = Fingerprint::compute(&SourceRef::new(source), count, &params());
            prop_assert_eq!(a, b);
        }
    }
}
