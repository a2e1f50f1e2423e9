//! Success detection by marker substrings.
//!
//! This is a heuristic boundary: if a remote script changes the text it
//! prints, classification changes with it and nothing else notices. Output
//! without a recognised success marker is a failure.

use std::sync::Arc;

use crate::template::{ExpectedMarkers, ScriptRegistry};

pub trait OutcomeClassifier: Send + Sync {
    fn classify(&self, script_id: &str, raw_output: &str) -> bool;
}

pub struct MarkerClassifier {
    registry: Arc<dyn ScriptRegistry>,
}

impl MarkerClassifier {
    pub fn new(registry: Arc<dyn ScriptRegistry>) -> Self {
        Self { registry }
    }
}

impl OutcomeClassifier for MarkerClassifier {
    fn classify(&self, script_id: &str, raw_output: &str) -> bool {
        match self.registry.lookup(script_id) {
            Some(template) => matches_markers(template.markers(), raw_output),
            None => {
                tracing::warn!(
                    event = "classify.unknown_script",
                    script_id = %script_id,
                    "no markers for script, treating output as failure"
                );
                false
            }
        }
    }
}

/// A failure marker wins over any success marker.
pub fn matches_markers(markers: &ExpectedMarkers, raw_output: &str) -> bool {
    if markers
        .failure
        .iter()
        .any(|marker| !marker.is_empty() && raw_output.contains(marker.as_str()))
    {
        return false;
    }
    markers
        .success
        .iter()
        .any(|marker| !marker.is_empty() && raw_output.contains(marker.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::StaticScriptRegistry;
    use proptest::prelude::*;
    use protocol::config::ScriptDefinition;

    fn markers(success: &[&str], failure: &[&str]) -> ExpectedMarkers {
        ExpectedMarkers {
            success: success.iter().map(|m| m.to_string()).collect(),
            failure: failure.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn success_marker_present() {
        let markers = markers(&["INSTALL OK"], &["INSTALL FAILED"]);
        assert!(matches_markers(&markers, "...\nINSTALL OK\n"));
    }

    #[test]
    fn failure_marker_overrides_success() {
        let markers = markers(&["INSTALL OK"], &["INSTALL FAILED"]);
        assert!(!matches_markers(&markers, "INSTALL OK\nINSTALL FAILED"));
    }

    #[test]
    fn no_marker_is_failure() {
        let markers = markers(&["INSTALL OK"], &[]);
        assert!(!matches_markers(&markers, ""));
        assert!(!matches_markers(&markers, "all good, probably"));
        assert!(!matches_markers(&markers, "\u{fffd}\u{fffd}INSTALL O"));
    }

    #[test]
    fn script_without_success_markers_never_succeeds() {
        assert!(!matches_markers(&markers(&[], &[]), "anything"));
        assert!(!matches_markers(&markers(&[""], &[]), "anything"));
    }

    #[test]
    fn unknown_script_is_failure() {
        let registry = StaticScriptRegistry::from_definitions(&[ScriptDefinition {
            id: "known".to_string(),
            template: "run".to_string(),
            success_markers: vec!["DONE".to_string()],
            failure_markers: Vec::new(),
            secrets: Vec::new(),
            timeout_secs: None,
        }])
        .expect("registry");
        let classifier = MarkerClassifier::new(Arc::new(registry));
        assert!(classifier.classify("known", "DONE"));
        assert!(!classifier.classify("unknown", "DONE"));
    }

    proptest! {
        #[test]
        fn output_without_marker_is_never_success(output in "[a-z \n]{0,200}") {
            let markers = markers(&["MARKER_OK"], &[]);
            prop_assert!(!matches_markers(&markers, &output));
        }
    }
}
