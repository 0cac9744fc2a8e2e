//! Rejection reports: persisted twice on every failed verification, as a
//! markdown file for the operator and a knowledge-graph observation for
//! future recall.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;

use crate::plan::{PlanStep, VerificationResult};

pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn default_dir() -> PathBuf {
        triad_config::Config::config_dir().join("reports")
    }

    /// Write `rejection_step_{id}_{ts}.md`, returning its path.
    pub fn write_rejection(
        &self,
        step: &PlanStep,
        verification: &VerificationResult,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("rejection_step_{}_{ts}.md", step.id));

        let mut content = format!("# Rejection Report: Step {}\n\n", step.id);
        content.push_str(&format!("- **Action**: {}\n", step.action));
        content.push_str(&format!("- **Expected**: {}\n", step.expected_result));
        content.push_str(&format!("- **Realm**: {}\n", step.realm));
        content.push_str(&format!(
            "- **Confidence**: {:.2}\n\n",
            verification.confidence
        ));
        content.push_str("## Verdict\n\n");
        content.push_str(&verification.description);
        content.push_str("\n\n## Issues\n\n");
        if verification.issues.is_empty() {
            content.push_str("- (none listed)\n");
        } else {
            for issue in &verification.issues {
                content.push_str(&format!("- {issue}\n"));
            }
        }

        std::fs::write(&path, content)?;
        tracing::info!(path = %path.display(), step = step.id, "Rejection report written");
        Ok(path)
    }

    /// Compact single-string form for the bus and the knowledge graph.
    pub fn format_summary(step: &PlanStep, verification: &VerificationResult) -> String {
        format!(
            "Step {} rejected (confidence {:.2}): {}. Issues: {}",
            step.id,
            verification.confidence,
            verification.description,
            if verification.issues.is_empty() {
                "none listed".to_string()
            } else {
                verification.issues.join("; ")
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_rejection_report() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let step = PlanStep {
            id: 4,
            action: "configure bridged network".to_string(),
            expected_result: "VM has bridged network".to_string(),
            realm: "macos-use".to_string(),
            ..Default::default()
        };
        let verification = VerificationResult::rejected(
            4,
            "commands did not touch network settings",
            vec!["irrelevant command".to_string()],
        );

        let path = writer.write_rejection(&step, &verification).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("rejection_step_4_"));
        assert!(content.contains("irrelevant command"));
        assert!(content.contains("bridged network"));
    }

    #[test]
    fn test_summary_format() {
        let step = PlanStep {
            id: 2,
            action: "open app".to_string(),
            ..Default::default()
        };
        let verification = VerificationResult::rejected(2, "not open", vec![]);
        let summary = ReportWriter::format_summary(&step, &verification);
        assert!(summary.contains("Step 2 rejected"));
        assert!(summary.contains("none listed"));
    }
}
