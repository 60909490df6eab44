use std::path::Path;

use anyhow::{Context, Result};
use drev_core::{Metrics, ScoresPresent, Violation};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FLAGGED_STATUS: &str = "needs review";
pub const DEFAULT_CLEAN_STATUS: &str = "no status";

/// Thresholds and labels from `rules/classification.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationPolicy {
    pub rudeness_above: f64,
    pub politeness_below: f64,
    pub friendliness_below: f64,
    pub manipulativeness_above: f64,
    pub require_greeting: bool,
    pub flagged_status: String,
    pub clean_status: String,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            rudeness_above: 0.5,
            politeness_below: 0.5,
            friendliness_below: 0.5,
            manipulativeness_above: 0.5,
            require_greeting: true,
            flagged_status: DEFAULT_FLAGGED_STATUS.to_string(),
            clean_status: DEFAULT_CLEAN_STATUS.to_string(),
        }
    }
}

impl ClassificationPolicy {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing classification policy")
    }

    /// Reads `rules/classification.yaml`; a missing file means the defaults.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("rules").join("classification.yaml");
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub status: String,
    pub violations: Vec<Violation>,
}

impl Classification {
    pub fn is_flagged(&self) -> bool {
        !self.violations.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    policy: ClassificationPolicy,
}

impl Classifier {
    pub fn new(policy: ClassificationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ClassificationPolicy {
        &self.policy
    }

    /// Classifies fully populated metrics.
    pub fn classify(&self, metrics: &Metrics) -> Classification {
        self.classify_partial(metrics, ScoresPresent::ALL)
    }

    /// Lower-bound rules (politeness, friendliness) apply only to scores the
    /// payload carried; an absent score defaults to zero and carries no signal.
    pub fn classify_partial(&self, metrics: &Metrics, present: ScoresPresent) -> Classification {
        let p = &self.policy;
        let mut violations = Vec::new();
        if metrics.rudeness > p.rudeness_above {
            violations.push(Violation::Rudeness);
        }
        if present.politeness && metrics.politeness < p.politeness_below {
            violations.push(Violation::Impoliteness);
        }
        if present.friendliness && metrics.friendliness < p.friendliness_below {
            violations.push(Violation::Unfriendliness);
        }
        if metrics.manipulativeness > p.manipulativeness_above {
            violations.push(Violation::Manipulation);
        }
        if p.require_greeting && !metrics.said_hello {
            violations.push(Violation::MissingGreeting);
        }

        let status = if violations.is_empty() {
            p.clean_status.clone()
        } else {
            p.flagged_status.clone()
        };
        Classification { status, violations }
    }

    /// Classification for a record whose metrics payload was absent or unparseable.
    pub fn classify_missing(&self) -> Classification {
        self.classify_partial(&Metrics::default(), ScoresPresent::NONE)
    }
}
