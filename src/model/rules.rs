//! Reason generation and security override rules.
//!
//! The `FEATURE_THRESHOLDS` table drives human-readable explanations only —
//! it never decides `is_anomaly` on its own. The override rules
//! below are the one mechanism that can force an anomaly verdict regardless
//! of what the forest says.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::features::{BuildFeatures, FEATURE_NAMES};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReason {
    pub feature: Option<String>,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
    pub z_score: f64,
    pub deviation: &'static str,
}

struct Threshold {
    feature: &'static str,
    high: f64,
    very_high: f64,
    reason: &'static str,
}

/// Reason-generation cutoffs, using the deployed exact-value threshold table.
/// Order matches the spec table and is preserved in emitted reasons.
const FEATURE_THRESHOLDS: &[Threshold] = &[
    Threshold { feature: "duration_seconds", high: 600.0, very_high: 1800.0, reason: "Unusually long build duration" },
    Threshold { feature: "log_line_count", high: 8000.0, very_high: 15000.0, reason: "Excessive log volume" },
    Threshold { feature: "char_density", high: 150.0, very_high: 300.0, reason: "Unusually dense log lines" },
    Threshold { feature: "error_count", high: 200.0, very_high: 500.0, reason: "High error count" },
    Threshold { feature: "warning_count", high: 300.0, very_high: 600.0, reason: "Excessive warnings" },
    Threshold { feature: "step_count", high: 30.0, very_high: 50.0, reason: "Unusual number of pipeline steps" },
    Threshold { feature: "unique_templates", high: 600.0, very_high: 1000.0, reason: "Unusual log pattern diversity" },
    Threshold { feature: "template_entropy", high: 8.0, very_high: 10.0, reason: "High log randomness" },
    Threshold { feature: "suspicious_pattern_count", high: 1.0, very_high: 5.0, reason: "Suspicious command patterns" },
    Threshold { feature: "external_ip_count", high: 1.0, very_high: 5.0, reason: "Multiple external IPs" },
    Threshold { feature: "external_url_count", high: 10.0, very_high: 50.0, reason: "Excessive untrusted URL access" },
    Threshold { feature: "base64_pattern_count", high: 5.0, very_high: 15.0, reason: "Potential data obfuscation" },
];

/// Evaluates the three hardcoded security override rules against the raw
/// feature values. Returns the ordered list of critical
/// reasons they produced; an empty list means no override fired.
pub fn check_security_rules(features: &BuildFeatures) -> Vec<AnomalyReason> {
    let mut reasons = Vec::new();

    let suspicious = features.suspicious_pattern_count;
    if suspicious >= 1 {
        reasons.push(AnomalyReason {
            feature: Some("suspicious_pattern_count".to_string()),
            value: Some(suspicious as f64),
            threshold: None,
            reason: format!(
                "Detected {suspicious} suspicious command pattern(s) (e.g., xmrig, nc -e, curl|bash)"
            ),
            severity: Severity::Critical,
        });
    }

    if features.external_ip_count >= 2 && suspicious >= 1 {
        reasons.push(AnomalyReason {
            feature: Some("external_ip_count".to_string()),
            value: Some(features.external_ip_count as f64),
            threshold: None,
            reason: format!(
                "Multiple external IP connections ({}) with suspicious patterns",
                features.external_ip_count
            ),
            severity: Severity::Critical,
        });
    }

    if features.duration_seconds > 1200.0 && suspicious >= 1 {
        reasons.push(AnomalyReason {
            feature: Some("duration_seconds".to_string()),
            value: Some(features.duration_seconds),
            threshold: None,
            reason: format!(
                "Extended build duration ({}s) with suspicious patterns - possible cryptomining",
                features.duration_seconds
            ),
            severity: Severity::Critical,
        });
    }

    reasons
}

/// Threshold-crossing explanations for a flagged build. Emits a single
/// generic reason if the build was flagged (by the model or an override)
/// but no individual feature crossed a cutoff.
pub fn generate_reasons(features: &BuildFeatures, is_anomaly: bool) -> Vec<AnomalyReason> {
    if !is_anomaly {
        return Vec::new();
    }

    let values = feature_value_map(features);
    let mut reasons = Vec::new();

    for t in FEATURE_THRESHOLDS {
        let Some(&value) = values.get(t.feature) else {
            continue;
        };

        if value >= t.very_high {
            reasons.push(AnomalyReason {
                feature: Some(t.feature.to_string()),
                value: Some(value),
                threshold: Some(t.very_high),
                reason: t.reason.to_string(),
                severity: Severity::Critical,
            });
        } else if value >= t.high {
            reasons.push(AnomalyReason {
                feature: Some(t.feature.to_string()),
                value: Some(value),
                threshold: Some(t.high),
                reason: t.reason.to_string(),
                severity: Severity::Warning,
            });
        }
    }

    if reasons.is_empty() {
        reasons.push(AnomalyReason {
            feature: None,
            value: None,
            threshold: None,
            reason: "Unusual combination of build metrics".to_string(),
            severity: Severity::Warning,
        });
    }

    reasons
}

/// Top-5 features by absolute z-score against the training distribution.
pub fn top_contributing_features(
    features: &BuildFeatures,
    feature_means: &HashMap<String, f64>,
    feature_stds: &HashMap<String, f64>,
) -> Vec<FeatureContribution> {
    let values = feature_value_map(features);

    let mut contributions: Vec<FeatureContribution> = FEATURE_NAMES
        .iter()
        .map(|&name| {
            let value = *values.get(name).unwrap_or(&0.0);
            let mean = feature_means.get(name).copied().unwrap_or(0.0);
            let std = feature_stds.get(name).copied().unwrap_or(0.0);
            let z_score = if std > 0.0 { ((value - mean) / std).abs() } else { 0.0 };
            FeatureContribution {
                feature: name.to_string(),
                value,
                z_score: (z_score * 100.0).round() / 100.0,
                deviation: if z_score > 2.0 { "high" } else { "normal" },
            }
        })
        .collect();

    contributions.sort_by(|a, b| b.z_score.partial_cmp(&a.z_score).unwrap());
    contributions.truncate(5);
    contributions
}

fn feature_value_map(features: &BuildFeatures) -> HashMap<&'static str, f64> {
    FEATURE_NAMES
        .iter()
        .copied()
        .zip(features.to_feature_vector())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_features() -> BuildFeatures {
        BuildFeatures {
            build_id: "1".into(),
            repo_name: "acme/widgets".into(),
            branch: "main".into(),
            commit_sha: "abc".into(),
            duration_seconds: 100.0,
            log_line_count: 10,
            char_density: 20.0,
            error_count: 0,
            warning_count: 0,
            step_count: 3,
            unique_templates: 5,
            template_entropy: 1.0,
            suspicious_pattern_count: 0,
            external_ip_count: 0,
            external_url_count: 0,
            base64_pattern_count: 0,
            provider: "github".into(),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn suspicious_pattern_triggers_rule_one() {
        let mut f = base_features();
        f.suspicious_pattern_count = 1;
        let reasons = check_security_rules(&f);
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].severity, Severity::Critical);
    }

    #[test]
    fn multiple_ips_and_suspicious_patterns_trigger_rule_two() {
        let mut f = base_features();
        f.suspicious_pattern_count = 1;
        f.external_ip_count = 2;
        let reasons = check_security_rules(&f);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn long_duration_with_suspicious_patterns_triggers_rule_three() {
        let mut f = base_features();
        f.suspicious_pattern_count = 1;
        f.duration_seconds = 1500.0;
        let reasons = check_security_rules(&f);
        assert_eq!(reasons.len(), 2);
        assert!(reasons.iter().any(|r| r.reason.contains("cryptomining")));
    }

    #[test]
    fn no_rules_fire_on_quiet_build() {
        assert!(check_security_rules(&base_features()).is_empty());
    }

    #[test]
    fn generic_reason_when_no_threshold_crosses_but_flagged() {
        let reasons = generate_reasons(&base_features(), true);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].feature.is_none());
    }

    #[test]
    fn normal_build_gets_zero_reasons() {
        let reasons = generate_reasons(&base_features(), false);
        assert!(reasons.is_empty());
    }
}
