//! Security-aware numeric feature extraction from a parsed CI build.
//!
//! Turns a webhook-shaped payload plus its raw log text into a fixed-order
//! 12-value [`BuildFeatures`] vector, the input to the anomaly model.

mod payload;
mod trusted_domains;

pub use payload::{BuildStep, RawBuild};

use crate::drain::DrainParser;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Feature vector for a single build, the sole input to the anomaly model.
///
/// `to_feature_vector()` and `FEATURE_NAMES` must stay in lockstep — the
/// model indexes features positionally, not by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFeatures {
    pub build_id: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,

    pub duration_seconds: f64,
    pub log_line_count: u32,
    pub char_density: f64,
    pub error_count: u32,
    pub warning_count: u32,

    pub step_count: u32,

    pub unique_templates: u32,
    pub template_entropy: f64,

    pub suspicious_pattern_count: u32,
    pub external_ip_count: u32,
    pub external_url_count: u32,
    pub base64_pattern_count: u32,

    pub provider: String,
    pub processed_at: DateTime<Utc>,
}

/// Feature names, in the exact order `to_feature_vector` emits them.
pub const FEATURE_NAMES: [&str; 12] = [
    "duration_seconds",
    "log_line_count",
    "char_density",
    "error_count",
    "warning_count",
    "step_count",
    "unique_templates",
    "template_entropy",
    "suspicious_pattern_count",
    "external_ip_count",
    "external_url_count",
    "base64_pattern_count",
];

impl BuildFeatures {
    pub fn to_feature_vector(&self) -> [f64; 12] {
        [
            self.duration_seconds,
            self.log_line_count as f64,
            self.char_density,
            self.error_count as f64,
            self.warning_count as f64,
            self.step_count as f64,
            self.unique_templates as f64,
            self.template_entropy,
            self.suspicious_pattern_count as f64,
            self.external_ip_count as f64,
            self.external_url_count as f64,
            self.base64_pattern_count as f64,
        ]
    }
}

static IP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://([^\s<>"']+)"#).unwrap());

/// Context-restricted base64 detector: requires an explicit decode command,
/// an echoed base64-looking token, or a pipe into `base64`, rather than
/// matching any 40+ character base64-alphabet run in isolation, which
/// otherwise flags commit SHAs, JWTs, and long hex IDs as suspicious. A bare
/// mention of the word `base64` with no decode context does not count.
/// The broad variant is preserved behind [`SuspiciousPatternConfig::allow_broad_base64`].
///
/// The `echo`-branch match carries the token in capture group 1; an echoed
/// string that merely looks base64-ish but doesn't actually decode (e.g. a
/// long hex digest) is filtered out by `count_base64_patterns` below rather
/// than counted on pattern shape alone.
static BASE64_CONTEXT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:base64\s+(?:-d|-decode|--decode)\b|\|\s*base64\b)|echo\s+["']?([A-Za-z0-9+/]{50,}={0,2})["']?"#,
    )
    .unwrap()
});
static BASE64_BROAD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").unwrap());

static SUSPICIOUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)curl.*-X\s*POST",
        r"(?i)wget.*--post",
        r"(?i)nc\s+(-e|-c)",
        r"(?i)bash\s+-i",
        r"(?i)/dev/tcp/",
        r"(?i)mkfifo",
        r"(?i)xmrig|minerd|cryptonight",
        r"(?i)stratum\+tcp://",
        r"(?i)hashrate",
        r"(?i)cat\s+/etc/(passwd|shadow)",
        r"(?i)\$\([^)]+\)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const ERROR_KEYWORDS: [&str; 6] = ["error", "failed", "failure", "exception", "fatal", "critical"];
const WARNING_KEYWORDS: [&str; 4] = ["warning", "warn", "deprecated", "caution"];

/// Toggles for security-pattern matching behavior.
#[derive(Debug, Clone, Copy)]
pub struct SuspiciousPatternConfig {
    /// Re-enable the broad base64-alphabet regex in addition to the
    /// context-restricted one. Off by default: it flags commit SHAs and
    /// JWTs as often as it flags actual encoded payloads.
    pub allow_broad_base64: bool,
}

impl Default for SuspiciousPatternConfig {
    fn default() -> Self {
        Self {
            allow_broad_base64: false,
        }
    }
}

pub struct FeatureExtractor {
    config: SuspiciousPatternConfig,
}

impl FeatureExtractor {
    pub fn new(config: SuspiciousPatternConfig) -> Self {
        Self { config }
    }

    /// Extract a [`BuildFeatures`] vector from a provider-dialect payload,
    /// alongside the per-line Drain parse results so the caller can persist
    /// the discovered templates.
    ///
    /// Mutates `parser` (the Drain tree accumulates new templates as logs
    /// from this build are parsed).
    pub fn extract(
        &self,
        raw: &RawBuild,
        parser: &mut DrainParser,
    ) -> (BuildFeatures, Vec<crate::drain::ParseResult>) {
        let log_lines = Self::resolve_log_lines(raw);

        let non_blank: Vec<&String> = log_lines.iter().filter(|l| !l.trim().is_empty()).collect();
        let line_count = non_blank.len() as u32;
        let total_chars: usize = log_lines.iter().map(|l| l.chars().count()).sum();
        let char_density = total_chars as f64 / (line_count.max(1) as f64);

        let error_count = Self::count_keyword_lines(&log_lines, &ERROR_KEYWORDS);
        let warning_count = Self::count_keyword_lines(&log_lines, &WARNING_KEYWORDS);

        let parse_results = parser.parse_logs(&log_lines);
        let unique_templates = parse_results
            .iter()
            .map(|r| r.template_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u32;
        let template_entropy = Self::entropy(&parse_results);

        let all_text = log_lines.join("\n");
        let suspicious_pattern_count = self.count_suspicious_patterns(&all_text);
        let external_ips: HashSet<String> = IP_PATTERN
            .find_iter(&all_text)
            .map(|m| m.as_str().to_string())
            .collect();
        let external_url_count = Self::count_external_urls(&all_text);
        let base64_pattern_count = self.count_base64_patterns(&all_text);

        let public_ip_count = external_ips
            .iter()
            .filter(|ip| !Self::is_private_ip(ip))
            .count() as u32;

        let features = BuildFeatures {
            build_id: raw.build_id.clone(),
            repo_name: raw.repo_name.clone(),
            branch: raw.branch.clone(),
            commit_sha: raw.commit_sha.clone(),
            duration_seconds: raw.duration_seconds,
            log_line_count: line_count,
            char_density: round2(char_density),
            error_count,
            warning_count,
            step_count: raw.steps.len() as u32,
            unique_templates,
            template_entropy: round4(template_entropy),
            suspicious_pattern_count,
            external_ip_count: public_ip_count,
            external_url_count,
            base64_pattern_count,
            provider: raw.provider.clone(),
            processed_at: Utc::now(),
        };

        (features, parse_results)
    }

    fn resolve_log_lines(raw: &RawBuild) -> Vec<String> {
        let mut lines: Vec<String> = if raw.raw_logs.is_empty() {
            Vec::new()
        } else {
            raw.raw_logs.split('\n').map(|s| s.to_string()).collect()
        };

        if lines.len() <= 1 {
            lines = raw
                .steps
                .iter()
                .flat_map(|s| s.log_lines.iter().cloned())
                .collect();
        }

        lines
    }

    fn count_keyword_lines(lines: &[String], keywords: &[&str]) -> u32 {
        lines
            .iter()
            .filter(|line| {
                let lower = line.to_lowercase();
                keywords.iter().any(|kw| lower.contains(kw))
            })
            .count() as u32
    }

    fn count_suspicious_patterns(&self, text: &str) -> u32 {
        SUSPICIOUS_PATTERNS
            .iter()
            .map(|p| p.find_iter(text).count() as u32)
            .sum()
    }

    fn count_base64_patterns(&self, text: &str) -> u32 {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let mut count = 0u32;
        for caps in BASE64_CONTEXT_PATTERN.captures_iter(text) {
            match caps.get(1) {
                // Echoed-token branch: only count it if the token actually
                // decodes, so a long hex commit SHA or JWT segment that
                // happens to match the base64 alphabet isn't flagged.
                Some(token) => {
                    if STANDARD.decode(token.as_str()).is_ok() {
                        count += 1;
                    }
                }
                // Decode-command / pipe-into-base64 branch: the command
                // itself is the signal, there is no token to validate.
                None => count += 1,
            }
        }

        if self.config.allow_broad_base64 {
            count += BASE64_BROAD_PATTERN.find_iter(text).count() as u32;
        }
        count
    }

    fn entropy(parse_results: &[crate::drain::ParseResult]) -> f64 {
        if parse_results.is_empty() {
            return 0.0;
        }

        let mut counts = std::collections::HashMap::new();
        for r in parse_results {
            *counts.entry(r.template_id.clone()).or_insert(0u32) += 1;
        }

        let total = parse_results.len() as f64;
        -counts
            .values()
            .map(|&c| {
                let p = c as f64 / total;
                p * p.log2()
            })
            .sum::<f64>()
    }

    /// Counts distinct URLs (by full match) whose domain is not covered by
    /// the trusted-domain allowlist. The domain is the authority component
    /// up to the first `/`, `?`, or `#`, with any port stripped.
    fn count_external_urls(text: &str) -> u32 {
        let mut untrusted: HashSet<String> = HashSet::new();
        for caps in URL_PATTERN.captures_iter(text) {
            let full_match = caps.get(0).unwrap().as_str();
            let authority = &caps[1];
            let domain_end = authority
                .find(|c: char| c == '/' || c == '?' || c == '#')
                .unwrap_or(authority.len());
            let mut host = &authority[..domain_end];
            if let Some(colon) = host.find(':') {
                host = &host[..colon];
            }
            if !crate::features::is_trusted_domain(host) {
                untrusted.insert(full_match.to_string());
            }
        }
        untrusted.len() as u32
    }

    fn is_private_ip(ip: &str) -> bool {
        let parts: Vec<&str> = ip.split('.').collect();
        if parts.len() != 4 {
            return true;
        }

        let (first, second) = match (parts[0].parse::<u16>(), parts[1].parse::<u16>()) {
            (Ok(f), Ok(s)) => (f, s),
            _ => return true,
        };

        first == 10 || (first == 172 && (16..=31).contains(&second)) || (first == 192 && second == 168) || first == 127
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub use trusted_domains::is_trusted_domain;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::DrainParser;
    use crate::features::payload::BuildStep;

    fn empty_build() -> RawBuild {
        RawBuild {
            build_id: "1".into(),
            repo_name: "acme/widgets".into(),
            branch: "main".into(),
            commit_sha: "deadbeef".into(),
            duration_seconds: 12.0,
            raw_logs: String::new(),
            steps: Vec::new(),
            provider: "github".into(),
        }
    }

    #[test]
    fn empty_logs_produce_zeroed_security_features() {
        let extractor = FeatureExtractor::new(SuspiciousPatternConfig::default());
        let mut parser = DrainParser::default();
        let (features, _) = extractor.extract(&empty_build(), &mut parser);
        assert_eq!(features.log_line_count, 0);
        assert_eq!(features.suspicious_pattern_count, 0);
        assert_eq!(features.external_ip_count, 0);
    }

    #[test]
    fn private_ips_are_excluded_from_external_count() {
        let mut raw = empty_build();
        raw.raw_logs = "connecting to 10.0.0.5 and 192.168.1.1 and 8.8.8.8".into();
        let extractor = FeatureExtractor::new(SuspiciousPatternConfig::default());
        let mut parser = DrainParser::default();
        let (features, _) = extractor.extract(&raw, &mut parser);
        assert_eq!(features.external_ip_count, 1);
    }

    #[test]
    fn cryptomining_pattern_is_detected() {
        let mut raw = empty_build();
        raw.raw_logs = "launching xmrig --config stratum+tcp://pool.example:3333".into();
        let extractor = FeatureExtractor::new(SuspiciousPatternConfig::default());
        let mut parser = DrainParser::default();
        let (features, _) = extractor.extract(&raw, &mut parser);
        assert!(features.suspicious_pattern_count >= 2);
    }

    #[test]
    fn base64_requires_context_by_default() {
        let mut raw = empty_build();
        raw.raw_logs = "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVowMTIzNDU2Nzg5".into();
        let extractor = FeatureExtractor::new(SuspiciousPatternConfig::default());
        let mut parser = DrainParser::default();
        let (features, _) = extractor.extract(&raw, &mut parser);
        assert_eq!(features.base64_pattern_count, 0);

        let extractor_broad = FeatureExtractor::new(SuspiciousPatternConfig {
            allow_broad_base64: true,
        });
        let mut parser2 = DrainParser::default();
        let (features_broad, _) = extractor_broad.extract(&raw, &mut parser2);
        assert_eq!(features_broad.base64_pattern_count, 1);
    }

    #[test]
    fn steps_supply_log_lines_when_raw_logs_absent() {
        let mut raw = empty_build();
        raw.steps = vec![BuildStep {
            name: "build".into(),
            log_lines: vec!["compiling".into(), "error: linker failed".into()],
        }];
        let extractor = FeatureExtractor::new(SuspiciousPatternConfig::default());
        let mut parser = DrainParser::default();
        let (features, _) = extractor.extract(&raw, &mut parser);
        assert_eq!(features.log_line_count, 2);
        assert_eq!(features.error_count, 1);
    }
}
