//! Provider-dialect projection: turns a raw webhook-shaped JSON payload into
//! the provider-agnostic [`RawBuild`] the feature extractor consumes.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub name: String,
    pub log_lines: Vec<String>,
}

/// Provider-agnostic view of a single CI build, ready for feature extraction.
#[derive(Debug, Clone)]
pub struct RawBuild {
    pub build_id: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub duration_seconds: f64,
    pub raw_logs: String,
    pub steps: Vec<BuildStep>,
    pub provider: String,
}

impl RawBuild {
    /// Project a raw `raw_logs` queue message payload into a [`RawBuild`],
    /// dispatching on `_meta.provider` / payload shape the way the original
    /// extractor does: GitHub Actions (`workflow_run`), GitLab CI
    /// (`object_attributes`), or a generic/test fallback. Missing nested
    /// fields default to empty rather than erroring.
    pub fn from_payload(payload: &Value) -> Self {
        let meta = payload.get("_meta").cloned().unwrap_or(Value::Null);
        let hint = meta.get("provider").and_then(Value::as_str);

        // Priority: (1) explicit provider hint, (2) `workflow_run` shape,
        // (3) `object_attributes` shape, (4) generic fallback.
        match hint {
            Some("github") => return Self::from_github(payload, &meta),
            Some("gitlab") => return Self::from_gitlab(payload, &meta),
            Some(other) => return Self::from_generic(payload, &meta, other),
            None => {}
        }

        if payload.get("workflow_run").is_some() {
            Self::from_github(payload, &meta)
        } else if payload.get("object_attributes").is_some() {
            Self::from_gitlab(payload, &meta)
        } else {
            Self::from_generic(payload, &meta, "unknown")
        }
    }

    fn from_github(payload: &Value, meta: &Value) -> Self {
        let workflow = &payload["workflow_run"];
        let repo = &payload["repository"];
        let extended = &payload["_enriched"];

        let started = str_field(workflow, "run_started_at");
        let finished = str_field(workflow, "updated_at");
        let duration = calculate_duration(&started, &finished, extended);

        Self {
            build_id: id_field(workflow, "id", meta),
            repo_name: str_field(repo, "full_name"),
            branch: str_field(workflow, "head_branch"),
            commit_sha: str_field(workflow, "head_sha"),
            duration_seconds: duration,
            raw_logs: str_field(extended, "raw_logs"),
            steps: steps_field(extended),
            provider: "github".to_string(),
        }
    }

    fn from_gitlab(payload: &Value, meta: &Value) -> Self {
        let attrs = &payload["object_attributes"];
        let project = &payload["project"];
        let extended = &payload["_enriched"];

        let duration = attrs
            .get("duration")
            .and_then(Value::as_f64)
            .or_else(|| extended.get("duration_seconds").and_then(Value::as_f64))
            .unwrap_or(0.0);

        Self {
            build_id: id_field(attrs, "id", meta),
            repo_name: str_field(project, "path_with_namespace"),
            branch: str_field(attrs, "ref"),
            commit_sha: str_field(attrs, "sha"),
            duration_seconds: duration,
            raw_logs: str_field(extended, "raw_logs"),
            steps: steps_field(extended),
            provider: "gitlab".to_string(),
        }
    }

    fn from_generic(payload: &Value, meta: &Value, provider: &str) -> Self {
        let workflow = &payload["workflow_run"];
        let extended = &payload["_enriched"];

        let started = str_field(workflow, "run_started_at");
        let finished = str_field(workflow, "updated_at");
        let duration = calculate_duration(&started, &finished, extended);

        Self {
            build_id: id_field(workflow, "id", meta),
            repo_name: str_field(&payload["repository"], "full_name"),
            branch: str_field(workflow, "head_branch"),
            commit_sha: str_field(workflow, "head_sha"),
            duration_seconds: duration,
            raw_logs: str_field(extended, "raw_logs"),
            steps: steps_field(extended),
            provider: provider.to_string(),
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn id_field(value: &Value, key: &str, meta: &Value) -> String {
    if let Some(id) = value.get(key) {
        if let Some(n) = id.as_i64() {
            return n.to_string();
        }
        if let Some(s) = id.as_str() {
            return s.to_string();
        }
    }
    meta.get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn steps_field(extended: &Value) -> Vec<BuildStep> {
    extended
        .get("steps")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|s| BuildStep {
                    name: str_field(s, "name"),
                    log_lines: s
                        .get("log_lines")
                        .and_then(Value::as_array)
                        .map(|lines| {
                            lines
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Duration in seconds between two ISO-ish timestamps, trying a handful of
/// formats the way the reference implementation does. Falls back to
/// `extended.duration_seconds` when the timestamps are missing or
/// unparseable, and to `0.0` if that is absent too — a bad timestamp should
/// degrade a feature, not fail the whole extraction.
fn calculate_duration(start_str: &str, end_str: &str, extended: &Value) -> f64 {
    const FORMATS: [&str; 3] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%d %H:%M:%S",
    ];

    if !start_str.is_empty() && !end_str.is_empty() {
        let start_trimmed = start_str.trim_end_matches('Z');
        let end_trimmed = end_str.trim_end_matches('Z');

        for fmt in FORMATS {
            if let (Ok(start), Ok(end)) = (
                NaiveDateTime::parse_from_str(start_trimmed, fmt),
                NaiveDateTime::parse_from_str(end_trimmed, fmt),
            ) {
                return (end - start).num_milliseconds() as f64 / 1000.0;
            }
        }
    }

    extended
        .get("duration_seconds")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn github_payload_projects_fields() {
        let payload = json!({
            "_meta": {"provider": "github", "request_id": "r1"},
            "workflow_run": {
                "id": 42,
                "head_branch": "main",
                "head_sha": "abc123",
                "run_started_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:05:00Z",
            },
            "repository": {"full_name": "acme/widgets"},
            "_enriched": {"raw_logs": "line one\nline two", "steps": []},
        });

        let raw = RawBuild::from_payload(&payload);
        assert_eq!(raw.provider, "github");
        assert_eq!(raw.build_id, "42");
        assert_eq!(raw.duration_seconds, 300.0);
        assert_eq!(raw.repo_name, "acme/widgets");
    }

    #[test]
    fn gitlab_payload_uses_declared_duration() {
        let payload = json!({
            "_meta": {"provider": "gitlab"},
            "object_attributes": {"id": 7, "ref": "dev", "sha": "xyz", "duration": 15.5},
            "project": {"path_with_namespace": "acme/api"},
            "_enriched": {"raw_logs": "", "steps": []},
        });

        let raw = RawBuild::from_payload(&payload);
        assert_eq!(raw.provider, "gitlab");
        assert_eq!(raw.duration_seconds, 15.5);
    }

    #[test]
    fn missing_fields_default_instead_of_erroring() {
        let payload = json!({});
        let raw = RawBuild::from_payload(&payload);
        assert_eq!(raw.provider, "unknown");
        assert_eq!(raw.build_id, "unknown");
        assert!(raw.raw_logs.is_empty());
    }
}
