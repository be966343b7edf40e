//! Online log template mining (the Drain algorithm).
//!
//! Builds a fixed-depth prefix tree keyed first by token count, then by the
//! leading tokens of each log line, so that lines sharing a shape converge on
//! a shared template instead of each producing its own cluster.
//!
//! Reference: He, Zhu, Zheng, Lyu, "Drain: An Online Log Parsing Approach
//! with Fixed Depth Tree" (ICWS 2017).

mod preprocess;

pub use preprocess::preprocess;

use std::collections::HashMap;

const WILDCARD: &str = "<*>";

/// A cluster of log lines that share a template.
#[derive(Debug, Clone)]
pub struct LogCluster {
    pub template_id: String,
    pub template_tokens: Vec<String>,
    pub log_ids: Vec<String>,
    pub size: usize,
}

impl LogCluster {
    fn new(template_id: String, template_tokens: Vec<String>) -> Self {
        Self {
            template_id,
            template_tokens,
            log_ids: Vec::new(),
            size: 0,
        }
    }

    pub fn template(&self) -> String {
        self.template_tokens.join(" ")
    }

    fn add_log(&mut self, log_id: String) {
        self.log_ids.push(log_id);
        self.size += 1;
    }
}

#[derive(Debug, Default)]
struct DrainNode {
    children: HashMap<String, DrainNode>,
    clusters: Vec<usize>,
}

/// Result of parsing a single log line.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub template_id: String,
    pub template: String,
    pub tokens: Vec<String>,
}

/// Parameters governing tree shape and match strictness.
#[derive(Debug, Clone, Copy)]
pub struct DrainConfig {
    pub depth: usize,
    pub sim_th: f64,
    pub max_children: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            sim_th: 0.4,
            max_children: 100,
        }
    }
}

/// The Drain parse tree plus the set of clusters it has discovered so far.
///
/// Not thread-safe on its own; callers share it behind a mutex (see
/// `crate::workers::parser_worker`).
pub struct DrainParser {
    config: DrainConfig,
    root: DrainNode,
    clusters: Vec<LogCluster>,
    by_template_id: HashMap<String, usize>,
}

impl DrainParser {
    pub fn new(config: DrainConfig) -> Self {
        Self {
            config,
            root: DrainNode::default(),
            clusters: Vec::new(),
            by_template_id: HashMap::new(),
        }
    }

    fn has_numbers(token: &str) -> bool {
        token.chars().any(|c| c.is_ascii_digit())
    }

    fn tree_search(&self, tokens: &[String]) -> Option<usize> {
        if tokens.is_empty() {
            return None;
        }
        let length_key = tokens.len().to_string();
        let mut node = self.root.children.get(&length_key)?;

        let steps = self.config.depth.saturating_sub(1).min(tokens.len());
        for token in tokens.iter().take(steps) {
            let key: &str = if Self::has_numbers(token) {
                WILDCARD
            } else {
                token.as_str()
            };
            node = if let Some(child) = node.children.get(key) {
                child
            } else if let Some(child) = node.children.get(WILDCARD) {
                child
            } else {
                return None;
            };
        }

        self.fast_match(tokens, &node.clusters)
    }

    fn fast_match(&self, tokens: &[String], candidates: &[usize]) -> Option<usize> {
        let mut best_match = None;
        let mut best_sim = -1.0f64;

        for &idx in candidates {
            let cluster = &self.clusters[idx];
            let sim = Self::seq_similarity(tokens, &cluster.template_tokens);
            if sim > self.config.sim_th && sim > best_sim {
                best_sim = sim;
                best_match = Some(idx);
            }
        }

        best_match
    }

    fn seq_similarity(seq1: &[String], seq2: &[String]) -> f64 {
        if seq1.len() != seq2.len() {
            return 0.0;
        }

        let mut matches = 0u32;
        let mut total = 0u32;
        for (t1, t2) in seq1.iter().zip(seq2.iter()) {
            if t1 == WILDCARD || t2 == WILDCARD {
                continue;
            }
            total += 1;
            if t1 == t2 {
                matches += 1;
            }
        }

        if total == 0 {
            return 1.0;
        }

        matches as f64 / total as f64
    }

    fn add_to_tree(&mut self, tokens: &[String], cluster_idx: usize) {
        let length_key = tokens.len().to_string();
        let mut node = self.root.children.entry(length_key).or_default();

        let steps = self.config.depth.saturating_sub(1).min(tokens.len());
        for token in tokens.iter().take(steps) {
            let mut key = if Self::has_numbers(token) {
                WILDCARD.to_string()
            } else {
                token.clone()
            };

            if !node.children.contains_key(&key) {
                if node.children.len() < self.config.max_children {
                    node.children.entry(key.clone()).or_default();
                } else if !node.children.contains_key(WILDCARD) {
                    node.children.entry(WILDCARD.to_string()).or_default();
                    key = WILDCARD.to_string();
                } else {
                    key = WILDCARD.to_string();
                }
            }

            node = node.children.get_mut(&key).expect("child inserted above");
        }

        node.clusters.push(cluster_idx);
    }

    fn update_template(tokens: &[String], cluster: &mut LogCluster) {
        let new_template: Vec<String> = tokens
            .iter()
            .zip(cluster.template_tokens.iter())
            .map(|(t1, t2)| if t1 == t2 { t1.clone() } else { WILDCARD.to_string() })
            .collect();
        cluster.template_tokens = new_template;
    }

    fn template_id(tokens: &[String]) -> String {
        let joined = tokens.join(" ");
        let digest = md5::compute(joined.as_bytes());
        format!("{:x}", digest)[..12].to_string()
    }

    /// Parse a single raw log line, mutating the tree if it introduces a new
    /// template or generalizes an existing one.
    ///
    /// Empty lines (after preprocessing, all tokens stripped) return the
    /// sentinel template id `"empty"` with an empty template and token list.
    pub fn parse(&mut self, log_line: &str, log_id: Option<&str>) -> ParseResult {
        let tokens = preprocess(log_line);

        if tokens.is_empty() {
            return ParseResult {
                template_id: "empty".to_string(),
                template: String::new(),
                tokens: Vec::new(),
            };
        }

        if let Some(idx) = self.tree_search(&tokens) {
            Self::update_template(&tokens, &mut self.clusters[idx]);
            if let Some(id) = log_id {
                self.clusters[idx].add_log(id.to_string());
            }
            let cluster = &self.clusters[idx];
            ParseResult {
                template_id: cluster.template_id.clone(),
                template: cluster.template(),
                tokens,
            }
        } else {
            let template_id = Self::template_id(&tokens);
            let mut cluster = LogCluster::new(template_id.clone(), tokens.clone());
            if let Some(id) = log_id {
                cluster.add_log(id.to_string());
            }

            let idx = self.clusters.len();
            self.clusters.push(cluster);
            self.by_template_id.insert(template_id.clone(), idx);
            self.add_to_tree(&tokens, idx);

            let cluster = &self.clusters[idx];
            ParseResult {
                template_id: cluster.template_id.clone(),
                template: cluster.template(),
                tokens,
            }
        }
    }

    /// Parse every non-blank line in `log_lines`, skipping blank ones the way
    /// the reference implementation does (they never reach `parse`).
    pub fn parse_logs(&mut self, log_lines: &[String]) -> Vec<ParseResult> {
        let mut results = Vec::with_capacity(log_lines.len());
        for (i, line) in log_lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            results.push(self.parse(line, Some(&i.to_string())));
        }
        results
    }

    pub fn template_distribution(&self) -> HashMap<String, usize> {
        self.clusters
            .iter()
            .map(|c| (c.template_id.clone(), c.size))
            .collect()
    }

    pub fn clusters(&self) -> &[LogCluster] {
        &self.clusters
    }

    /// Look up a cluster's current template by the `template_id` assigned
    /// when it was first discovered (stable for the cluster's lifetime even
    /// as its tokens generalize further).
    pub fn cluster_by_template_id(&self, template_id: &str) -> Option<&LogCluster> {
        self.by_template_id.get(template_id).map(|&idx| &self.clusters[idx])
    }
}

impl Default for DrainParser {
    fn default() -> Self {
        Self::new(DrainConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_lines_share_a_template() {
        let mut parser = DrainParser::default();
        let a = parser.parse("Build step 3 completed in 12 seconds", Some("1"));
        let b = parser.parse("Build step 3 completed in 45 seconds", Some("2"));
        assert_eq!(a.template_id, b.template_id);
        assert!(b.template.contains("<*>") || b.template.contains("<NUM>"));
    }

    #[test]
    fn empty_line_returns_sentinel() {
        let mut parser = DrainParser::default();
        let result = parser.parse("   ", None);
        assert_eq!(result.template_id, "empty");
        assert!(result.tokens.is_empty());
    }

    #[test]
    fn reparsing_is_idempotent_on_template_id() {
        let mut parser = DrainParser::default();
        let first = parser.parse("Connecting to 10.0.0.5 on port 443", Some("1"));
        let second = parser.parse("Connecting to 10.0.0.5 on port 443", Some("2"));
        assert_eq!(first.template_id, second.template_id);
        assert_eq!(first.template, second.template);
    }

    #[test]
    fn differing_lengths_never_collide() {
        let mut parser = DrainParser::default();
        let short = parser.parse("done", Some("1"));
        let long = parser.parse("done after a long delay", Some("2"));
        assert_ne!(short.template_id, long.template_id);
    }

    #[test]
    fn cluster_lookup_by_template_id_finds_the_generalized_template() {
        let mut parser = DrainParser::default();
        let first = parser.parse("Build step 3 completed in 12 seconds", Some("1"));
        parser.parse("Build step 3 completed in 45 seconds", Some("2"));

        let cluster = parser
            .cluster_by_template_id(&first.template_id)
            .expect("cluster should exist after parsing");
        assert_eq!(cluster.size, 2);
        assert!(cluster.template().contains("<*>") || cluster.template().contains("<NUM>"));
        assert!(parser.cluster_by_template_id("nonexistent").is_none());
    }
}
