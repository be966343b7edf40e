//! Variable-normalization patterns applied before tokenization.
//!
//! Order matters: each pattern runs over the output of the previous one, in
//! the sequence below. Note that since `<NUM>` runs before `<VERSION>`,
//! dot-separated version numbers like `1.2.3` are consumed digit-by-digit by
//! the numeric pattern first (each digit run is bounded by `.`, a non-alnum
//! boundary) — `<VERSION>` only ever fires on the rare case a dotted triple
//! survives that pass untouched. This mirrors the reference parser exactly;
//! changing the order would change every downstream template id.

use once_cell::sync::Lazy;
use regex::Regex;

struct VariablePattern {
    regex: Regex,
    replacement: &'static str,
}

static ISO_TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").unwrap());
static TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{2}:\d{2}:\d{2}").unwrap());
static IP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap());
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .unwrap()
});
static SHA1: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{40}\b").unwrap());
static SHA256: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{64}\b").unwrap());
static HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").unwrap());
static VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\.\d+\.\d+\b").unwrap());
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[\w./\-]+").unwrap());
static SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s=:,;|\[\](){}]+").unwrap());

fn is_alnum(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

/// Replace digit runs that are not adjacent to other alphanumerics with
/// `<NUM>`. The reference pattern uses lookaround to keep the separating
/// punctuation in place (`regex` has no lookaround support), so this walks
/// the string by hand instead of compiling an equivalent regex.
fn replace_numbers(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let is_sign = (c == '+' || c == '-') && i + 1 < chars.len() && chars[i + 1].is_ascii_digit();
        if c.is_ascii_digit() || is_sign {
            let start = i;
            if is_sign {
                i += 1;
            }
            let digits_start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i == digits_start {
                // lone sign with no digits after all; emit as-is
                out.push(c);
                i = start + 1;
                continue;
            }

            let prev_alnum = start > 0 && is_alnum(chars[start - 1]);
            let next_alnum = i < chars.len() && is_alnum(chars[i]);

            if prev_alnum || next_alnum {
                out.extend(&chars[start..i]);
            } else {
                out.push_str("<NUM>");
            }
        } else {
            out.push(c);
            i += 1;
        }
    }

    out
}

fn patterns() -> Vec<VariablePattern> {
    vec![
        VariablePattern { regex: ISO_TIMESTAMP.clone(), replacement: "<TIMESTAMP>" },
        VariablePattern { regex: TIME.clone(), replacement: "<TIME>" },
        VariablePattern { regex: IP.clone(), replacement: "<IP>" },
        VariablePattern { regex: UUID.clone(), replacement: "<UUID>" },
        VariablePattern { regex: SHA1.clone(), replacement: "<SHA1>" },
        VariablePattern { regex: SHA256.clone(), replacement: "<SHA256>" },
        VariablePattern { regex: HEX.clone(), replacement: "<HEX>" },
    ]
}

/// Normalize variable substrings and tokenize a raw log line.
///
/// Mirrors the reference implementation: apply each variable pattern in
/// order (timestamp, time, ip, uuid, sha1, sha256, hex, num, version, url,
/// path), then split on whitespace and `=:,;|[](){}`, dropping empty tokens.
pub fn preprocess(log_line: &str) -> Vec<String> {
    let mut processed = log_line.to_string();

    for pattern in patterns() {
        processed = pattern.regex.replace_all(&processed, pattern.replacement).to_string();
    }

    processed = replace_numbers(&processed);
    processed = VERSION.replace_all(&processed, "<VERSION>").to_string();
    processed = URL.replace_all(&processed, "<URL>").to_string();
    processed = PATH.replace_all(&processed, "<PATH>").to_string();

    SPLIT
        .split(&processed)
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ip_and_number() {
        let tokens = preprocess("connect 10.1.2.3 retries 5");
        assert!(tokens.contains(&"<IP>".to_string()));
        assert!(tokens.contains(&"<NUM>".to_string()));
    }

    #[test]
    fn normalizes_uuid_and_hashes() {
        let tokens = preprocess(
            "job 123e4567-e89b-12d3-a456-426614174000 sha aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        );
        assert!(tokens.iter().any(|t| t == "<UUID>"));
        assert!(tokens.iter().any(|t| t == "<SHA1>"));
    }

    #[test]
    fn empty_line_yields_no_tokens() {
        assert!(preprocess("   ").is_empty());
    }

    #[test]
    fn url_and_path_normalized() {
        let tokens = preprocess("fetching https://example.com/a/b and /var/log/build.log");
        assert!(tokens.iter().any(|t| t == "<URL>"));
        assert!(tokens.iter().any(|t| t == "<PATH>"));
    }
}
