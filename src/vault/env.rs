//! `.env` parsing and export.

use std::collections::BTreeMap;

/// Parse `KEY=VALUE` lines from `.env` file data.
///
/// Blank lines and `#` comments are ignored, whitespace around key and
/// value is trimmed, matched outer quotes are stripped, and the value is
/// split on the first `=` only so embedded `=` survive. Lines with an
/// empty key are rejected.
pub fn parse_env_file(data: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = unquote(value.trim());
        env.insert(key.to_string(), value.to_string());
    }
    env
}

/// Strip matching single or double outer quotes from a value.
fn unquote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Render key-value pairs as sorted `KEY=VALUE` lines.
pub fn export_env_format(entries: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_pairs() {
        let env = parse_env_file("A=1\nB=two\n");
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two"));
    }

    #[test]
    fn skips_blanks_and_comments() {
        let env = parse_env_file("\n# comment\n  \nA=1\n#B=2\n");
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn trims_whitespace() {
        let env = parse_env_file("  KEY  =  value  \n");
        assert_eq!(env.get("KEY").map(String::as_str), Some("value"));
    }

    #[test]
    fn strips_matched_quotes_only() {
        let env = parse_env_file("A=\"quoted\"\nB='single'\nC=\"mismatched'\nD=\"\n");
        assert_eq!(env.get("A").map(String::as_str), Some("quoted"));
        assert_eq!(env.get("B").map(String::as_str), Some("single"));
        assert_eq!(env.get("C").map(String::as_str), Some("\"mismatched'"));
        assert_eq!(env.get("D").map(String::as_str), Some("\""));
    }

    #[test]
    fn splits_on_first_equals_only() {
        let env = parse_env_file("DSN=postgres://u:p@host/db?sslmode=require\n");
        assert_eq!(
            env.get("DSN").map(String::as_str),
            Some("postgres://u:p@host/db?sslmode=require")
        );
    }

    #[test]
    fn rejects_empty_keys_and_flag_lines() {
        let env = parse_env_file("=value\nno_equals_here\nA=1\n");
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn export_is_sorted() {
        let mut entries = BTreeMap::new();
        entries.insert("B".to_string(), "2".to_string());
        entries.insert("A".to_string(), "1".to_string());
        assert_eq!(export_env_format(&entries), "A=1\nB=2\n");
    }
}
