//! Minimal INI reader and writer.
//!
//! Used for the service configuration and the policy manifest. The dialect
//! is deliberately small:
//! - `[Section]` headers, names compared case-insensitively
//! - `key=value` pairs, split on the first `=`, both sides trimmed
//! - lines starting with `;` or `#` are comments
//! - a leading UTF-8 BOM is ignored
//!
//! Malformed lines are counted and skipped rather than failing the parse.

use std::fmt::Write as _;

const UTF8_BOM: char = '\u{feff}';

/// One `[Section]` and its entries in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Case-insensitive key lookup; the first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }
}

/// A parsed INI file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IniDocument {
    /// Entries that appear before the first header.
    pub preamble: Vec<(String, String)>,
    pub sections: Vec<IniSection>,
    /// Number of non-comment lines that were neither headers nor pairs.
    pub malformed_lines: usize,
}

impl IniDocument {
    pub fn parse(content: &str) -> Self {
        let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
        let mut doc = IniDocument::default();

        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                match rest.strip_suffix(']') {
                    Some(name) => doc.sections.push(IniSection::new(name.trim())),
                    None => doc.malformed_lines += 1,
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                doc.malformed_lines += 1;
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                doc.malformed_lines += 1;
                continue;
            }

            let pair = (key.to_string(), value.trim().to_string());
            match doc.sections.last_mut() {
                Some(section) => section.entries.push(pair),
                None => doc.preamble.push(pair),
            }
        }

        doc
    }

    /// Case-insensitive section lookup; sections with the same name are
    /// not merged, the first wins.
    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn push_section(&mut self, section: IniSection) {
        self.sections.push(section);
    }

    /// Render with optional leading comment lines.
    pub fn render(&self, header: &[&str]) -> String {
        let mut out = String::new();
        for line in header {
            let _ = writeln!(out, "; {line}");
        }
        if !header.is_empty() {
            out.push('\n');
        }
        for (key, value) in &self.preamble {
            let _ = writeln!(out, "{key}={value}");
        }
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let _ = writeln!(out, "{key}={value}");
            }
        }
        out
    }
}

/// Parse an INI boolean the way hand-edited files spell it.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_sections_and_comments() {
        let doc = IniDocument::parse(
            "\u{feff}; header\n# other\n[Logging]\nLogLevel = DEBUG\n\n[targets]\nGame.exe=1\nbad line\n",
        );
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.section("logging").and_then(|s| s.get("loglevel")), Some("DEBUG"));
        assert_eq!(doc.section("TARGETS").and_then(|s| s.get("game.exe")), Some("1"));
        assert_eq!(doc.malformed_lines, 1);
    }

    #[test]
    fn test_value_split_on_first_equals() {
        let doc = IniDocument::parse("[AppliedPolicies]\napp.exe=C:\\a=b\\app.exe\n");
        let section = doc.section("AppliedPolicies").unwrap();
        assert_eq!(section.get("app.exe"), Some("C:\\a=b\\app.exe"));
    }

    #[test]
    fn test_preamble_entries_kept_separately() {
        let doc = IniDocument::parse("stray=1\n[S]\nk=v\n");
        assert_eq!(doc.preamble, vec![("stray".to_string(), "1".to_string())]);
        assert_eq!(doc.sections[0].entries.len(), 1);
    }

    #[test]
    fn test_render_then_parse_preserves_entries() {
        let mut doc = IniDocument::default();
        let mut s = IniSection::new("Targets");
        s.push("a.exe", "1");
        s.push("b.exe", "0");
        doc.push_section(s);
        let text = doc.render(&["generated"]);
        assert!(text.starts_with("; generated\n\n[Targets]\n"));
        assert_eq!(IniDocument::parse(&text).sections, doc.sections);
    }

    #[test]
    fn test_parse_flag_spellings() {
        for yes in ["1", "true", "YES", " on "] {
            assert!(parse_flag(yes), "{yes}");
        }
        for no in ["0", "false", "off", "", "2"] {
            assert!(!parse_flag(no), "{no}");
        }
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(input in ".{0,400}") {
            let _ = IniDocument::parse(&input);
        }
    }
}
