//! Section based key/value text source
//!
//! ```text
//! [alias]
//! host1_p1 = 10:00:00:00:c9:95:2f:de
//!
//! [sw1]
//! type = switch
//! wwpn-p1 = host1_p1
//! ```
//!
//! Lines starting with `#` or `;` are comments, `=` and `:` both separate a
//! key from its value. Section and key order is kept; keys are case
//! sensitive since port labels are embedded in them.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::path::Path;
use tracing::debug;

/// Reserved section holding loader-wide settings
pub const GENERAL_SECTION: &str = "general";

/// Reserved section mapping human-readable names to addresses
pub const ALIAS_SECTION: &str = "alias";

pub type Section = IndexMap<String, String>;

/// Raw sections of a configuration source, before any interpretation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfig {
    sections: IndexMap<String, Section>,
}

impl RawConfig {
    /// Parse configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: IndexMap<String, Section> = IndexMap::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| Error::ConfigParse {
                    line: line_no,
                    reason: format!("unterminated section header: {}", line),
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::ConfigParse {
                        line: line_no,
                        reason: "empty section name".into(),
                    });
                }
                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let Some(section) = current.as_ref() else {
                return Err(Error::ConfigParse {
                    line: line_no,
                    reason: format!("option outside of any section: {}", line),
                });
            };

            let sep = line.find(['=', ':']).ok_or_else(|| Error::ConfigParse {
                line: line_no,
                reason: format!("expected 'key = value': {}", line),
            })?;
            let key = line[..sep].trim().to_string();
            let value = line[sep + 1..].trim().to_string();
            if key.is_empty() {
                return Err(Error::ConfigParse {
                    line: line_no,
                    reason: "empty option name".into(),
                });
            }

            if let Some(entries) = sections.get_mut(section) {
                entries.insert(key, value);
            }
        }

        debug!("Parsed {} config sections", sections.len());
        Ok(Self { sections })
    }

    /// Read and parse a configuration file
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Replace every value that names an alias with the aliased value.
    ///
    /// A single, non-recursive pass: an alias pointing to another alias is
    /// substituted once. An alias with an empty value cannot be resolved;
    /// the sections using one are returned with the error and left as is.
    pub fn resolve_aliases(&mut self) -> Vec<(String, Error)> {
        let Some(aliases) = self.sections.get(ALIAS_SECTION).cloned() else {
            return Vec::new();
        };

        let mut unresolved = Vec::new();
        for (name, section) in self.sections.iter_mut() {
            if name == ALIAS_SECTION {
                continue;
            }
            for value in section.values_mut() {
                match aliases.get(value.as_str()) {
                    Some(aliased) if aliased.is_empty() => {
                        unresolved.push((name.clone(), Error::UnresolvedAlias { alias: value.clone() }));
                    }
                    Some(aliased) => *value = aliased.clone(),
                    None => {}
                }
            }
        }
        unresolved
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        self.sections.entry(name.to_string()).or_default()
    }

    pub fn sections(&self) -> impl Iterator<Item = (&String, &Section)> {
        self.sections.iter()
    }

    pub fn into_sections(self) -> IndexMap<String, Section> {
        self.sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SAMPLE: &str = r#"
# lab topology
[alias]
host1_p1 = 10:00:00:00:c9:95:2f:de

[sw1]
type = switch
model: SIM-FABRIC
; port of the host
wwpn-p1 = host1_p1
"#;

    #[test]
    fn test_parse_sections_in_order() {
        let raw = RawConfig::parse(SAMPLE).unwrap();
        let names: Vec<&String> = raw.sections().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alias", "sw1"]);

        let sw1 = raw.section("sw1").unwrap();
        assert_eq!(sw1.get("type").map(String::as_str), Some("switch"));
        assert_eq!(sw1.get("model").map(String::as_str), Some("SIM-FABRIC"));
        assert_eq!(sw1.get_index(2).map(|(k, _)| k.as_str()), Some("wwpn-p1"));
    }

    #[test]
    fn test_value_keeps_colons() {
        let raw = RawConfig::parse("[a]\nwwpn-p1 = 10:00:00:00:c9:95:2f:de\n").unwrap();
        assert_eq!(
            raw.section("a").unwrap().get("wwpn-p1").map(String::as_str),
            Some("10:00:00:00:c9:95:2f:de")
        );
    }

    #[test]
    fn test_alias_resolution_single_pass() {
        let mut raw = RawConfig::parse(
            "[alias]\nfirst = second\nsecond = 10:00:00:00:c9:95:2f:de\n[sw1]\na = first\nb = second\nc = plain\n",
        )
        .unwrap();
        assert!(raw.resolve_aliases().is_empty());

        let sw1 = raw.section("sw1").unwrap();
        assert_eq!(sw1.get("a").map(String::as_str), Some("second"));
        assert_eq!(sw1.get("b").map(String::as_str), Some("10:00:00:00:c9:95:2f:de"));
        assert_eq!(sw1.get("c").map(String::as_str), Some("plain"));
    }

    #[test]
    fn test_empty_alias_is_unresolved() {
        let mut raw = RawConfig::parse("[alias]\nhost1 =\n[sw1]\nwwpn-p1 = host1\n").unwrap();
        let unresolved = raw.resolve_aliases();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].0, "sw1");
        assert_matches!(&unresolved[0].1, Error::UnresolvedAlias { alias } if alias == "host1");
    }

    #[test]
    fn test_malformed_lines() {
        assert_matches!(RawConfig::parse("key = value\n"), Err(Error::ConfigParse { line: 1, .. }));
        assert_matches!(RawConfig::parse("[sw1\n"), Err(Error::ConfigParse { line: 1, .. }));
        assert_matches!(RawConfig::parse("[sw1]\njust words\n"), Err(Error::ConfigParse { line: 2, .. }));
    }

    #[test]
    fn test_read_missing_file() {
        let err = RawConfig::read(Path::new("/nonexistent/san_top.conf")).unwrap_err();
        assert_matches!(err, Error::ConfigRead { .. });
    }
}
