//! Structured docstring conventions used by the lesson scripts.
//!
//! ```text
//! Example #042: Lead Qualifier
//! Category: business/sales
//!
//! DESCRIPTION:
//! Scores inbound leads.
//!
//! PATTERNS:
//! - Structured Output (pydantic)
//!
//! ARGUMENTS:
//! - company (str): Company to research. Default: "Acme"
//! ```

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocArgument {
    pub name: String,
    pub type_name: String,
    pub description: String,
    pub default: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocstringMeta {
    pub example_number: Option<u32>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub patterns: Vec<String>,
    pub arguments: Vec<DocArgument>,
}

const SECTIONS: [&str; 3] = ["DESCRIPTION", "PATTERNS", "ARGUMENTS"];

fn example_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^Example\s*#?(\d+):\s*(.+)$").expect("valid regex"))
}

fn category_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^Category:\s*(.+)$").expect("valid regex"))
}

fn argument_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-\s*(\w+)\s*\(([^)]+)\):\s*(.+?)(?:Default:\s*(.+))?$").expect("valid regex")
    })
}

impl DocstringMeta {
    pub fn parse(docstring: &str) -> Self {
        let mut meta = Self::default();
        let lines: Vec<&str> = docstring.trim().lines().collect();
        let Some(first) = lines.first() else {
            return meta;
        };

        if let Some(caps) = example_re().captures(first.trim()) {
            meta.example_number = caps[1].parse().ok();
            meta.name = Some(caps[2].trim().to_string());
        }

        meta.category = lines
            .iter()
            .skip(1)
            .take(4)
            .find_map(|line| category_re().captures(line.trim()))
            .map(|caps| caps[1].trim().to_string());

        if let Some(body) = section(&lines, "DESCRIPTION") {
            let text = body.join("\n").trim().to_string();
            if !text.is_empty() {
                meta.description = Some(text);
            }
        }

        if let Some(body) = section(&lines, "PATTERNS") {
            meta.patterns = body
                .iter()
                .filter_map(|line| line.trim().strip_prefix('-'))
                .map(|item| item.split('(').next().unwrap_or_default().trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
        }

        if let Some(body) = section(&lines, "ARGUMENTS") {
            meta.arguments = body
                .iter()
                .filter_map(|line| argument_re().captures(line.trim()))
                .map(|caps| DocArgument {
                    name: caps[1].to_string(),
                    type_name: caps[2].trim().to_string(),
                    description: caps[3].trim().trim_end_matches('.').to_string(),
                    default: caps
                        .get(4)
                        .map(|m| unquote(m.as_str().trim()).to_string())
                        .unwrap_or_default(),
                })
                .collect();
        }

        meta
    }
}

fn is_section_heading(line: &str) -> Option<&'static str> {
    let trimmed = line.trim();
    SECTIONS.into_iter().find(|name| {
        trimmed
            .strip_suffix(':')
            .is_some_and(|head| head.eq_ignore_ascii_case(name))
    })
}

/// Lines between `NAME:` and the next known section heading.
fn section<'a>(lines: &[&'a str], name: &'static str) -> Option<Vec<&'a str>> {
    let start = lines
        .iter()
        .position(|line| is_section_heading(line) == Some(name))?;
    Some(
        lines[start + 1..]
            .iter()
            .take_while(|line| is_section_heading(line).is_none())
            .copied()
            .collect(),
    )
}

pub(crate) fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

/// Name from a legacy first line such as `Lesson 02: Multi-Provider Support`.
pub fn legacy_name(docstring: &str) -> Option<String> {
    let first = docstring.lines().next()?;
    let (_, name) = first.split_once(':')?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Everything after the first line, minus blank and heading lines, stopping at the
/// usage section.
pub fn legacy_description(docstring: &str) -> String {
    docstring
        .lines()
        .skip(1)
        .map(str::trim)
        .take_while(|line| !line.starts_with("Run with:") && !line.starts_with("Run:"))
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.ends_with(':'))
        .collect::<Vec<_>>()
        .join("\n")
}
