use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only project sources are scanned; vendored or generated trees are not ours.
const SOURCE_DIRS: [&str; 4] = ["infer", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str =
    "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// One source policy: a line regex plus a filter that decides whether a
/// matching line is a real violation.
struct Rule {
    name: &'static str,
    pattern: String,
    applies: fn(&str) -> bool,
    advice: &'static str,
}

struct ViolationCollector<'a> {
    rule: &'a Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'a> ViolationCollector<'a> {
    fn new(rule: &'a Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.name,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.applies)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Text of a comment line with the comment marker stripped.
fn comment_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
    {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    Some(match line[start..].find("*/") {
        Some(end) => line[start..start + end].trim(),
        None => line[start..].trim(),
    })
}

fn underscore_in_code(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    // Identifiers inside string literals are text, not bindings.
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line)
}

fn all_caps_comment(line: &str) -> bool {
    if !is_comment(line) {
        return false;
    }
    let Some(body) = comment_body(line) else {
        return false;
    };
    let mut letters = body.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(|c| c.is_uppercase())
}

fn always(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            applies: underscore_in_code,
            advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
        },
        Rule {
            name: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{FORBIDDEN_WORDS})"),
            applies: always,
            advice: "Comments narrating edits (FIX, NEW, UPDATE and similar) are not allowed.",
        },
        Rule {
            name: "'**' in non-doc comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            applies: stars_outside_docs,
            advice: "Emphasis markers belong in doc comments only.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            applies: all_caps_comment,
            advice: "Comments written entirely in capitals are not allowed.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            applies: always,
            advice: "Use the code or remove it; dead code is denied crate-wide.",
        },
    ]
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .into_iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
}

fn scan(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    for rule in rules() {
        if let Err(e) = scan(&rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
