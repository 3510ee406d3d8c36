use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Nothing outside them is scanned.
const SOURCE_DIRS: [&str; 6] = ["sites", "genes", "shared", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

// One hygiene rule: a line regex plus a second-stage filter that can veto a match
// (for example when the hit sits inside a string literal).
struct Rule {
    name: &'static str,
    pattern: String,
    keep: fn(&str) -> bool,
    advice: &'static str,
}

// Collects every line of one file that a rule flags.
struct RuleCollector<'a> {
    rule: &'a Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.keep)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

impl RuleCollector<'_> {
    fn error_message(&self, path: &Path) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.name,
            path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(msg)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

// An underscore-prefixed identifier is tolerated inside comments and between quotes.
fn underscore_in_code(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    let quoted = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !quoted
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

// Comment text whose alphabetic characters are all uppercase.
fn shouting_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("///") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            keep: underscore_in_code,
            advice: "Underscore-prefixed names are not allowed. Use the value or remove it.",
        },
        Rule {
            name: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{FORBIDDEN_WORDS})"),
            keep: always,
            advice: "Comments narrating edits (fixed, changed, updated and the like) are not allowed.",
        },
        Rule {
            name: "'**' in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            keep: stars_outside_doc_comment,
            advice: "The '**' pattern is only allowed in doc comments.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"//.*".to_string(),
            keep: shouting_comment,
            advice: "Comments whose letters are all uppercase are not allowed.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            keep: always,
            advice: "Use the code or delete it instead of silencing the lint.",
        },
    ]
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check(rules: &[Rule], files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in rules {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        for path in files {
            let mut collector = RuleCollector {
                rule,
                violations: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(msg) = collector.error_message(path) {
                return Err(msg.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = check(&rules(), &rust_sources()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
