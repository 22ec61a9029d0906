use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own sources. Anything else in the checkout is
// not subject to the source policy.
const SOURCE_ROOTS: [&str; 3] = ["combine", "src", "tests"];

/// One source policy rule: a line regex plus a filter that decides whether a
/// matched line really is a violation.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

// Collects every violating line of a single file for one rule.
struct RuleCollector<'a> {
    rule: &'a Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'a> RuleCollector<'a> {
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

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if (self.rule.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

fn comment_text(line: &str) -> &str {
    line.trim_start()
        .trim_start_matches('/')
        .trim_start_matches('!')
        .trim_start_matches('*')
        .trim()
}

// An underscore-prefixed name inside quotes is text, not a binding.
fn is_underscore_binding(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn is_plain_comment_with_stars(line: &str) -> bool {
    is_comment(line) && !is_doc_comment(line)
}

fn is_shouting_comment(line: &str) -> bool {
    if !is_comment(line) {
        return false;
    }
    let mut letters = comment_text(line).chars().filter(|c| c.is_alphabetic());
    match letters.next() {
        Some(first) => first.is_uppercase() && letters.all(char::is_uppercase),
        None => false,
    }
}

fn always(_: &str) -> bool {
    true
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed variables",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        is_violation: is_underscore_binding,
        advice: "Underscore-prefixed variable names are not allowed. Use the variable or remove it.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        is_violation: always,
        advice: "#[allow(dead_code)] is not allowed. Use the code or remove it.",
    },
    Rule {
        name: "history comments",
        pattern: r"(//|/\*).*\b(?:FIXED|FIX|FIXES|CORRECTED|NEW|CHANGED|CHANGE|MODIFIED|UPDATED|UPDATE)\b",
        is_violation: always,
        advice: "Comments describe the code as it is, not how it got there. Remove the comment.",
    },
    Rule {
        name: "'**' patterns in regular comments",
        pattern: r"(//|/\*).*\*\*",
        is_violation: is_plain_comment_with_stars,
        advice: "The '**' pattern is only allowed in doc comments.",
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        is_violation: is_shouting_comment,
        advice: "Comments where every letter is uppercase are not allowed.",
    },
];

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS.into_iter().flat_map(|root| {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in rust_sources() {
            let mut collector = RuleCollector::new(rule, &path);
            searcher.search_path(&matcher, &path, &mut collector)?;
            if let Some(error_message) = collector.check_and_get_error_message() {
                return Err(error_message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    // The `eprintln!` is what surfaces the message in cargo's output.
    if let Err(e) = scan_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
