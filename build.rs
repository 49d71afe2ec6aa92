use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources. Nothing else in the checkout is scanned.
const SOURCE_DIRS: [&str; 5] = ["core", "shared", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWords,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Self::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Self::ForbiddenWords => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Self::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Self::AllCapsComment => r"(//|/\*|///).*".to_string(),
            Self::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn applies_to_build_script(self) -> bool {
        matches!(self, Self::UnderscorePrefix)
    }

    fn explanation(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed in this project.\n   Either use the binding (removing the underscore) or remove it completely."
            }
            Self::ForbiddenWords => {
                "Comments narrating edits (fixed, changed, modified, updated and similar, in capitals) are forbidden.\n   Remove them completely rather than commenting them out."
            }
            Self::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (it is allowed in doc comments)."
            }
            Self::AllCapsComment => {
                "Comments where all alphabetic characters are uppercase are forbidden.\n   Strongly consider deleting the comment completely."
            }
            Self::AllowDeadCode => {
                "#[allow(dead_code)] attributes are forbidden.\n   Either use the code or remove it completely."
            }
        }
    }

    // Returns true when a matched line really violates the rule.
    fn confirms(self, line: &str) -> bool {
        match self {
            Self::UnderscorePrefix => !is_comment_line(line) && !underscore_only_in_strings(line),
            Self::ForbiddenWords | Self::AllowDeadCode => true,
            Self::StarsInComment => !is_doc_comment(line),
            Self::AllCapsComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(|c| c.is_uppercase())
            }),
        }
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

fn underscore_only_in_strings(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(index, part)| index % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
    } else {
        None
    }
}

// Collects every confirmed violation of one rule in one file.
struct RuleCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.confirms(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    let mut sources: Vec<PathBuf> = SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect();
    sources.sort();
    sources
}

fn scan(rule: Rule, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    let build_script = Path::new("build.rs");
    let extra = rule.applies_to_build_script().then_some(build_script);

    for path in sources.iter().map(PathBuf::as_path).chain(extra) {
        let mut collector = RuleCollector {
            rule,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: Found {} violations in {}:\n",
                collector.violations.len(),
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = rust_sources();
    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWords,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule, &sources) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
