//! Exclusion pattern matching for the collection walker.
//!
//! Patterns support `*` (within one component), `?`, character classes
//! `[...]`, and the `**` extension meaning any number of path components
//! including zero. Plain patterns compile to [`glob::Pattern`]; patterns
//! containing `**` compile to an anchored regular expression.

use anyhow::{Context, Result, bail};
use glob::Pattern;
use regex::Regex;
use std::path::Path;

// `*` and `?` must not cross component boundaries.
const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug)]
enum Compiled {
    Glob(Pattern),
    Recursive(Regex),
}

/// A compiled set of exclusion patterns.
///
/// For each candidate path up to four forms are tested: the absolute
/// path, the basename, the path relative to `/`, and the path relative
/// to the staging root. A match on any form excludes the path.
#[derive(Debug, Default)]
pub struct ExclusionSet {
    patterns: Vec<(String, Compiled)>,
}

impl ExclusionSet {
    /// Compile a pattern list, failing on the first syntactically invalid
    /// pattern.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let normalized = raw.replace('\\', "/");
            let entry = if normalized.contains("**") {
                let regex = Regex::new(&recursive_pattern_to_regex(&normalized)?)
                    .with_context(|| format!("invalid exclusion pattern {:?}", raw))?;
                Compiled::Recursive(regex)
            } else {
                let pattern = Pattern::new(&normalized)
                    .with_context(|| format!("invalid exclusion pattern {:?}", raw))?;
                Compiled::Glob(pattern)
            };
            compiled.push((normalized, entry));
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Test a path against the set.
    ///
    /// `staging_root` is the root the relative-to-staging candidate is
    /// computed against; pass `None` when no staging tree exists yet.
    pub fn is_excluded(&self, path: &Path, staging_root: Option<&Path>) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let mut candidates: Vec<String> = Vec::with_capacity(4);
        let full = path.to_string_lossy().replace('\\', "/");
        push_unique(&mut candidates, full.clone());
        if let Some(name) = path.file_name() {
            push_unique(&mut candidates, name.to_string_lossy().into_owned());
        }
        if let Some(rel) = full.strip_prefix('/') {
            push_unique(&mut candidates, rel.to_string());
        }
        if let Some(root) = staging_root
            && let Ok(rel) = path.strip_prefix(root)
        {
            push_unique(&mut candidates, rel.to_string_lossy().replace('\\', "/"));
        }

        for candidate in &candidates {
            for (_, compiled) in &self.patterns {
                let hit = match compiled {
                    Compiled::Glob(pattern) => pattern.matches_with(candidate, GLOB_OPTS),
                    Compiled::Recursive(regex) => regex.is_match(candidate),
                };
                if hit {
                    return true;
                }
            }
        }
        false
    }
}

fn push_unique(candidates: &mut Vec<String>, value: String) {
    if !value.is_empty() && !candidates.contains(&value) {
        candidates.push(value);
    }
}

/// Translate a pattern containing `**` into an anchored regex.
///
/// `**/` and `/**` match zero or more whole components; a bare `**`
/// matches anything including `/`.
fn recursive_pattern_to_regex(pattern: &str) -> Result<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let len = chars.len();
    let mut re = String::from("^");
    let mut i = 0;

    while i < len {
        match chars[i] {
            '*' if i + 1 < len && chars[i + 1] == '*' => {
                let at_start = i == 0;
                let after = i + 2;
                if (at_start || chars[i - 1] == '/') && after < len && chars[after] == '/' {
                    // "**/" — zero or more leading components
                    re.push_str("(?:[^/]+/)*");
                    i = after + 1;
                } else {
                    re.push_str(".*");
                    i = after;
                }
            }
            '/' if i + 2 < len
                && chars[i + 1] == '*'
                && chars[i + 2] == '*'
                && i + 3 == len =>
            {
                // trailing "/**" — the directory itself or anything below
                re.push_str("(?:/.*)?");
                i = len;
            }
            '*' => {
                re.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                re.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let mut j = i + 1;
                let mut class = String::from("[");
                if j < len && (chars[j] == '!' || chars[j] == '^') {
                    class.push('^');
                    j += 1;
                }
                while j < len && chars[j] != ']' {
                    match chars[j] {
                        '\\' => class.push_str("\\\\"),
                        c => class.push(c),
                    }
                    j += 1;
                }
                if j >= len {
                    bail!("unterminated character class in {:?}", pattern);
                }
                class.push(']');
                re.push_str(&class);
                i = j + 1;
            }
            c => {
                re.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    re.push('$');
    Ok(re)
}
