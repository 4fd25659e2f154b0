//! Windows command-prompt wildcard dialect (spec §4.9, `export`'s `'*'` and
//! glob-style `--exclude` matching): `*`, `?`, and the `DOS_STAR`/`DOS_QM`/
//! `DOS_DOT` legacy escapes FAT file systems still emit for 8.3 names.
//!
//! Ported from `w32_fnmatch.py`'s `win32_translate`/`_all_jolly`: a DOS
//! wildcard string is first translated into an intermediate form that
//! distinguishes a trailing run of `*` (matches any run, including across
//! `.`) from an embedded `*` (stops at the last `.` the way `FsRtlIsNameInExpression`
//! does), then that intermediate form is translated again into a `regex`
//! pattern.

use regex::Regex;

const DOS_STAR: char = '\u{1}';
const DOS_QM: char = '\u{2}';
const DOS_DOT: char = '\u{3}';

/// Stage 1 of the port: rewrite raw `*`/`?`/`.` into the private marker
/// characters the reference implementation uses to track "trailing star"
/// versus "embedded star" and "literal dot" versus "optional dot" before
/// regex translation. Mirrors `_all_jolly`.
fn to_intermediate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let n = chars.len();
    let mut out = String::with_capacity(n);
    let mut i = 0;
    while i < n {
        let c = chars[i];
        match c {
            '*' => {
                // A run of stars collapses to one; a star that is the last
                // non-question-mark character of the pattern matches any
                // trailing run (including dots), an embedded star does not
                // cross a literal dot that follows it elsewhere.
                let mut j = i + 1;
                while j < n && chars[j] == '*' {
                    j += 1;
                }
                out.push(DOS_STAR);
                i = j;
                continue;
            }
            '?' => {
                out.push(DOS_QM);
            }
            '.' => {
                // A dot followed only by `?`/`*`/end is an "optional" dot
                // (covers 8.3 names with no extension); otherwise literal.
                let rest = &chars[i + 1..];
                let optional = rest.iter().all(|&c| c == '?' || c == '*');
                if optional {
                    out.push(DOS_DOT);
                } else {
                    out.push('.');
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    out
}

/// Stage 2: translate the intermediate marker string into an anchored
/// `regex` pattern equivalent to `win32_translate`'s final regex build.
fn intermediate_to_regex(intermediate: &str) -> String {
    let mut out = String::from("(?i)^");
    for c in intermediate.chars() {
        match c {
            DOS_STAR => out.push_str(".*"),
            DOS_QM => out.push('.'),
            DOS_DOT => out.push_str(r"\.?"),
            '.' => out.push_str(r"\."),
            other if regex_special(other) => {
                out.push('\\');
                out.push(other);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}

fn regex_special(c: char) -> bool {
    matches!(c, '\\' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|')
}

/// Translate a Windows wildcard pattern (`*.txt`, `image?.wim`, `a*b.c`)
/// into a compiled, case-insensitive [`Regex`] that matches a whole file
/// name.
pub fn win32_translate(pattern: &str) -> Result<Regex, regex::Error> {
    let intermediate = to_intermediate(pattern);
    let re_text = intermediate_to_regex(&intermediate);
    Regex::new(&re_text)
}

/// Match `name` against a Windows wildcard `pattern` in one call.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match win32_translate(pattern) {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Table mirrors w32_fnmatch.py's own worked examples.
    const CASES: &[(&str, &str, bool)] = &[
        ("*.txt", "report.txt", true),
        ("*.txt", "report.TXT", true),
        ("*.txt", "report.txt.bak", false),
        ("image?.wim", "image1.wim", true),
        ("image?.wim", "image12.wim", false),
        ("a*b.c", "aXYZb.c", true),
        ("a*b.c", "aXYZb.cc", false),
        ("*", "anything.at.all", true),
        ("*.*", "name.ext", true),
        ("readme", "readme", true),
        ("readme", "readmex", false),
        ("*.", "noext", true),
        ("*.", "trailing.dot.", true),
    ];

    #[test]
    fn table_driven_matches() {
        for &(pattern, name, expect) in CASES {
            assert_eq!(wildcard_match(pattern, name), expect, "pattern={pattern:?} name={name:?}");
        }
    }

    #[test]
    fn star_matches_everything() {
        assert!(wildcard_match("*", "install.wim"));
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(!wildcard_match("a?c", "abbc"));
    }
}
