//! Path-aware glob matching for rule address patterns.
//!
//! Syntax:
//! - `*` matches any run of characters except `/`. A star that opens the
//!   pattern is unrestricted and also consumes `/`, so `*` alone matches
//!   every candidate.
//! - `?` matches exactly one character other than `/`.
//! - `[...]` matches one character from the class. A leading `!` negates it,
//!   `a-z` is an inclusive range by code point (an inverted range matches
//!   nothing), a `]` right after `[` or `[!` is literal, and `-` is literal
//!   when it starts or ends the class. A `/` is only matched by a
//!   non-negated class listing it on its own.
//! - `\` escapes the next character, inside classes as well.
//! - An unterminated `[` is a literal character.
//!
//! Matching is anchored at both ends.

const SEPARATOR: char = '/';

/// A parsed bracket expression.
struct Class {
    negated: bool,
    singles: Vec<char>,
    ranges: Vec<(char, char)>,
}

impl Class {
    fn matches(&self, c: char) -> bool {
        if c == SEPARATOR {
            return !self.negated && self.singles.contains(&SEPARATOR);
        }
        let listed =
            self.singles.contains(&c) || self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        listed != self.negated
    }
}

/// Parse the bracket expression whose `[` sits at `start`.
///
/// Returns the class and the position just past its closing `]`, or `None`
/// when the expression is unterminated.
fn parse_class(pat: &[char], start: usize) -> Option<(Class, usize)> {
    let mut i = start + 1;
    let negated = pat.get(i) == Some(&'!');
    if negated {
        i += 1;
    }

    let mut class = Class {
        negated,
        singles: Vec::new(),
        ranges: Vec::new(),
    };
    let mut first = true;

    loop {
        let c = *pat.get(i)?;
        if c == ']' && !first {
            return Some((class, i + 1));
        }
        first = false;

        let (lo, next) = read_class_char(pat, i)?;
        i = next;

        // `-` followed by the closing bracket is a literal dash.
        if pat.get(i) == Some(&'-') && pat.get(i + 1).is_some_and(|&c| c != ']') {
            let (hi, next) = read_class_char(pat, i + 1)?;
            class.ranges.push((lo, hi));
            i = next;
        } else {
            class.singles.push(lo);
        }
    }
}

/// Read one possibly escaped character of a class.
fn read_class_char(pat: &[char], i: usize) -> Option<(char, usize)> {
    match *pat.get(i)? {
        '\\' => pat.get(i + 1).map(|&c| (c, i + 2)),
        c => Some((c, i + 1)),
    }
}

/// Check if `candidate` matches the glob `pattern` in full.
///
/// Runs a single backtracking scan. Two resume points are tracked: the
/// unrestricted star opening the pattern and the most recent inner star.
/// Inner stars never cross a separator, so once the latest one is blocked
/// only the opening star can still advance.
pub fn matches_glob(pattern: &str, candidate: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = candidate.chars().collect();

    let mut pi = 0;
    let mut si = 0;
    // (pattern index after the star, next candidate index the star may eat)
    let mut leading: Option<(usize, usize)> = None;
    let mut inner: Option<(usize, usize)> = None;

    loop {
        if pi < pat.len() {
            match pat[pi] {
                '*' => {
                    let opens_pattern = pi == 0 || pat[..pi].iter().all(|&c| c == '*');
                    while pi < pat.len() && pat[pi] == '*' {
                        pi += 1;
                    }
                    if opens_pattern {
                        leading = Some((pi, si));
                    } else {
                        inner = Some((pi, si));
                    }
                    continue;
                }
                '?' => {
                    if si < s.len() && s[si] != SEPARATOR {
                        pi += 1;
                        si += 1;
                        continue;
                    }
                }
                '[' => match parse_class(&pat, pi) {
                    Some((class, next)) => {
                        if si < s.len() && class.matches(s[si]) {
                            pi = next;
                            si += 1;
                            continue;
                        }
                    }
                    None => {
                        if si < s.len() && s[si] == '[' {
                            pi += 1;
                            si += 1;
                            continue;
                        }
                    }
                },
                '\\' => {
                    // A trailing backslash stands for itself.
                    let (literal, width) = match pat.get(pi + 1) {
                        Some(&c) => (c, 2),
                        None => ('\\', 1),
                    };
                    if si < s.len() && s[si] == literal {
                        pi += width;
                        si += 1;
                        continue;
                    }
                }
                literal => {
                    if si < s.len() && s[si] == literal {
                        pi += 1;
                        si += 1;
                        continue;
                    }
                }
            }
        } else if si == s.len() {
            return true;
        }

        // Mismatch: let the latest star swallow one more character.
        if let Some((star_pi, star_si)) = inner {
            if star_si < s.len() && s[star_si] != SEPARATOR {
                inner = Some((star_pi, star_si + 1));
                pi = star_pi;
                si = star_si + 1;
                continue;
            }
        }
        if let Some((star_pi, star_si)) = leading {
            if star_si < s.len() {
                leading = Some((star_pi, star_si + 1));
                inner = None;
                pi = star_pi;
                si = star_si + 1;
                continue;
            }
        }
        return false;
    }
}
