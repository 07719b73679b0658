//! Glob-style pattern matching for SCAN and PSUBSCRIBE
//!
//! Supports `*` (any run, possibly empty), `?` (exactly one character),
//! `[abc]` / `[a-z]` / `[^a]` classes, and `\` to escape the next character.

/// Whether `pattern` matches the whole of `text`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    // Position of the last `*` and the text index it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    } else if text[t] == '[' {
                        // Unterminated class matches a literal bracket
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if c == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        match backtrack {
            Some((star, tried)) => {
                p = star + 1;
                t = tried + 1;
                backtrack = Some((star, tried + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Match `c` against the class opening at `pattern[start]`.
///
/// Returns whether it matched and the index just past the class, or
/// `None` when the class is not terminated.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let ch = pattern[i];
        if ch == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        if ch == '\\' && i + 1 < pattern.len() {
            matched |= pattern[i + 1] == c;
            i += 2;
        } else if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let (lo, hi) = (ch.min(pattern[i + 2]), ch.max(pattern[i + 2]));
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= ch == c;
            i += 1;
        }
    }
    None
}

/// Whether a channel name is a pattern rather than a literal
pub fn is_pattern(s: &str) -> bool {
    s.contains(&['*', '?', '['][..])
}
