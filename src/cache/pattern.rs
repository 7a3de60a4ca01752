//! Shell-style glob matching for cache invalidation.
//!
//! | Token | Matches                          |
//! |-------|----------------------------------|
//! | `*`   | any run of characters, even none |
//! | `?`   | exactly one character            |
//! | `\c`  | the literal character `c`        |
//!
//! Everything else matches itself. Patterns are matched against the whole key.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    tokens: Vec<Token>,
}

impl Glob {
    /// Compile `pattern`. Consecutive `*` collapse into one; a trailing lone
    /// backslash is taken literally.
    pub fn new(pattern: &str) -> Self {
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            let token = match c {
                '*' => {
                    if tokens.last() == Some(&Token::AnyRun) {
                        continue;
                    }
                    Token::AnyRun
                }
                '?' => Token::AnyChar,
                '\\' => Token::Literal(chars.next().unwrap_or('\\')),
                other => Token::Literal(other),
            };
            tokens.push(token);
        }

        Self { tokens }
    }

    /// Returns `true` when `text` matches the whole pattern.
    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        let tokens = &self.tokens;
        let (mut t, mut p) = (0usize, 0usize);
        // Position of the last `*` and the text index it is currently absorbing up to.
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match tokens.get(p) {
                Some(Token::Literal(c)) if *c == text[t] => {
                    t += 1;
                    p += 1;
                }
                Some(Token::AnyChar) => {
                    t += 1;
                    p += 1;
                }
                Some(Token::AnyRun) => {
                    backtrack = Some((p, t));
                    p += 1;
                }
                _ => match backtrack {
                    Some((star, absorbed)) => {
                        p = star + 1;
                        t = absorbed + 1;
                        backtrack = Some((star, absorbed + 1));
                    }
                    None => return false,
                },
            }
        }

        tokens[p..].iter().all(|tok| *tok == Token::AnyRun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, text: &str) -> bool {
        Glob::new(pattern).matches(text)
    }

    #[test]
    fn literal() {
        assert!(m("reservations:42", "reservations:42"));
        assert!(!m("reservations:42", "reservations:421"));
        assert!(!m("reservations:42", "reservations:4"));
    }

    #[test]
    fn star() {
        assert!(m("reservations:*", "reservations:42"));
        assert!(m("reservations:*", "reservations:"));
        assert!(m("*", ""));
        assert!(m("*:42", "properties:42"));
        assert!(m("a*b*c", "aXXbYYc"));
        assert!(!m("a*b*c", "aXXbYY"));
        assert!(!m("reservations:*", "properties:42"));
    }

    #[test]
    fn question_mark() {
        assert!(m("page:?", "page:3"));
        assert!(!m("page:?", "page:10"));
        assert!(!m("?", ""));
    }

    #[test]
    fn star_backtracks() {
        assert!(m("*ab", "aab"));
        assert!(m("*a*a", "banana"));
        assert!(!m("*a*x", "banana"));
    }

    #[test]
    fn escapes() {
        assert!(m(r"literal\*", "literal*"));
        assert!(!m(r"literal\*", "literalX"));
        assert!(m(r"q\?", "q?"));
    }

    #[test]
    fn consecutive_stars_collapse() {
        assert!(m("a**b", "ab"));
        assert_eq!(Glob::new("a***b").tokens.len(), 3);
    }

    #[test]
    fn unicode_keys() {
        assert!(m("h?tel:*", "hôtel:paris"));
    }
}
