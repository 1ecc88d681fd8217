//! The sole query-to-FTS5-expression normalizer.
//!
//! `NOT` is always consumed together with the single token that follows
//! it — this engine's simplified grammar never emits an exclusion clause,
//! so a lone `NOT x` (or an embedded `AND NOT x`) disappears rather than
//! producing a query FTS5 would reject or silently return nothing useful
//! for. This is what makes "drop a single leading NOT" and "mid-query
//! `AND NOT term`" the same rule rather than two special cases.

const METACHARACTERS: &[char] = &[
    '\'', '"', '(', ')', '*', ':', '^', '~', '+', '{', '}', '[', ']', '\\', ';', '@', '<', '>', '#',
    '!', '$', '%', '&', '|', ',', '.', '/', '`', '?',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Operator(Operator),
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    And,
    Or,
    Not,
}

impl Operator {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AND" => Some(Operator::And),
            "OR" => Some(Operator::Or),
            "NOT" => Some(Operator::Not),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Not => "NOT",
        }
    }
}

/// The single authoritative transformation from a raw user query to a
/// valid, parser-acceptable FTS5 MATCH expression.
pub fn sanitize_fts5_query(raw: &str) -> String {
    let mut tokens: Vec<(Token, String)> = Vec::new();

    for word in raw.split_whitespace() {
        if let Some(op) = Operator::from_str(word) {
            tokens.push((Token::Operator(op), op.as_str().to_string()));
            continue;
        }
        for piece in word.split('-') {
            let cleaned: String = piece.chars().filter(|c| !METACHARACTERS.contains(c)).collect();
            if !cleaned.is_empty() {
                tokens.push((Token::Word, cleaned));
            }
        }
    }

    // NOT always consumes the token immediately following it (or just
    // itself, if it is the last token).
    let mut without_not = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].0 == Token::Operator(Operator::Not) {
            i += 2;
            continue;
        }
        without_not.push(tokens[i].clone());
        i += 1;
    }

    // Drop leading/trailing operators.
    while matches!(without_not.first(), Some((Token::Operator(_), _))) {
        without_not.remove(0);
    }
    while matches!(without_not.last(), Some((Token::Operator(_), _))) {
        without_not.pop();
    }

    // Collapse runs of consecutive operators down to the first.
    let mut collapsed: Vec<(Token, String)> = Vec::with_capacity(without_not.len());
    for (kind, text) in without_not {
        if kind == Token::Operator(Operator::And) || kind == Token::Operator(Operator::Or) {
            if matches!(collapsed.last(), Some((Token::Operator(_), _))) {
                continue;
            }
        }
        collapsed.push((kind, text));
    }
    // A trailing operator can reappear after collapsing (e.g. "a AND OR"
    // becomes "a AND" once OR is dropped as a dup) — strip again.
    while matches!(collapsed.last(), Some((Token::Operator(_), _))) {
        collapsed.pop();
    }

    let mut out = String::new();
    let mut prev_was_word = false;
    for (kind, text) in collapsed {
        if !out.is_empty() {
            if kind == Token::Word && prev_was_word {
                out.push_str(" AND ");
            } else {
                out.push(' ');
            }
        }
        out.push_str(&text);
        prev_was_word = kind == Token::Word;
    }

    out
}

/// Wrap a raw query in double quotes for FTS5 phrase search, doubling any
/// embedded double quote.
pub fn phrase_query(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

/// Re-apply sanitization to a caller-supplied "already sanitized" query
/// if it still contains metacharacters, logging a warning — callers that
/// pass `pre_sanitized` are trusted but not blindly.
pub fn ensure_sanitized(query: &str, pre_sanitized: bool) -> String {
    if pre_sanitized && !query.chars().any(|c| METACHARACTERS.contains(&c)) {
        return query.to_string();
    }
    if pre_sanitized {
        tracing::warn!(query, "pre-sanitized query still contained FTS5 metacharacters; re-sanitizing");
    }
    sanitize_fts5_query(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_example_hyphen_split_and_not_removal() {
        let out = sanitize_fts5_query("machine-learning AND NOT 'neural' (network)");
        assert_eq!(out, "machine AND learning AND network");
    }

    #[test]
    fn lone_leading_not_query_becomes_empty() {
        assert_eq!(sanitize_fts5_query("NOT urgent"), "");
    }

    #[test]
    fn preserves_or_between_words() {
        assert_eq!(sanitize_fts5_query("cats OR dogs"), "cats OR dogs");
    }

    #[test]
    fn strips_all_metacharacters() {
        let out = sanitize_fts5_query("a'b\"c(d)e*f:g^h~i+j{k}l[m]n\\o;p@q<r>s#t!u$v%w&x|y,z.aa/bb`cc?dd");
        assert!(!out.chars().any(|c| METACHARACTERS.contains(&c)));
    }

    #[test]
    fn drops_leading_trailing_and_consecutive_operators() {
        assert_eq!(sanitize_fts5_query("AND hello OR"), "hello");
        assert_eq!(sanitize_fts5_query("hello AND OR world"), "hello AND world");
    }

    #[test]
    fn is_idempotent_modulo_whitespace() {
        let once = sanitize_fts5_query("machine-learning AND NOT 'neural' (network)");
        let twice = sanitize_fts5_query(&once);
        assert_eq!(once, twice);
        assert!(!twice.chars().any(|c| METACHARACTERS.contains(&c)));
    }

    #[test]
    fn phrase_query_escapes_embedded_quotes() {
        assert_eq!(phrase_query(r#"say "hi""#), r#""say ""hi""""#);
    }

    #[test]
    fn ensure_sanitized_reapplies_when_metacharacters_remain() {
        let out = ensure_sanitized("bad'query", true);
        assert_eq!(out, "badquery");
        let out = ensure_sanitized("clean query", true);
        assert_eq!(out, "clean query");
    }
}
