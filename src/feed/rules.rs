//! Matching-rule expressions.
//!
//! Each stream tracker contributes a list of terms (`from:123`, `#rust`, `"machine learning"`,
//! `$TSLA`) which are OR-joined into one expression. Expressions longer than the feed's limit
//! are split into several rules sharing the tracker's tag.

const OR: &str = " OR ";

/// Local routing tag for a tracker's rules. Never interpreted by the feed.
pub fn rule_tag(tracker_id: &str) -> String {
    format!("tracker:{tracker_id}")
}

pub fn from_term(user_id: &str) -> String {
    format!("from:{}", user_id.trim())
}

pub fn hashtag_term(tag: &str) -> Option<String> {
    let tag = tag.trim().trim_start_matches('#');
    (!tag.is_empty() && !tag.contains(char::is_whitespace)).then(|| format!("#{tag}"))
}

pub fn cashtag_term(symbol: &str) -> Option<String> {
    normalize_symbol(symbol).map(|s| format!("${s}"))
}

/// `BTC`, `$btc` and ` Btc ` all name the same symbol.
pub fn normalize_symbol(symbol: &str) -> Option<String> {
    let s = symbol.trim().trim_start_matches('$').to_uppercase();
    (!s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')).then_some(s)
}

/// Multi-word phrases are quoted so the feed matches them exactly.
pub fn keyword_term(keyword: &str) -> Option<String> {
    let cleaned = keyword.trim().replace('"', "");
    if cleaned.is_empty() {
        None
    } else if cleaned.contains(char::is_whitespace) {
        Some(format!("\"{cleaned}\""))
    } else {
        Some(cleaned)
    }
}

/// OR-join `terms` into expressions no longer than `max_len`.
///
/// Duplicate terms are dropped. A single term longer than `max_len` still gets its own rule;
/// the feed will reject it and the error surfaces at registration.
pub fn build_rule_values(terms: &[String], max_len: usize) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut seen: Vec<&str> = Vec::with_capacity(terms.len());

    for term in terms {
        if seen.contains(&term.as_str()) {
            continue;
        }
        seen.push(term);

        if current.is_empty() {
            current.push_str(term);
        } else if current.len() + OR.len() + term.len() <= max_len {
            current.push_str(OR);
            current.push_str(term);
        } else {
            values.push(std::mem::take(&mut current));
            current.push_str(term);
        }
    }
    if !current.is_empty() {
        values.push(current);
    }
    values
}
