//! Deterministic query expansion.
//!
//! A small fixed rewrite table: case-fold, punctuation strip, camelCase
//! split, plural stems, and a handful of domain synonyms. Pure function of
//! its input; identical queries always expand identically, on any machine.

use std::collections::BTreeSet;

const SYNONYMS: &[(&str, &[&str])] = &[
    ("payment", &["payments", "billing", "charge"]),
    ("refund", &["refunds", "reversal", "chargeback"]),
    ("subscription", &["subscriptions", "plan", "renewal"]),
    ("status", &["state", "lifecycle"]),
    ("order", &["orders", "purchase"]),
];

/// Split a word at camelCase boundaries: `refundEvents` -> `refund`, `events`.
fn camel_parts(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in word.chars() {
        if ch.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            parts.push(current.to_lowercase());
            current = String::new();
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        current.push(ch);
    }
    if !current.is_empty() {
        parts.push(current.to_lowercase());
    }
    parts
}

/// Tokenize: keep `[A-Za-z0-9_]` runs, split camelCase, lowercase.
fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in query.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
        } else if !word.is_empty() {
            tokens.extend(camel_parts(&word));
            word.clear();
        }
    }
    if !word.is_empty() {
        tokens.extend(camel_parts(&word));
    }
    tokens
}

fn stem_variants(token: &str, expanded: &mut BTreeSet<String>) {
    if let Some(stem) = token.strip_suffix("ies") {
        if token.len() > 4 {
            expanded.insert(format!("{stem}y"));
            return;
        }
    }
    if token.ends_with('s') && !token.ends_with("ss") && token.len() > 3 {
        expanded.insert(token[..token.len() - 1].to_string());
    } else {
        expanded.insert(format!("{token}s"));
    }
}

/// Expand a query into retrieval texts: the original query first, then a
/// single string of all expansion tokens in sorted order.
pub fn expand_query(query: &str) -> Vec<String> {
    let tokens = tokenize(query);
    let mut expanded: BTreeSet<String> = tokens.iter().cloned().collect();

    for token in &tokens {
        stem_variants(token, &mut expanded);
        for (key, synonyms) in SYNONYMS {
            if token == key {
                expanded.extend(synonyms.iter().map(|s| s.to_string()));
            }
        }
    }

    if expanded.is_empty() {
        return vec![query.to_string()];
    }

    let joined = expanded.into_iter().collect::<Vec<_>>().join(" ");
    if joined == query {
        vec![query.to_string()]
    } else {
        vec![query.to_string(), joined]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_is_deterministic() {
        let a = expand_query("Refund Flow");
        let b = expand_query("Refund Flow");
        assert_eq!(a, b);
        assert_eq!(a[0], "Refund Flow");
    }

    #[test]
    fn case_fold_and_punctuation_strip() {
        let expanded = expand_query("User.Email!");
        assert!(expanded[1].contains("user"));
        assert!(expanded[1].contains("email"));
        assert!(!expanded[1].contains('!'));
    }

    #[test]
    fn camel_case_is_split() {
        let expanded = expand_query("refundEvents");
        assert!(expanded[1].contains("refund"));
        assert!(expanded[1].contains("events"));
    }

    #[test]
    fn plural_stems_both_directions() {
        let expanded = expand_query("orders");
        assert!(expanded[1].contains("order"));
        let expanded = expand_query("invoice");
        assert!(expanded[1].contains("invoices"));
    }

    #[test]
    fn ies_plural_stems_to_y() {
        let expanded = expand_query("categories");
        assert!(expanded[1].contains("category"));
    }

    #[test]
    fn synonyms_are_applied() {
        let expanded = expand_query("refund");
        assert!(expanded[1].contains("chargeback"));
        assert!(expanded[1].contains("reversal"));
    }

    #[test]
    fn empty_query_passes_through() {
        assert_eq!(expand_query(""), vec!["".to_string()]);
        assert_eq!(expand_query("!!"), vec!["!!".to_string()]);
    }
}
