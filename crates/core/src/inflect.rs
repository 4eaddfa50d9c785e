//! Minimal English inflection for relation names.
//!
//! Only what id shortcut keys need: `photos` → `photo`, `categories` → `category`.
//! Irregular nouns should be configured explicitly on the relation.

#![forbid(unsafe_code)]

/// Singular form of a plural relation name. Names that already look singular are returned as-is.
pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{}y", stem);
        }
    }
    for suffix in ["sses", "xes", "ches", "shes", "zzes"] {
        if word.len() > suffix.len() && word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        return word.to_string();
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

/// Key of the collection id shortcut for a relation, e.g. `photos` → `photo_ids`.
pub fn ids_key(singular: &str) -> String {
    format!("{}_ids", singular)
}
