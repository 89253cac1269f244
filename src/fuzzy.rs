//! Fuzzy text scoring on a 0..100 scale
//!
//! `ratio` is normalized Levenshtein similarity. `partial_ratio` and
//! `token_sort_ratio` build on it the same way the usual fuzzy-matching
//! libraries do.

/// Lowercase, drop punctuation, split on whitespace
pub fn normalize_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

pub fn normalize(text: &str) -> String {
    normalize_words(text).join(" ")
}

pub fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    strsim::normalized_levenshtein(a, b) * 100.0
}

/// Best `ratio` of the shorter string against equally long word-aligned
/// windows of the longer one
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a = normalize_words(a);
    let b = normalize_words(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let needle = short.join(" ");
    let width = short.len();

    let mut best = 0.0f64;
    for window in long.windows(width) {
        let score = ratio(&needle, &window.join(" "));
        if score > best {
            best = score;
            if best >= 100.0 {
                break;
            }
        }
    }
    best
}

/// `ratio` after sorting the words of both strings
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let mut wa = normalize_words(a);
    let mut wb = normalize_words(b);
    wa.sort();
    wb.sort();
    ratio(&wa.join(" "), &wb.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation() {
        assert_eq!(normalize("  \"Hello,\"  World! It's  "), "hello world it's");
    }

    #[test]
    fn test_token_sort_ignores_order() {
        assert_eq!(token_sort_ratio("Frank Herbert Dune", "dune, frank herbert"), 100.0);
        assert!(token_sort_ratio("Dune", "Dune Messiah 6") < 80.0);
    }

    #[test]
    fn test_partial_ratio_finds_substring() {
        let seg = "the spice must flow";
        let text = "and so he said that the spice must flow across the desert";
        assert_eq!(partial_ratio(seg, text), 100.0);
        assert!(partial_ratio("completely unrelated words", text) < 60.0);
    }
}
