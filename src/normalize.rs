//! Free-text canonicalization for roster matching.
//!
//! Incoming rows and stored records go through the same `normalize` before
//! any comparison, so matching is symmetric by construction. The canonical
//! form is lower-case ASCII-folded text with single spaces: diacritics are
//! stripped, punctuation is dropped, whitespace runs collapse.

/// Similarity floor for the AMBIGUOUS classification. Matches the original
/// roster tooling: near-matches at or above 70% are surfaced to the user.
pub const SIMILARITY_THRESHOLD: f64 = 0.70;

pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for raw in text.chars() {
        for ch in raw.to_lowercase() {
            let ch = fold_diacritic(ch);
            if ch.is_whitespace() {
                pending_space = !out.is_empty();
            } else if ch.is_alphanumeric() {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(ch);
            }
            // Everything else (punctuation, symbols) is dropped.
        }
    }
    out
}

/// Normalized Levenshtein similarity in `[0, 1]`. Both inputs are expected
/// to already be `normalize` output.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Maps accented Latin letters to their base letter. Covers the Latin-1
/// Supplement plus the Latin Extended-A letters that show up in roster
/// exports; anything else passes through unchanged.
fn fold_diacritic(ch: char) -> char {
    match ch {
        'à'..='å' | 'ā' | 'ă' | 'ą' | 'ª' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è'..='ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' => 'h',
        'ì'..='ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĺ' | 'ļ' | 'ľ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò'..='ö' | 'ō' | 'ŏ' | 'ő' | 'ø' | 'º' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'ţ' | 'ť' => 't',
        'ù'..='ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' | 'ŷ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    }
}
