//! Script-based language identification for transcripts
//!
//! First Unicode-range match wins, checked in a fixed order; the fallback
//! is English. Applied after a transcript arrives, the detected code
//! overrides any preset source-language on the segment.

/// Detect the language of a transcript from its script.
///
/// Order of checks: CJK unified ideographs (`zh`), hiragana/katakana
/// (`ja`), hangul (`ko`), ASCII-letters-only (`en`), then the diacritic
/// sets used by Spanish (`es`) and French (`fr`). Anything else falls back
/// to `en`.
pub fn detect_language(text: &str) -> &'static str {
    if text.chars().any(is_cjk_ideograph) {
        // Kana anywhere means Japanese even when ideographs are present
        if text.chars().any(is_kana) {
            return "ja";
        }
        return "zh";
    }
    if text.chars().any(is_kana) {
        return "ja";
    }
    if text.chars().any(is_hangul) {
        return "ko";
    }

    let mut any_alpha = false;
    let mut all_ascii = true;
    for c in text.chars() {
        if c.is_alphabetic() {
            any_alpha = true;
            if !c.is_ascii_alphabetic() {
                all_ascii = false;
            }
        }
    }
    if any_alpha && all_ascii {
        return "en";
    }

    if text.chars().any(is_spanish_marker) {
        return "es";
    }
    if text.chars().any(is_french_marker) {
        return "fr";
    }

    "en"
}

fn is_cjk_ideograph(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

fn is_kana(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}')
}

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}')
}

fn is_spanish_marker(c: char) -> bool {
    c == '¿' || c == '¡' || matches!(lower(c), 'ñ' | 'á' | 'í' | 'ó' | 'ú')
}

fn is_french_marker(c: char) -> bool {
    matches!(
        lower(c),
        'à' | 'â' | 'ç' | 'è' | 'ê' | 'ë' | 'î' | 'ï' | 'ô' | 'û' | 'ù' | 'œ'
    )
}

fn lower(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}
