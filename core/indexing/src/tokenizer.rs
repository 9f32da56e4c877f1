//! Query tokenization for signal and component names.
//!
//! Names like `TirePressureLeft2-Status` become `tire pressure left 2 status`.

use std::collections::HashSet;

/// Split text into lowercase word tokens.
///
/// Each whitespace chunk is split into digit and non-digit runs; non-digit
/// runs are further split on punctuation and lower-to-upper case boundaries.
pub fn get_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for chunk in text.split_whitespace() {
        for (is_digit, run) in digit_runs(chunk) {
            if is_digit {
                tokens.push(run);
            } else {
                tokens.extend(segment_words(&run));
            }
        }
    }
    tokens
}

/// Tokens in first-seen order with duplicates removed.
pub fn unique_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    get_tokens(text)
        .into_iter()
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Drop leading all-uppercase dash-separated parts and join the rest with spaces.
///
/// `TPM-ECU-PressureLeft-Raw` becomes `PressureLeft Raw`.
pub fn clean_io_name(name: &str) -> String {
    name.split('-')
        .skip_while(|part| is_upper(part))
        .collect::<Vec<_>>()
        .join(" ")
}

/// At least one cased character and no lowercase ones.
fn is_upper(part: &str) -> bool {
    part.chars().any(char::is_uppercase) && !part.chars().any(char::is_lowercase)
}

fn digit_runs(chunk: &str) -> Vec<(bool, String)> {
    let mut runs: Vec<(bool, String)> = Vec::new();
    for ch in chunk.chars() {
        let is_digit = ch.is_ascii_digit();
        match runs.last_mut() {
            Some((last_is_digit, run)) if *last_is_digit == is_digit => run.push(ch),
            _ => runs.push((is_digit, ch.to_string())),
        }
    }
    runs
}

fn segment_words(run: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;

    for ch in run.chars() {
        if !ch.is_alphanumeric() {
            flush(&mut current, &mut words);
            previous_lower = false;
            continue;
        }
        if ch.is_uppercase() && previous_lower {
            flush(&mut current, &mut words);
        }
        previous_lower = ch.is_lowercase();
        current.extend(ch.to_lowercase());
    }
    flush(&mut current, &mut words);
    words
}

fn flush(current: &mut String, words: &mut Vec<String>) {
    if !current.is_empty() {
        words.push(std::mem::take(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_tokens_splits_digits_and_case() {
        assert_eq!(
            get_tokens("TirePressureLeft2-Status"),
            vec!["tire", "pressure", "left", "2", "status"]
        );
        assert_eq!(get_tokens("E186 oil_level"), vec!["e", "186", "oil", "level"]);
        assert!(get_tokens("  --  ").is_empty());
    }

    #[test]
    fn test_unique_tokens_keeps_first_order() {
        assert_eq!(unique_tokens("left Left right"), vec!["left", "right"]);
    }

    #[test]
    fn test_clean_io_name() {
        assert_eq!(clean_io_name("TPM-ECU-PressureLeft-Raw"), "PressureLeft Raw");
        assert_eq!(clean_io_name("Pressure-Left"), "Pressure Left");
        assert_eq!(clean_io_name("TPM-ECU"), "");
        assert_eq!(clean_io_name("123-Pressure"), "123 Pressure");
    }
}
