//! Devanagari / Gujarati numeral normalisation.
//!
//! Catalogue scans number their entries in the script of the page
//! (`१६१`, `૧૬૧`). Spreadsheets sort and filter far better on ASCII digits,
//! so the serial-number column of every table row is passed through
//! [`normalize_digits`]. Free-text columns are never touched.

const DEVANAGARI_ZERO: u32 = 0x0966;
const GUJARATI_ZERO: u32 = 0x0AE6;

/// Map a single Devanagari or Gujarati digit to its ASCII homologue.
fn ascii_digit(c: char) -> Option<char> {
    let cp = c as u32;
    let offset = if (DEVANAGARI_ZERO..DEVANAGARI_ZERO + 10).contains(&cp) {
        cp - DEVANAGARI_ZERO
    } else if (GUJARATI_ZERO..GUJARATI_ZERO + 10).contains(&cp) {
        cp - GUJARATI_ZERO
    } else {
        return None;
    };
    char::from_digit(offset, 10)
}

/// `true` for U+0966–U+096F and U+0AE6–U+0AEF.
pub fn is_indic_digit(c: char) -> bool {
    ascii_digit(c).is_some()
}

/// Replace every Devanagari and Gujarati digit with the ASCII digit of the
/// same value. All other characters pass through unchanged.
///
/// ```rust
/// assert_eq!(scan2table::normalize_digits("१६१-A"), "161-A");
/// ```
pub fn normalize_digits(value: &str) -> String {
    value.chars().map(|c| ascii_digit(c).unwrap_or(c)).collect()
}
