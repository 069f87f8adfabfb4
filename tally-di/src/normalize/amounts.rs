//! Amount resolution under rule-set conventions
//!
//! Amounts arrive as display strings: grouping characters, locale decimal
//! separators, currency glyphs, and one of several negative-sign
//! conventions. The amount policy decides how each is read; conflicting
//! sign markers are an ambiguity, not a guess.

use crate::models::{Amount, AmountPolicy};

/// Why a raw amount string could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    Unparseable(String),
    AmbiguousSign(String),
}

impl std::fmt::Display for AmountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unparseable(detail) => write!(f, "unparseable amount: {}", detail),
            Self::AmbiguousSign(detail) => write!(f, "ambiguous amount sign: {}", detail),
        }
    }
}

const CURRENCY_GLYPHS: [char; 3] = ['$', '€', '£'];

/// Parse a raw amount string into a fixed-point amount under the policy.
pub fn parse_amount(raw: &str, policy: &AmountPolicy) -> Result<Amount, AmountError> {
    let mut text = raw.trim();
    if text.is_empty() {
        return Err(AmountError::Unparseable("empty value".to_string()));
    }

    // Parentheses convention. Both parentheses and an explicit minus is a
    // contradiction the policy cannot resolve.
    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') {
        if !policy.parens_negative {
            return Err(AmountError::Unparseable(format!(
                "parentheses not allowed by policy in {:?}",
                raw
            )));
        }
        negative = true;
        text = text[1..text.len() - 1].trim();
        if text.starts_with('-') || text.ends_with('-') {
            return Err(AmountError::AmbiguousSign(format!(
                "parentheses and minus sign both present in {:?}",
                raw
            )));
        }
    }

    // Explicit sign: leading or trailing minus, or leading plus.
    let mut explicit_minus = false;
    if let Some(rest) = text.strip_prefix('-') {
        explicit_minus = true;
        text = rest.trim_start();
        if text.ends_with('-') {
            return Err(AmountError::AmbiguousSign(format!(
                "minus sign on both ends of {:?}",
                raw
            )));
        }
    } else if let Some(rest) = text.strip_suffix('-') {
        explicit_minus = true;
        text = rest.trim_end();
    } else if let Some(rest) = text.strip_prefix('+') {
        text = rest.trim_start();
    }
    negative = negative || explicit_minus;

    // Currency glyphs are display noise on either end.
    text = text
        .trim_start_matches(|c| CURRENCY_GLYPHS.contains(&c) || c == ' ')
        .trim_end_matches(|c| CURRENCY_GLYPHS.contains(&c) || c == ' ');

    if text.is_empty() {
        return Err(AmountError::Unparseable(format!("no digits in {:?}", raw)));
    }

    // Split on the decimal separator; at most one occurrence.
    let mut pieces = text.split(policy.decimal_separator);
    let whole_raw = pieces.next().unwrap_or("");
    let fraction_raw = pieces.next().unwrap_or("");
    if pieces.next().is_some() {
        return Err(AmountError::Unparseable(format!(
            "multiple decimal separators in {:?}",
            raw
        )));
    }

    let whole = strip_grouping(whole_raw, policy, raw)?;
    if whole.is_empty() && fraction_raw.is_empty() {
        return Err(AmountError::Unparseable(format!("no digits in {:?}", raw)));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::Unparseable(format!(
            "non-digit characters in {:?}",
            raw
        )));
    }
    if !fraction_raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::Unparseable(format!(
            "non-digit fraction in {:?}",
            raw
        )));
    }
    if fraction_raw.len() > policy.scale as usize {
        return Err(AmountError::Unparseable(format!(
            "{} fraction digits exceed scale {} in {:?}",
            fraction_raw.len(),
            policy.scale,
            raw
        )));
    }

    let divisor = 10i64.pow(policy.scale as u32);
    let whole_units: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| AmountError::Unparseable(format!("whole part overflows in {:?}", raw)))?
    };

    // Right-pad the fraction out to the policy scale.
    let mut fraction_units: i64 = 0;
    if !fraction_raw.is_empty() {
        let parsed: i64 = fraction_raw
            .parse()
            .map_err(|_| AmountError::Unparseable(format!("fraction overflows in {:?}", raw)))?;
        let padding = 10i64.pow((policy.scale as usize - fraction_raw.len()) as u32);
        fraction_units = parsed * padding;
    }

    let magnitude = whole_units
        .checked_mul(divisor)
        .and_then(|units| units.checked_add(fraction_units))
        .ok_or_else(|| AmountError::Unparseable(format!("amount overflows in {:?}", raw)))?;

    let minor_units = if negative { -magnitude } else { magnitude };
    Ok(Amount::new(minor_units, policy.scale))
}

/// Remove grouping characters, rejecting them when the policy has none.
fn strip_grouping(whole: &str, policy: &AmountPolicy, raw: &str) -> Result<String, AmountError> {
    match policy.thousands_separator {
        Some(sep) => Ok(whole.chars().filter(|c| *c != sep).collect()),
        None => {
            if whole.chars().any(|c| !c.is_ascii_digit()) {
                Err(AmountError::Unparseable(format!(
                    "grouping characters not allowed by policy in {:?}",
                    raw
                )))
            } else {
                Ok(whole.to_string())
            }
        }
    }
}
