use crate::domain::Scale;

/// How a raw page string should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Money,
    Ratio,
    Percent,
    Number,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedValue {
    pub value: f64,
    pub currency: Option<String>,
    pub scale: Scale,
}

impl ParsedValue {
    pub(crate) fn plain(value: f64) -> Self {
        Self {
            value,
            currency: None,
            scale: Scale::Units,
        }
    }
}

const ABSENT_MARKERS: &[&str] = &["", "n/a", "na", "-", "--", "\u{2014}"];

const CURRENCY_CODES: &[&str] = &["USD", "EUR", "GBP"];

/// Parse a published value; `None` when the source shows a placeholder or
/// the text is not a number of the expected kind.
pub fn parse_value(raw: &str, kind: ValueKind) -> Option<ParsedValue> {
    let trimmed = raw.trim();
    if ABSENT_MARKERS
        .iter()
        .any(|marker| trimmed.eq_ignore_ascii_case(marker))
    {
        return None;
    }

    match kind {
        ValueKind::Money => parse_money(trimmed),
        ValueKind::Ratio => {
            let text = trimmed
                .trim_end_matches(['x', 'X'])
                .replace(',', "");
            parse_number(text.trim()).map(ParsedValue::plain)
        }
        ValueKind::Percent => parse_percent(trimmed).map(ParsedValue::plain),
        ValueKind::Number => parse_number(&trimmed.replace(',', "")).map(ParsedValue::plain),
    }
}

fn parse_money(text: &str) -> Option<ParsedValue> {
    let mut text = text.replace(',', "");
    let mut currency = None;

    for code in CURRENCY_CODES {
        let upper = text.to_ascii_uppercase();
        if upper.contains(code) {
            currency = Some((*code).to_owned());
            text = upper.replace(code, "");
            break;
        }
    }

    let text = text.trim();
    let (symbol_currency, text) = match text.chars().next() {
        Some('$') => (Some("USD"), &text[1..]),
        Some('\u{20ac}') => (Some("EUR"), &text['\u{20ac}'.len_utf8()..]),
        Some('\u{a3}') => (Some("GBP"), &text['\u{a3}'.len_utf8()..]),
        _ => (None, text),
    };
    let currency = currency
        .or_else(|| symbol_currency.map(str::to_owned))
        .unwrap_or_else(|| "USD".to_owned());

    let text = text.trim();
    let (digits, scale) = match text.chars().last() {
        Some(suffix @ ('T' | 'B' | 'M' | 'K' | 't' | 'b' | 'm' | 'k')) => (
            &text[..text.len() - 1],
            Scale::from_suffix(&suffix.to_string()),
        ),
        _ => (text, Scale::Units),
    };

    Some(ParsedValue {
        value: parse_number(digits.trim())?,
        currency: Some(currency),
        scale,
    })
}

fn parse_percent(text: &str) -> Option<f64> {
    // "1.32 (3.95%)": the yield is the last parenthesised percentage.
    if let Some(close) = text.rfind("%)") {
        if let Some(open) = text[..close].rfind('(') {
            return parse_number(text[open + 1..close].trim());
        }
    }
    let text = text.replace(',', "");
    parse_number(text.trim().trim_end_matches('%').trim())
}

/// Strict decimal parse: optional sign, digits, at most one point.
pub fn parse_number(text: &str) -> Option<f64> {
    let unsigned = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    let valid = !unsigned.is_empty()
        && unsigned.chars().any(|c| c.is_ascii_digit())
        && unsigned.chars().all(|c| c.is_ascii_digit() || c == '.')
        && unsigned.matches('.').count() <= 1;
    if !valid {
        return None;
    }
    text.parse::<f64>().ok().filter(|value| value.is_finite())
}
