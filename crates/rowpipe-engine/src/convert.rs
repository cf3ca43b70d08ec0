//! Text → typed value conversion driven by a [`FieldDescriptor`].
//!
//! Order of operations: trim, null-if, if-null, then type conversion using
//! the descriptor's mask and symbols. Empty text converts to null.

use chrono::{NaiveDate, NaiveDateTime};
use rowpipe_types::error::TransformError;
use rowpipe_types::schema::{FieldDescriptor, ValueType};
use rowpipe_types::value::Value;

/// Formats tried, in order, when a date field has no mask.
const DEFAULT_DATETIME_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y%m%d%H%M%S%.fZ",
    "%Y%m%d%H%M%SZ",
];
const DEFAULT_DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%Y-%m-%d", "%Y%m%d"];

/// Convert raw text into a value of the descriptor's type.
///
/// # Errors
///
/// `CONVERSION` data error, tagged with the field name, when the text does
/// not parse as the target type.
pub fn convert_text(
    desc: &FieldDescriptor,
    raw: Option<&str>,
    null_if: Option<&str>,
    if_null: Option<&str>,
) -> Result<Value, TransformError> {
    let mut text = raw.map(|r| desc.trim.apply(r));
    if let (Some(t), Some(n)) = (text, null_if) {
        if !n.is_empty() && t == n {
            text = None;
        }
    }
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => match if_null.filter(|d| !d.is_empty()) {
            Some(default) => default,
            None => return Ok(Value::Null),
        },
    };

    let converted = match desc.value_type {
        ValueType::String => Some(Value::String(text.to_string())),
        ValueType::Integer => parse_integer(desc, text).map(Value::Integer),
        ValueType::Number => parse_number(desc, text).map(Value::Number),
        ValueType::Boolean => parse_boolean(text).map(Value::Boolean),
        ValueType::Date => parse_date(desc.format.as_deref(), text).map(Value::Date),
    };
    converted.ok_or_else(|| {
        TransformError::data(
            "CONVERSION",
            format!(
                "cannot convert '{text}' to {} for field '{}'",
                desc.value_type, desc.name
            ),
        )
        .with_field(desc.name.clone())
    })
}

/// Strip grouping and currency symbols and normalize the decimal symbol.
fn normalize_numeric(desc: &FieldDescriptor, text: &str) -> String {
    let decimal = desc.decimal_symbol.as_deref().filter(|s| !s.is_empty());
    let grouping = desc.grouping_symbol.as_deref().filter(|s| !s.is_empty());
    let mut s = text.trim().to_string();
    if let Some(currency) = desc.currency_symbol.as_deref().filter(|c| !c.is_empty()) {
        s = s.replace(currency, "");
    }
    if let Some(group) = grouping.filter(|g| Some(*g) != decimal) {
        s = s.replace(group, "");
    }
    if let Some(dec) = decimal.filter(|d| *d != ".") {
        s = s.replace(dec, ".");
    }
    s.retain(|c| !c.is_whitespace());
    s
}

fn parse_integer(desc: &FieldDescriptor, text: &str) -> Option<i64> {
    let s = normalize_numeric(desc, text);
    let s = s.strip_prefix('+').unwrap_or(&s);
    s.parse().ok()
}

fn parse_number(desc: &FieldDescriptor, text: &str) -> Option<f64> {
    let s = normalize_numeric(desc, text);
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_boolean(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(mask: Option<&str>, text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    match mask.filter(|m| !m.is_empty()) {
        Some(mask) => parse_with(&java_to_strftime(mask), text),
        None => DEFAULT_DATETIME_FORMATS
            .iter()
            .chain(DEFAULT_DATE_FORMATS)
            .find_map(|fmt| parse_with(fmt, text)),
    }
}

fn parse_with(fmt: &str, text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, fmt).ok().or_else(|| {
        NaiveDate::parse_from_str(text, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

/// Translate a `yyyy/MM/dd HH:mm:ss`-style mask into a chrono format string.
///
/// Text in single quotes is literal; `''` is a quote.
#[must_use]
pub fn java_to_strftime(mask: &str) -> String {
    let chars: Vec<char> = mask.chars().collect();
    let mut out = String::with_capacity(mask.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                push_literal(&mut out, chars[i]);
                i += 1;
            }
            i += 1;
            continue;
        }
        let run = chars[i..].iter().take_while(|&&x| x == c).count();
        let token = match (c, run) {
            ('y', 2) => Some("%y"),
            ('y', _) => Some("%Y"),
            ('M', 1 | 2) => Some("%m"),
            ('M', 3) => Some("%b"),
            ('M', _) => Some("%B"),
            ('d', _) => Some("%d"),
            ('H', _) => Some("%H"),
            ('h', _) => Some("%I"),
            ('m', _) => Some("%M"),
            ('s', _) => Some("%S"),
            ('S', _) => Some("%3f"),
            ('a', _) => Some("%p"),
            ('E', 1..=3) => Some("%a"),
            ('E', _) => Some("%A"),
            ('Z' | 'z' | 'X', _) => Some("%z"),
            _ => None,
        };
        match token {
            Some(t) => out.push_str(t),
            None => (0..run).for_each(|_| push_literal(&mut out, c)),
        }
        i += run;
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_types::schema::TrimType;
    use rstest::rstest;

    fn field(value_type: ValueType) -> FieldDescriptor {
        FieldDescriptor::new("f", value_type, "test")
    }

    fn date(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> Value {
        Value::Date(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, s)
                .unwrap(),
        )
    }

    #[rstest]
    #[case("yyyy/MM/dd HH:mm:ss", "%Y/%m/%d %H:%M:%S")]
    #[case("dd-MMM-yy", "%d-%b-%y")]
    #[case("yyyyMMddHHmmss'Z'", "%Y%m%d%H%M%SZ")]
    #[case("hh:mm a", "%I:%M %p")]
    #[case("yyyy-MM-dd'T'HH:mm:ss.SSS", "%Y-%m-%dT%H:%M:%S.%3f")]
    #[case("'100%' yyyy", "100%% %Y")]
    #[case("EEE, d MMMM yyyy", "%a, %d %B %Y")]
    fn mask_translation(#[case] mask: &str, #[case] expected: &str) {
        assert_eq!(java_to_strftime(mask), expected);
    }

    #[test]
    fn string_is_trimmed_per_descriptor() {
        let mut desc = field(ValueType::String);
        desc.trim = TrimType::Both;
        assert_eq!(
            convert_text(&desc, Some("  abc "), None, None).unwrap(),
            Value::from("abc")
        );
        desc.trim = TrimType::Left;
        assert_eq!(
            convert_text(&desc, Some("  abc "), None, None).unwrap(),
            Value::from("abc ")
        );
    }

    #[test]
    fn null_if_and_if_null() {
        let desc = field(ValueType::Integer);
        assert_eq!(convert_text(&desc, Some("-"), Some("-"), None).unwrap(), Value::Null);
        assert_eq!(
            convert_text(&desc, Some("-"), Some("-"), Some("0")).unwrap(),
            Value::Integer(0)
        );
        assert_eq!(convert_text(&desc, None, None, Some("7")).unwrap(), Value::Integer(7));
        assert_eq!(convert_text(&desc, Some(""), None, None).unwrap(), Value::Null);
    }

    #[test]
    fn integer_with_grouping_and_currency() {
        let mut desc = field(ValueType::Integer);
        desc.grouping_symbol = Some(",".into());
        desc.currency_symbol = Some("$".into());
        assert_eq!(
            convert_text(&desc, Some("$1,234,567"), None, None).unwrap(),
            Value::Integer(1_234_567)
        );
        assert_eq!(convert_text(&desc, Some("+42"), None, None).unwrap(), Value::Integer(42));
    }

    #[test]
    fn number_with_european_symbols() {
        let mut desc = field(ValueType::Number);
        desc.decimal_symbol = Some(",".into());
        desc.grouping_symbol = Some(".".into());
        assert_eq!(
            convert_text(&desc, Some("1.234,5"), None, None).unwrap(),
            Value::Number(1234.5)
        );
    }

    #[rstest]
    #[case("Y", true)]
    #[case("no", false)]
    #[case("TRUE", true)]
    #[case("0", false)]
    fn booleans(#[case] raw: &str, #[case] expected: bool) {
        assert_eq!(
            convert_text(&field(ValueType::Boolean), Some(raw), None, None).unwrap(),
            Value::Boolean(expected)
        );
    }

    #[test]
    fn date_with_mask() {
        let mut desc = field(ValueType::Date);
        desc.format = Some("dd.MM.yyyy HH:mm".into());
        assert_eq!(
            convert_text(&desc, Some("03.02.2024 17:45"), None, None).unwrap(),
            date(2024, 2, 3, 17, 45, 0)
        );
        desc.format = Some("yyyy-MM-dd".into());
        assert_eq!(
            convert_text(&desc, Some("2024-02-03"), None, None).unwrap(),
            date(2024, 2, 3, 0, 0, 0)
        );
    }

    #[test]
    fn date_without_mask_accepts_generalized_time() {
        let desc = field(ValueType::Date);
        assert_eq!(
            convert_text(&desc, Some("20240203174500Z"), None, None).unwrap(),
            date(2024, 2, 3, 17, 45, 0)
        );
        assert_eq!(
            convert_text(&desc, Some("2024/02/03 17:45:00"), None, None).unwrap(),
            date(2024, 2, 3, 17, 45, 0)
        );
    }

    #[test]
    fn failure_is_tagged_data_error() {
        let err = convert_text(&field(ValueType::Integer), Some("12x"), None, None).unwrap_err();
        assert_eq!(err.code, "CONVERSION");
        assert!(!err.is_structural());
        assert_eq!(err.field.as_deref(), Some("f"));
        assert!(err.message.contains("'12x'"));
    }
}
