//! Text conversion for parameters and fields.
//!
//! The core speaks the text format only: every bound parameter goes through
//! [`ToText`] and every field read goes through [`FromText`]. Implement the
//! two traits to plug in additional value types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Render a value as PostgreSQL text. `None` means SQL NULL.
pub trait ToText {
    fn to_text(&self) -> Option<String>;
}

/// Parse a value from PostgreSQL text.
pub trait FromText: Sized {
    fn from_text(text: &str) -> Result<Self>;

    /// Value to use for SQL NULL; `None` makes NULL a conversion error.
    fn from_null() -> Option<Self> {
        None
    }
}

fn mismatch<T>(text: &str, target: &str) -> Result<T> {
    Err(Error::conversion(format!(
        "could not convert '{}' to {}",
        text, target
    )))
}

impl<T: ToText + ?Sized> ToText for &T {
    fn to_text(&self) -> Option<String> {
        (**self).to_text()
    }
}

impl<T: ToText> ToText for Option<T> {
    fn to_text(&self) -> Option<String> {
        self.as_ref().and_then(ToText::to_text)
    }
}

impl<T: FromText> FromText for Option<T> {
    fn from_text(text: &str) -> Result<Self> {
        T::from_text(text).map(Some)
    }

    fn from_null() -> Option<Self> {
        Some(None)
    }
}

impl ToText for str {
    fn to_text(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl ToText for String {
    fn to_text(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl FromText for String {
    fn from_text(text: &str) -> Result<Self> {
        Ok(text.to_string())
    }
}

impl ToText for bool {
    fn to_text(&self) -> Option<String> {
        Some(if *self { "t" } else { "f" }.to_string())
    }
}

impl FromText for bool {
    fn from_text(text: &str) -> Result<Self> {
        match text {
            "t" | "true" | "TRUE" | "1" => Ok(true),
            "f" | "false" | "FALSE" | "0" => Ok(false),
            _ => mismatch(text, "bool"),
        }
    }
}

macro_rules! numeric_text {
    ($($ty:ty),*) => {
        $(
            impl ToText for $ty {
                fn to_text(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }

            impl FromText for $ty {
                fn from_text(text: &str) -> Result<Self> {
                    text.trim()
                        .parse::<$ty>()
                        .or_else(|_| mismatch(text, stringify!($ty)))
                }
            }
        )*
    };
}

numeric_text!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

macro_rules! float_text {
    ($($ty:ty),*) => {
        $(
            impl ToText for $ty {
                fn to_text(&self) -> Option<String> {
                    Some(if self.is_nan() {
                        "NaN".to_string()
                    } else if self.is_infinite() {
                        if *self > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
                    } else {
                        self.to_string()
                    })
                }
            }

            impl FromText for $ty {
                fn from_text(text: &str) -> Result<Self> {
                    match text {
                        "NaN" => Ok(<$ty>::NAN),
                        "Infinity" => Ok(<$ty>::INFINITY),
                        "-Infinity" => Ok(<$ty>::NEG_INFINITY),
                        _ => text
                            .trim()
                            .parse::<$ty>()
                            .or_else(|_| mismatch(text, stringify!($ty))),
                    }
                }
            }
        )*
    };
}

float_text!(f32, f64);

/// `bytea` in hex output format (`\x0102ff`).
impl ToText for [u8] {
    fn to_text(&self) -> Option<String> {
        let mut out = String::with_capacity(2 + self.len() * 2);
        out.push_str("\\x");
        for byte in self {
            out.push_str(&format!("{:02x}", byte));
        }
        Some(out)
    }
}

impl ToText for Vec<u8> {
    fn to_text(&self) -> Option<String> {
        self.as_slice().to_text()
    }
}

impl FromText for Vec<u8> {
    fn from_text(text: &str) -> Result<Self> {
        let hex = match text.strip_prefix("\\x") {
            Some(hex) => hex,
            None => return mismatch(text, "bytea (hex format)"),
        };
        if hex.len() % 2 != 0 {
            return mismatch(text, "bytea (hex format)");
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .or_else(|_| mismatch(text, "bytea (hex format)"))
    }
}

impl ToText for Uuid {
    fn to_text(&self) -> Option<String> {
        Some(self.hyphenated().to_string())
    }
}

impl FromText for Uuid {
    fn from_text(text: &str) -> Result<Self> {
        Uuid::parse_str(text).or_else(|_| mismatch(text, "uuid"))
    }
}

impl ToText for NaiveDate {
    fn to_text(&self) -> Option<String> {
        Some(self.format("%Y-%m-%d").to_string())
    }
}

impl FromText for NaiveDate {
    fn from_text(text: &str) -> Result<Self> {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").or_else(|_| mismatch(text, "date"))
    }
}

impl ToText for NaiveTime {
    fn to_text(&self) -> Option<String> {
        Some(self.format("%H:%M:%S%.f").to_string())
    }
}

impl FromText for NaiveTime {
    fn from_text(text: &str) -> Result<Self> {
        NaiveTime::parse_from_str(text, "%H:%M:%S%.f").or_else(|_| mismatch(text, "time"))
    }
}

impl ToText for NaiveDateTime {
    fn to_text(&self) -> Option<String> {
        Some(self.format("%Y-%m-%d %H:%M:%S%.f").to_string())
    }
}

impl FromText for NaiveDateTime {
    fn from_text(text: &str) -> Result<Self> {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| mismatch(text, "timestamp"))
    }
}

impl ToText for DateTime<Utc> {
    fn to_text(&self) -> Option<String> {
        Some(self.format("%Y-%m-%d %H:%M:%S%.f+00").to_string())
    }
}

impl FromText for DateTime<Utc> {
    fn from_text(text: &str) -> Result<Self> {
        // The server abbreviates the offset to "+00" or "+05:30"
        let padded = match text.rfind(['+', '-']) {
            Some(pos) if pos > 10 && text.len() - pos == 3 => format!("{}:00", text),
            _ => text.to_string(),
        };
        DateTime::parse_from_str(&padded, "%Y-%m-%d %H:%M:%S%.f%:z")
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| mismatch(text, "timestamptz"))
    }
}

impl ToText for serde_json::Value {
    fn to_text(&self) -> Option<String> {
        if self.is_null() {
            return None;
        }
        Some(self.to_string())
    }
}

impl FromText for serde_json::Value {
    fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).or_else(|_| mismatch(text, "json"))
    }
}

/// Quote a string as an SQL literal (the `E''` form when it has backslashes).
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    if value.contains('\\') {
        out.push_str(" E'");
    } else {
        out.push('\'');
    }
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quote an identifier so it survives any case or reserved word.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render an optional text value as a literal or `NULL`.
pub(crate) fn literal_or_null(value: Option<&str>) -> String {
    match value {
        Some(text) => quote_literal(text),
        None => "NULL".to_string(),
    }
}
