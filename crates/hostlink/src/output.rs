use std::fmt::Write as _;
use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct Tagged<'a, T: Serialize> {
    schema_id: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

/// A command result: the full record for JSON, flattened rows for humans.
pub struct Report<'a, T: Serialize> {
    pub schema_id: &'a str,
    pub body: &'a T,
    pub rows: Vec<(String, String)>,
}

impl<T: Serialize> Report<'_, T> {
    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Json => {
                let tagged = Tagged {
                    schema_id: self.schema_id,
                    body: self.body,
                };
                println!(
                    "{}",
                    serde_json::to_string(&tagged).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["FIELD", "VALUE"]);
                for (field, value) in &self.rows {
                    table.add_row(vec![field.as_str(), value.as_str()]);
                }
                println!("{table}");
            }
            OutputFormat::Pretty => {
                for (field, value) in &self.rows {
                    println!("{field}={value}");
                }
            }
        }
    }
}

pub fn row(field: &str, value: impl ToString) -> (String, String) {
    (field.to_string(), value.to_string())
}

pub fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parse a hex dump. Whitespace, `:` separators and a leading `0x` are
/// ignored.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: Vec<u8> = trimmed
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();

    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = hex_value(pair[0])?;
            let lo = hex_value(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_value(digit: u8) -> Result<u8, String> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        other => Err(format!("invalid hex digit {:?}", char::from(other))),
    }
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parse_accepts_common_dump_styles() {
        assert_eq!(parse_hex("0x0a0B").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(parse_hex("de:ad be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn hex_parse_rejects_garbage() {
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00, 0x7f, 0x80, 0xff];
        assert_eq!(parse_hex(&hex_string(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn preview_flags_binary() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0, 1, 2]), "<binary 3 bytes>");
    }
}
