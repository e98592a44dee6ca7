//! Text store for durable field values
//!
//! One line per field: `<id>=<TYPE> <v>,<v>;<TYPE> <v>` with one `;`
//! separated segment per group index. An empty segment is a missing value.
//! Bytes are written as hex, strings in double quotes with `"` and `\`
//! escaped by a backslash, a missing string as `null`.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use log::{debug, info};

use crate::error::{ModbusError, ModbusResult};
use crate::field::{DataType, Field, FieldValue, FieldValues};

/// Split at `separator` outside of double quotes
fn split_unquoted(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == separator && !in_quotes => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn join<T: ToString>(values: &[T]) -> String {
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn unquote(s: &str) -> ModbusResult<String> {
    let inner = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .filter(|_| s.len() >= 2)
        .ok_or_else(|| ModbusError::store(format!("Unquoted string: {}", s)))?;
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                result.push(next);
            }
        } else {
            result.push(c);
        }
    }
    Ok(result)
}

fn parse_all<T: FromStr>(elements: &[&str], data_type: DataType) -> ModbusResult<Vec<T>> {
    elements
        .iter()
        .map(|e| {
            e.trim()
                .parse::<T>()
                .map_err(|_| ModbusError::store(format!("Invalid {} value: {}", data_type, e)))
        })
        .collect()
}

fn parse_bool(s: &str) -> ModbusResult<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ModbusError::store(format!("Invalid BOOLEAN value: {}", other))),
    }
}

fn parse_hex(s: &str) -> ModbusResult<Vec<u8>> {
    let mut s = s.trim().to_string();
    if s.len() % 2 == 1 {
        s.push('0');
    }
    hex::decode(&s).map_err(|e| ModbusError::store(format!("Invalid BYTE value {}: {}", s, e)))
}

/// Serialize the values of one field, one segment per group index
pub fn serialize(values: &[Option<FieldValue>]) -> String {
    values
        .iter()
        .map(|value| match value {
            None => String::new(),
            Some(value) => {
                let elements = match value {
                    FieldValue::Boolean(v) => join(v),
                    FieldValue::Byte(v) => hex::encode_upper(v),
                    FieldValue::Short(v) => join(v),
                    FieldValue::UShort(v) => join(v),
                    FieldValue::Float(v) => join(v),
                    FieldValue::String(v) => v
                        .iter()
                        .map(|s| s.as_deref().map_or_else(|| "null".to_string(), quote))
                        .collect::<Vec<_>>()
                        .join(","),
                };
                format!("{} {}", value.data_type(), elements)
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse the values of one field
pub fn deserialize(s: &str) -> ModbusResult<Vec<Option<FieldValue>>> {
    split_unquoted(s.trim(), ';')
        .into_iter()
        .map(|segment| {
            if segment.is_empty() {
                return Ok(None);
            }
            let (type_name, rest) = segment.split_once(' ').unwrap_or((segment, ""));
            let data_type: DataType = type_name.parse()?;
            if rest.is_empty() {
                return Ok(Some(FieldValue::empty(data_type)));
            }
            let elements = split_unquoted(rest, ',');
            let value = match data_type {
                DataType::Boolean => {
                    FieldValue::Boolean(elements.iter().map(|e| parse_bool(e)).collect::<ModbusResult<_>>()?)
                }
                DataType::Byte => FieldValue::Byte(parse_hex(rest)?),
                DataType::Short => FieldValue::Short(parse_all(&elements, data_type)?),
                DataType::UShort => FieldValue::UShort(parse_all(&elements, data_type)?),
                DataType::Float => FieldValue::Float(parse_all(&elements, data_type)?),
                DataType::String => FieldValue::String(
                    elements
                        .iter()
                        .map(|e| if *e == "null" { Ok(None) } else { unquote(e).map(Some) })
                        .collect::<ModbusResult<_>>()?,
                ),
            };
            Ok(Some(value))
        })
        .collect()
}

/// Load field values from a file
pub fn read(path: &Path) -> ModbusResult<FieldValues> {
    let content = fs::read_to_string(path)
        .map_err(|e| ModbusError::store(format!("Cannot read file {}: {}", path.display(), e)))?;
    let mut values = FieldValues::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ModbusError::store(format!("{}:{}: missing '='", path.display(), n + 1)))?;
        let id: u16 = key
            .trim()
            .parse()
            .map_err(|_| ModbusError::store(format!("{}:{}: invalid field id '{}'", path.display(), n + 1, key)))?;
        let field_values = deserialize(value)
            .map_err(|e| ModbusError::store(format!("{}:{}: {}", path.display(), n + 1, e)))?;
        values.insert(Field::new(id), field_values);
    }
    debug!("Read {} fields from {}", values.len(), path.display());
    Ok(values)
}

/// Store field values, replacing the file
pub fn write(values: &FieldValues, path: &Path) -> ModbusResult<()> {
    let mut content = format!("#Field values\n#{}\n", Utc::now().to_rfc2822());
    for (field, field_values) in values {
        content.push_str(&format!("{}={}\n", field.id(), serialize(field_values)));
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| ModbusError::store(format!("Cannot write file {}: {}", path.display(), e)))?;
    info!("Wrote {} fields to {}", values.len(), path.display());
    Ok(())
}
