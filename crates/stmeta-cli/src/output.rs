//! Text rendering for header and metadata output.

use std::io;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use stmeta_core::TensorDescriptor;

/// Expand string values that hold JSON documents, recursing into objects.
///
/// Training tools commonly store nested JSON as escaped strings inside
/// `__metadata__`; this turns `"{\"a\": 1}"` back into `{"a": 1}`.
pub fn parse_more(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    for item in map.values_mut() {
        if let Value::String(text) = item {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                *item = parsed;
            }
        }
        if item.is_object() {
            parse_more(item);
        }
    }
}

/// Indented JSON with caller-chosen item and key separators.
///
/// Items are followed by `item_separator` and a newline, keys by
/// `key_separator`. Empty arrays and objects stay on one line.
#[derive(Debug, Clone, Copy)]
pub struct IndentFormatter<'a> {
    indent: &'a [u8],
    item_separator: &'a [u8],
    key_separator: &'a [u8],
    level: usize,
    has_value: bool,
}

impl<'a> IndentFormatter<'a> {
    /// Formatter with the given indent unit and separators.
    pub fn new(indent: &'a [u8], item_separator: &'a [u8], key_separator: &'a [u8]) -> Self {
        Self {
            indent,
            item_separator,
            key_separator,
            level: 0,
            has_value: false,
        }
    }

    /// One-space indent, `"key":value`, used by `metadata`.
    pub fn metadata() -> IndentFormatter<'static> {
        IndentFormatter::new(b" ", b",", b":")
    }

    /// Four-space indent, `"key": value, `, used by `get`.
    pub fn item() -> IndentFormatter<'static> {
        IndentFormatter::new(b"    ", b", ", b": ")
    }

    fn write_indent<W: ?Sized + io::Write>(&self, writer: &mut W) -> io::Result<()> {
        for _ in 0..self.level {
            writer.write_all(self.indent)?;
        }
        Ok(())
    }

    fn open<W: ?Sized + io::Write>(&mut self, writer: &mut W, bracket: &[u8]) -> io::Result<()> {
        self.level += 1;
        self.has_value = false;
        writer.write_all(bracket)
    }

    fn close<W: ?Sized + io::Write>(&mut self, writer: &mut W, bracket: &[u8]) -> io::Result<()> {
        self.level -= 1;
        if self.has_value {
            writer.write_all(b"\n")?;
            self.write_indent(writer)?;
        }
        writer.write_all(bracket)
    }

    fn next_entry<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if !first {
            writer.write_all(self.item_separator)?;
        }
        writer.write_all(b"\n")?;
        self.write_indent(writer)
    }
}

impl Formatter for IndentFormatter<'_> {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.open(writer, b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"]")
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.next_entry(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.open(writer, b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.next_entry(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.key_separator)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }
}

/// Serialize `value` through `formatter`.
pub fn render(value: &Value, formatter: IndentFormatter<'_>) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    // serde_json only ever emits UTF-8.
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// One compact `"key": value` line per header entry, wrapped in braces.
pub fn header_lines(entries: &IndexMap<String, Value>) -> serde_json::Result<String> {
    let lines = entries
        .iter()
        .map(|(key, value)| {
            Ok(format!(
                "{}: {}",
                serde_json::to_string(key)?,
                serde_json::to_string(value)?
            ))
        })
        .collect::<serde_json::Result<Vec<_>>>()?;
    Ok(format!("{{\n{}\n}}", lines.join(",\n")))
}

/// `name  dtype  [shape]  [start, end)` for `listkeys`.
pub fn describe_tensor(tensor: &TensorDescriptor) -> String {
    let shape: Vec<String> = tensor.shape.iter().map(u64::to_string).collect();
    format!(
        "{}\t{}\t[{}]\t[{}, {})",
        tensor.name,
        tensor.dtype,
        shape.join(", "),
        tensor.offset_start,
        tensor.offset_end
    )
}
