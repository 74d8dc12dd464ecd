//! Text extraction for embedding.

use crate::catalog::{Dataset, FieldKind, FieldSchema, Record};

/// Remove HTML tags, replacing each with a space, and collapse the spaces.
///
/// An unterminated `<` is kept verbatim along with everything after it.
pub fn strip_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push(' ');
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);

    collapse_spaces(&out)
}

fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for c in s.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(c);
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

/// Keep at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Text of one field, with markup stripped from editor fields.
pub fn field_text(record: &Record, field: &FieldSchema) -> String {
    let value = record.get_string(&field.name);
    if field.kind == FieldKind::Editor {
        strip_markup(&value)
    } else {
        value
    }
}

/// Render a whole record as a single text.
///
/// With a template, every `{fieldName}` placeholder is replaced by that
/// field's text. Without one, each non-empty textual field becomes a
/// `name: value` line, the value cut to `max_field_chars`.
pub fn record_text(
    record: &Record,
    dataset: &Dataset,
    template: Option<&str>,
    max_field_chars: usize,
) -> String {
    if let Some(template) = template.filter(|t| !t.is_empty()) {
        let rendered = dataset.fields.iter().fold(template.to_string(), |acc, field| {
            acc.replace(&format!("{{{}}}", field.name), &field_text(record, field))
        });
        return rendered.trim().to_string();
    }

    dataset
        .fields
        .iter()
        .filter(|field| field.kind.is_textual())
        .filter_map(|field| {
            let value = field_text(record, field);
            if value.is_empty() {
                None
            } else {
                Some(format!(
                    "{}: {}",
                    field.name,
                    truncate_chars(&value, max_field_chars)
                ))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
