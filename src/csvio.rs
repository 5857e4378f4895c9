//! Upload decoding and structural CSV validation (import step 1).
//!
//! Step 1 only checks that the file is well-formed tabular text: decodable,
//! header row present, consistent column counts. Field-level validation
//! happens after a column mapping exists. Every data line is checked
//! independently so the caller can fix a whole batch at once; only
//! unrecoverable input (undecodable bytes, empty file, row-count blowout)
//! fails the call outright.

use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::session::{Issue, RawRow};

#[derive(Debug, Clone)]
pub struct ParsedUpload {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub issues: Vec<Issue>,
}

/// Decodes upload bytes to text. UTF-8 (with or without BOM) is tried
/// first; Latin-1 is the fallback for the spreadsheet exports that still
/// use it. A hint from the transport pins the decoder instead.
pub fn decode(bytes: &[u8], encoding_hint: Option<&str>) -> Result<String, ImportError> {
    if bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF]) {
        return Err(ImportError::parse("UTF-16 input is not supported"));
    }
    if bytes.contains(&0) {
        return Err(ImportError::parse("binary content in upload"));
    }
    match encoding_hint {
        None => Ok(match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => latin1_to_string(bytes),
        }),
        Some("utf-8") => std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ImportError::parse("upload is not valid UTF-8")),
        Some("latin-1") => Ok(latin1_to_string(bytes)),
        Some(other) => Err(ImportError::parse(format!(
            "unsupported encoding hint '{other}'"
        ))),
    }
}

fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn parse(text: &str, limits: &ImportConfig) -> Result<ParsedUpload, ImportError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    // Keep true source line numbers; blank lines are skipped but counted.
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.trim().is_empty());

    let Some((header_line_no, header_line)) = lines.next() else {
        return Err(ImportError::parse("file is empty"));
    };

    let delimiter = detect_delimiter(header_line);
    let headers: Vec<String> = split_record(header_line, delimiter)
        .into_iter()
        .map(|c| c.trim().to_string())
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(ImportError::parse("header row is empty"));
    }

    let mut issues = Vec::new();
    for (i, name) in headers.iter().enumerate() {
        if name.is_empty() {
            issues.push(Issue::line(
                header_line_no,
                format!("column {} has an empty header", i + 1),
            ));
        } else if headers[..i].iter().any(|h| h.eq_ignore_ascii_case(name)) {
            issues.push(Issue::line(
                header_line_no,
                format!("duplicate column header '{name}'"),
            ));
        }
    }

    let mut rows = Vec::new();
    let mut data_lines = 0usize;
    for (line_no, line) in lines {
        data_lines += 1;
        if data_lines > limits.max_rows {
            return Err(ImportError::parse(format!(
                "file has more than {} data rows",
                limits.max_rows
            )));
        }
        let cells: Vec<String> = split_record(line, delimiter)
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();
        if cells.len() != headers.len() {
            issues.push(Issue::line(
                line_no,
                format!(
                    "expected {} columns, found {}",
                    headers.len(),
                    cells.len()
                ),
            ));
            continue;
        }
        rows.push(RawRow {
            line: line_no,
            cells,
        });
    }

    if data_lines == 0 {
        return Err(ImportError::parse(
            "file must contain a header row and at least one data row",
        ));
    }

    Ok(ParsedUpload {
        headers,
        rows,
        issues,
    })
}

/// Comma unless the header line clearly uses semicolons, which Brazilian
/// and European spreadsheet exports commonly do.
fn detect_delimiter(header_line: &str) -> char {
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons > commas {
        ';'
    } else {
        ','
    }
}

/// Splits one record on `delimiter`, honoring double quotes and `""`
/// escapes inside quoted fields.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                buf.push('"');
                chars.next();
            } else {
                in_quotes = !in_quotes;
            }
        } else if ch == delimiter && !in_quotes {
            fields.push(std::mem::take(&mut buf));
        } else {
            buf.push(ch);
        }
    }
    fields.push(buf);
    fields
}
