use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::encoding::{self, LegacyEncoding};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    #[default]
    Auto,
    Sql,
    Csv,
}

impl FromStr for DumpFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DumpFormat::Auto),
            "sql" => Ok(DumpFormat::Sql),
            "csv" | "delimited" => Ok(DumpFormat::Csv),
            other => Err(format!("unknown dump format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: Option<String>,
    /// 1-based line where the row (or its statement) starts.
    pub line: usize,
    pub fields: BTreeMap<String, String>,
}

impl Row {
    /// Non-empty, trimmed value of `column`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// First non-empty value among several column aliases.
    pub fn get_any(&self, aliases: &[&str]) -> Option<&str> {
        aliases.iter().find_map(|alias| self.get(alias))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    pub rows: Vec<Row>,
    pub skipped: Vec<SkippedRow>,
    pub columns: BTreeSet<String>,
    pub encoding: Option<&'static str>,
    pub suspicious_chars: usize,
}

impl ParseReport {
    fn skip(&mut self, line: usize, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(line, reason = %reason, "skipping legacy row");
        self.skipped.push(SkippedRow { line, reason });
    }

    fn accept(&mut self, row: Row, key_columns: &[String]) {
        if !key_columns.is_empty() && !key_columns.iter().any(|k| row.get(k).is_some()) {
            self.skip(
                row.line,
                format!("missing key column ({})", key_columns.join(" | ")),
            );
            return;
        }
        self.columns.extend(row.fields.keys().cloned());
        self.rows.push(row);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub format: DumpFormat,
    pub encoding: LegacyEncoding,
    pub strict_encoding: bool,
    /// Rows without a value in any of these columns are dropped.
    pub key_columns: Vec<String>,
}

pub fn parse_file(path: &Path, options: &ParseOptions) -> Result<ParseReport> {
    let bytes = std::fs::read(path)?;
    let decoded = encoding::decode(&bytes, options.encoding);

    if decoded.suspicious > 0 {
        error!(
            path = %path.display(),
            encoding = decoded.encoding.name(),
            hits = decoded.suspicious,
            "decoded text contains garbled accented characters; the source encoding is probably wrong"
        );
        if options.strict_encoding {
            return Err(Error::Encoding {
                path: path.display().to_string(),
                encoding: decoded.encoding.name(),
                hits: decoded.suspicious,
            });
        }
    }

    let mut report = parse_text(&decoded.text, options.format, &options.key_columns);
    report.encoding = Some(decoded.encoding.name());
    report.suspicious_chars = decoded.suspicious;
    debug!(
        path = %path.display(),
        rows = report.rows.len(),
        skipped = report.skipped.len(),
        "parsed legacy dump"
    );
    Ok(report)
}

pub fn parse_text(text: &str, format: DumpFormat, key_columns: &[String]) -> ParseReport {
    let format = match format {
        DumpFormat::Auto => detect_format(text),
        other => other,
    };
    match format {
        DumpFormat::Sql => parse_sql(text, key_columns),
        _ => parse_delimited(text, key_columns),
    }
}

pub fn detect_format(text: &str) -> DumpFormat {
    if text.to_ascii_uppercase().contains("INSERT INTO") {
        DumpFormat::Sql
    } else {
        DumpFormat::Csv
    }
}

// ---------------------------------------------------------------------------
// SQL dumps
// ---------------------------------------------------------------------------

struct Statement<'a> {
    line: usize,
    text: &'a str,
}

/// Split on `;` outside single-quoted literals. Quotes inside a literal are
/// doubled; a backslash is an ordinary character.
fn split_statements(text: &str) -> Vec<Statement<'_>> {
    let mut out = Vec::new();
    let mut in_quote = false;
    let mut start = 0usize;
    let mut line = 1usize;
    let mut start_line = 1usize;
    let mut at_start = true;

    for (i, c) in text.char_indices() {
        if at_start && !c.is_whitespace() {
            start_line = line;
            at_start = false;
        }
        if c == '\n' {
            line += 1;
        }
        match c {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                let stmt = text[start..i].trim();
                if !stmt.is_empty() {
                    out.push(Statement {
                        line: start_line,
                        text: stmt,
                    });
                }
                start = i + 1;
                at_start = true;
            }
            _ => {}
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(Statement {
            line: start_line,
            text: tail,
        });
    }
    out
}

/// Returns the contents of the parenthesised group at the start of `s` and
/// the remainder after the closing parenthesis.
fn take_group(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if !s.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[1..i], &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are outside quotes and nested parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            ',' if !in_quote && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn clean_identifier(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '[' || c == ']')
        .trim()
        .to_uppercase()
}

fn clean_value(raw: &str) -> String {
    let v = raw.trim();
    if v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'') {
        let inner = &v[1..v.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    out.push('\'');
                }
                other => out.push(other),
            }
        }
        return out.trim().to_string();
    }
    if v.eq_ignore_ascii_case("NULL") {
        return String::new();
    }
    v.to_string()
}

/// Strip a leading keyword that must be followed by whitespace, `(` or the
/// end of input.
fn strip_word<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = strip_keyword(s, keyword)?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() || c == '(' => Some(rest),
        Some(_) => None,
    }
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(&s[keyword.len()..])
    } else {
        None
    }
}

fn parse_sql(text: &str, key_columns: &[String]) -> ParseReport {
    let mut report = ParseReport::default();
    let mut table_columns: HashMap<String, Vec<String>> = HashMap::new();

    for stmt in split_statements(text) {
        let Some(after_insert) = strip_word(stmt.text, "INSERT") else {
            debug!(line = stmt.line, "ignoring non-INSERT statement");
            continue;
        };
        let Some(rest) = strip_word(after_insert, "INTO") else {
            report.skip(stmt.line, "INSERT statement without INTO");
            continue;
        };

        let rest = rest.trim_start();
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '(')
            .unwrap_or(rest.len());
        let table = clean_identifier(&rest[..name_end]);
        let mut rest = &rest[name_end..];

        if let Some((cols, after)) = take_group(rest) {
            let cols: Vec<String> = split_top_level(cols)
                .into_iter()
                .map(clean_identifier)
                .collect();
            table_columns.insert(table.clone(), cols);
            rest = after;
        }

        let Some(columns) = table_columns.get(&table) else {
            report.skip(stmt.line, format!("no column list known for table {table}"));
            continue;
        };

        let Some(mut values_part) = strip_keyword(rest, "VALUES") else {
            report.skip(stmt.line, "missing VALUES clause");
            continue;
        };

        let mut tuples = Vec::new();
        loop {
            let Some((vals, after)) = take_group(values_part) else {
                break;
            };
            tuples.push(vals);
            let after = after.trim_start();
            match after.strip_prefix(',') {
                Some(next) => values_part = next,
                None => break,
            }
        }

        if tuples.is_empty() {
            report.skip(stmt.line, "unterminated or empty VALUES tuple");
            continue;
        }

        for vals in tuples {
            let values: Vec<String> = split_top_level(vals).into_iter().map(clean_value).collect();
            if values.len() != columns.len() {
                report.skip(
                    stmt.line,
                    format!(
                        "{table}: {} values for {} columns",
                        values.len(),
                        columns.len()
                    ),
                );
                continue;
            }
            let fields = columns.iter().cloned().zip(values).collect();
            report.accept(
                Row {
                    table: Some(table.clone()),
                    line: stmt.line,
                    fields,
                },
                key_columns,
            );
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Delimited text
// ---------------------------------------------------------------------------

fn detect_delimiter(header: &str) -> u8 {
    [b';', b'\t', b',']
        .into_iter()
        .max_by_key(|d| header.bytes().filter(|b| b == d).count())
        .filter(|d| header.bytes().any(|b| b == *d))
        .unwrap_or(b';')
}

fn parse_delimited(text: &str, key_columns: &[String]) -> ParseReport {
    let mut report = ParseReport::default();
    let header_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let delimiter = detect_delimiter(header_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(clean_identifier).collect(),
        Err(e) => {
            report.skip(1, format!("unreadable header: {e}"));
            return report;
        }
    };

    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                let line = e.position().map(|p| p.line() as usize).unwrap_or(0);
                report.skip(line, format!("unreadable record: {e}"));
                continue;
            }
        };
        let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        if record.len() != headers.len() {
            report.skip(
                line,
                format!("{} fields for {} columns", record.len(), headers.len()),
            );
            continue;
        }
        let fields = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|f| f.to_string()))
            .collect();
        report.accept(
            Row {
                table: None,
                line,
                fields,
            },
            key_columns,
        );
    }

    report
}
