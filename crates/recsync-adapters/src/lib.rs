//! Export readers and the row normalizer that turns raw cells into canonical records.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use recsync_core::CanonicalRecord;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "recsync-adapters";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("matcher for `{field}` is not a valid pattern: {source}")]
    InvalidMatcher {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("no column matches identifier `{field}` (pattern `{pattern}`); headers were {headers:?}")]
    IdentifierColumnMissing {
        field: String,
        pattern: String,
        headers: Vec<String>,
    },
    #[error("delimiter {0:?} is not a single ASCII character")]
    InvalidDelimiter(char),
    #[error("header row {0} is past the end of the export")]
    HeaderRowMissing(usize),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    #[default]
    Text,
    /// Keep digits only; punctuation, spaces and country-code plus signs are dropped.
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierSpec {
    pub field: String,
    pub matcher: String,
    #[serde(default)]
    pub kind: IdentifierKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Case-insensitive pattern tried against normalized header names. Defaults to the field name.
    #[serde(default)]
    pub matcher: Option<String>,
    #[serde(default)]
    pub replace: Vec<Replacement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryRule {
    pub length: usize,
    #[serde(default)]
    pub prefix: Option<String>,
    pub country: String,
}

/// Derive a country label from the identifier's digit count and prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountrySpec {
    pub field: String,
    pub rules: Vec<CountryRule>,
    pub fallback: String,
}

impl CountrySpec {
    pub fn classify(&self, identifier: &str) -> String {
        self.rules
            .iter()
            .find(|rule| {
                identifier.chars().count() == rule.length
                    && rule
                        .prefix
                        .as_deref()
                        .map_or(true, |p| identifier.starts_with(p))
            })
            .map(|rule| rule.country.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvenanceSpec {
    /// Receives the export's file name.
    #[serde(default)]
    pub source_field: Option<String>,
    /// Receives the acting user label.
    #[serde(default)]
    pub actor_field: Option<String>,
}

fn default_header_row() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvLayout {
    /// 1-based row holding the column names; rows above it are ignored.
    #[serde(default = "default_header_row")]
    pub header_row: usize,
    #[serde(default)]
    pub skip_footer_rows: usize,
    #[serde(default = "default_true")]
    pub stop_at_blank_row: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl CsvLayout {
    pub fn delimiter_byte(&self) -> Result<u8, RecordError> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            Err(RecordError::InvalidDelimiter(self.delimiter))
        }
    }
}

impl Default for CsvLayout {
    fn default() -> Self {
        Self {
            header_row: default_header_row(),
            skip_footer_rows: 0,
            stop_at_blank_row: true,
            delimiter: default_delimiter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSpec {
    pub identifier: IdentifierSpec,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub country: Option<CountrySpec>,
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
    #[serde(default)]
    pub provenance: ProvenanceSpec,
    #[serde(default)]
    pub layout: CsvLayout,
}

impl IngestSpec {
    /// Every non-identifier column the normalizer can emit, in declaration order.
    pub fn content_fields(&self) -> Vec<String> {
        let mut out = self.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        if let Some(country) = &self.country {
            out.push(country.field.clone());
        }
        out.extend(self.constants.keys().cloned());
        out.extend(self.provenance.source_field.iter().cloned());
        out.extend(self.provenance.actor_field.iter().cloned());
        out
    }
}

/// Header row plus data rows as read from an export, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub source_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Anything that can hand over a header row and data rows.
pub trait RowSource {
    fn source_name(&self) -> &str;
    fn read_table(&self, layout: &CsvLayout) -> Result<RawTable, RecordError>;
}

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
    name: String,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> Result<Vec<u8>, RecordError> {
        fs::read(&self.path).map_err(|source| RecordError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl RowSource for CsvFileSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn read_table(&self, layout: &CsvLayout) -> Result<RawTable, RecordError> {
        let bytes = self.bytes()?;
        read_csv(&self.name, bytes.as_slice(), layout)
    }
}

/// CSV held in memory, used for piped input and tests.
#[derive(Debug, Clone)]
pub struct CsvTextSource {
    pub name: String,
    pub text: String,
}

impl RowSource for CsvTextSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn read_table(&self, layout: &CsvLayout) -> Result<RawTable, RecordError> {
        read_csv(&self.name, self.text.as_bytes(), layout)
    }
}

fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

pub fn read_csv(
    source_name: &str,
    reader: impl Read,
    layout: &CsvLayout,
) -> Result<RawTable, RecordError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(layout.delimiter_byte()?)
        .from_reader(reader);

    let mut all = Vec::new();
    for record in csv_reader.records() {
        all.push(record?.iter().map(ToString::to_string).collect::<Vec<_>>());
    }

    let header_index = layout.header_row.max(1) - 1;
    if header_index >= all.len() {
        return Err(RecordError::HeaderRowMissing(layout.header_row));
    }
    let mut rows = all.split_off(header_index + 1);
    let headers = all.pop().unwrap_or_default();

    let keep = rows.len().saturating_sub(layout.skip_footer_rows);
    rows.truncate(keep);
    if layout.stop_at_blank_row {
        if let Some(first_blank) = rows.iter().position(|r| is_blank_row(r)) {
            tracing::debug!(source = source_name, row = first_blank, "stopping at first blank row");
            rows.truncate(first_blank);
        }
    }

    Ok(RawTable {
        source_name: source_name.to_string(),
        headers,
        rows,
    })
}

/// `" Mobile Phone "` -> `"mobile_phone"`.
pub fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase().replace(' ', "_")
}

/// Digits only; `None` when nothing is left (blank cells, `nan`, stray punctuation).
pub fn phone_digits(raw: &str) -> Option<String> {
    let digits = raw.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn text_or_none(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn compile_matcher(field: &str, pattern: &str) -> Result<Regex, RecordError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| RecordError::InvalidMatcher {
            field: field.to_string(),
            source,
        })
}

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    matcher: Regex,
    replace: Vec<Replacement>,
}

/// Which export column feeds which field, decided once per export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnResolution {
    pub identifier: usize,
    pub fields: BTreeMap<String, Option<usize>>,
    pub headers: Vec<String>,
}

impl ColumnResolution {
    pub fn unmatched_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, column)| column.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Records produced from one export.
#[derive(Debug, Clone)]
pub struct IngestedExport {
    pub source_name: String,
    pub resolution: ColumnResolution,
    pub records: Vec<CanonicalRecord>,
}

#[derive(Debug, Clone)]
pub struct RowNormalizer {
    spec: IngestSpec,
    identifier_matcher: Regex,
    fields: Vec<CompiledField>,
}

impl RowNormalizer {
    pub fn compile(spec: IngestSpec) -> Result<Self, RecordError> {
        spec.layout.delimiter_byte()?;
        let identifier_matcher =
            compile_matcher(&spec.identifier.field, &spec.identifier.matcher)?;
        let fields = spec
            .fields
            .iter()
            .map(|f| {
                let pattern = f
                    .matcher
                    .clone()
                    .unwrap_or_else(|| format!("^{}$", regex::escape(&f.name)));
                Ok(CompiledField {
                    name: f.name.clone(),
                    matcher: compile_matcher(&f.name, &pattern)?,
                    replace: f.replace.clone(),
                })
            })
            .collect::<Result<Vec<_>, RecordError>>()?;
        Ok(Self {
            spec,
            identifier_matcher,
            fields,
        })
    }

    /// The identifier claims its column first, then fields in declaration order.
    /// A column feeds at most one field.
    pub fn resolve_columns(&self, raw_headers: &[String]) -> Result<ColumnResolution, RecordError> {
        let headers = raw_headers.iter().map(|h| normalize_header(h)).collect::<Vec<_>>();
        let mut claimed = vec![false; headers.len()];

        let identifier = headers
            .iter()
            .position(|h| self.identifier_matcher.is_match(h))
            .ok_or_else(|| RecordError::IdentifierColumnMissing {
                field: self.spec.identifier.field.clone(),
                pattern: self.spec.identifier.matcher.clone(),
                headers: headers.clone(),
            })?;
        claimed[identifier] = true;

        let mut fields = BTreeMap::new();
        for field in &self.fields {
            let column = headers
                .iter()
                .enumerate()
                .find(|(i, h)| !claimed[*i] && field.matcher.is_match(h))
                .map(|(i, _)| i);
            if let Some(i) = column {
                claimed[i] = true;
                tracing::debug!(field = %field.name, column = %headers[i], "matched column");
            }
            fields.insert(field.name.clone(), column);
        }

        Ok(ColumnResolution {
            identifier,
            fields,
            headers,
        })
    }

    pub fn normalize_identifier(&self, raw: &str) -> Option<String> {
        match self.spec.identifier.kind {
            IdentifierKind::Text => text_or_none(raw),
            IdentifierKind::Phone => text_or_none(raw).and_then(|v| phone_digits(&v)),
        }
    }

    pub fn normalize_row(
        &self,
        resolution: &ColumnResolution,
        row: &[String],
        source_name: &str,
        actor: &str,
    ) -> CanonicalRecord {
        let cell = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
        let mut record =
            CanonicalRecord::new(self.normalize_identifier(cell(resolution.identifier)));

        for field in &self.fields {
            let value = resolution
                .fields
                .get(&field.name)
                .copied()
                .flatten()
                .and_then(|i| text_or_none(cell(i)))
                .map(|v| {
                    field
                        .replace
                        .iter()
                        .fold(v, |acc, r| acc.replace(&r.from, &r.to))
                });
            record.set(&field.name, value);
        }

        if let Some(country) = &self.spec.country {
            let label = record.key().map(|k| country.classify(k));
            record.set(&country.field, label);
        }
        for (name, value) in &self.spec.constants {
            record.set(name, Some(value.clone()));
        }
        if let Some(field) = &self.spec.provenance.source_field {
            record.set(field, Some(source_name.to_string()));
        }
        if let Some(field) = &self.spec.provenance.actor_field {
            record.set(field, Some(actor.to_string()));
        }
        record
    }

    pub fn ingest(&self, source: &dyn RowSource, actor: &str) -> Result<IngestedExport, RecordError> {
        let table = source.read_table(&self.spec.layout)?;
        let resolution = self.resolve_columns(&table.headers)?;
        let unmatched = resolution.unmatched_fields();
        if !unmatched.is_empty() {
            tracing::warn!(source = %table.source_name, fields = ?unmatched, "no column matched; values will be null");
        }
        let records = table
            .rows
            .iter()
            .map(|row| self.normalize_row(&resolution, row, &table.source_name, actor))
            .collect();
        Ok(IngestedExport {
            source_name: table.source_name,
            resolution,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn students_spec() -> IngestSpec {
        IngestSpec {
            identifier: IdentifierSpec {
                field: "mobile_phone".into(),
                matcher: "mobile|phone".into(),
                kind: IdentifierKind::Phone,
            },
            fields: vec![
                FieldSpec {
                    name: "student_name".into(),
                    matcher: Some("name|student".into()),
                    replace: vec![Replacement {
                        from: "/".into(),
                        to: ".".into(),
                    }],
                },
                FieldSpec {
                    name: "staff".into(),
                    matcher: Some("staff".into()),
                    replace: vec![],
                },
                FieldSpec {
                    name: "networker".into(),
                    matcher: None,
                    replace: vec![],
                },
            ],
            country: Some(CountrySpec {
                field: "country".into(),
                rules: vec![
                    CountryRule {
                        length: 10,
                        prefix: None,
                        country: "India".into(),
                    },
                    CountryRule {
                        length: 9,
                        prefix: Some("7".into()),
                        country: "Sri Lanka".into(),
                    },
                    CountryRule {
                        length: 11,
                        prefix: Some("94".into()),
                        country: "Sri Lanka".into(),
                    },
                ],
                fallback: "Others".into(),
            }),
            constants: BTreeMap::from([("class".to_string(), "Class A".to_string())]),
            provenance: ProvenanceSpec {
                source_field: Some("source_file".into()),
                actor_field: Some("etl_user_id".into()),
            },
            layout: CsvLayout {
                header_row: 3,
                skip_footer_rows: 1,
                ..CsvLayout::default()
            },
        }
    }

    const EXPORT: &str = "\
March roster,,,
generated 2026-03-01,,,
Student Name,Mobile Phone,Staff Name,Networker
Ann/Lee,+91 98765-43210,Kim,
Ben, 712 345 678 ,Lee,Joy
Cara,nan,Lee,
Dan,94712345678,,Joy
Total,4,,
";

    #[test]
    fn layout_skips_preamble_and_footer() {
        let table = read_csv(
            "march.csv",
            EXPORT.as_bytes(),
            &CsvLayout {
                header_row: 3,
                skip_footer_rows: 1,
                ..CsvLayout::default()
            },
        )
        .unwrap();
        assert_eq!(table.headers[1], "Mobile Phone");
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[3][0], "Dan");
    }

    #[test]
    fn reading_stops_at_first_blank_row() {
        let text = "id,name\n1,Ann\n,\n2,Ben\n";
        let table = read_csv("x.csv", text.as_bytes(), &CsvLayout::default()).unwrap();
        assert_eq!(table.rows, vec![vec!["1".to_string(), "Ann".to_string()]]);
    }

    #[test]
    fn header_row_past_end_is_an_error() {
        let layout = CsvLayout {
            header_row: 5,
            ..CsvLayout::default()
        };
        let err = read_csv("x.csv", "a,b\n".as_bytes(), &layout).unwrap_err();
        assert!(matches!(err, RecordError::HeaderRowMissing(5)));
    }

    #[test]
    fn columns_are_claimed_once_in_declaration_order() {
        let normalizer = RowNormalizer::compile(students_spec()).unwrap();
        let headers = ["Student Name", "Mobile Phone", "Staff Name", "Networker"]
            .map(String::from)
            .to_vec();
        let resolution = normalizer.resolve_columns(&headers).unwrap();
        assert_eq!(resolution.identifier, 1);
        assert_eq!(resolution.fields["student_name"], Some(0));
        assert_eq!(resolution.fields["staff"], Some(2));
        assert_eq!(resolution.fields["networker"], Some(3));
    }

    #[test]
    fn missing_identifier_column_is_fatal() {
        let normalizer = RowNormalizer::compile(students_spec()).unwrap();
        let err = normalizer
            .resolve_columns(&["Student".to_string(), "Staff".to_string()])
            .unwrap_err();
        assert!(matches!(err, RecordError::IdentifierColumnMissing { .. }));
    }

    #[test]
    fn invalid_matcher_is_reported_per_field() {
        let mut spec = students_spec();
        spec.fields[1].matcher = Some("(staff".into());
        let err = RowNormalizer::compile(spec).unwrap_err();
        assert!(matches!(err, RecordError::InvalidMatcher { ref field, .. } if field == "staff"));
    }

    #[test]
    fn non_ascii_delimiter_is_rejected_at_compile_time() {
        let mut spec = students_spec();
        spec.layout.delimiter = '§';
        let err = RowNormalizer::compile(spec).unwrap_err();
        assert!(matches!(err, RecordError::InvalidDelimiter('§')));

        let layout = CsvLayout {
            delimiter: ';',
            ..CsvLayout::default()
        };
        let table = read_csv("x.csv", "id;name\n1;Ann\n".as_bytes(), &layout).unwrap();
        assert_eq!(table.headers, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn ingest_normalizes_phones_and_stamps_derived_fields() {
        let normalizer = RowNormalizer::compile(students_spec()).unwrap();
        let source = CsvTextSource {
            name: "march.csv".into(),
            text: EXPORT.into(),
        };
        let export = normalizer.ingest(&source, "system").unwrap();
        assert_eq!(export.records.len(), 4);

        let ann = &export.records[0];
        assert_eq!(ann.key(), Some("919876543210"));
        assert_eq!(ann.field("student_name"), Some("Ann.Lee"));
        assert_eq!(ann.field("networker"), None);
        assert_eq!(ann.field("country"), Some("Others"));
        assert_eq!(ann.field("class"), Some("Class A"));
        assert_eq!(ann.field("source_file"), Some("march.csv"));
        assert_eq!(ann.field("etl_user_id"), Some("system"));

        assert_eq!(export.records[1].key(), Some("712345678"));
        assert_eq!(export.records[1].field("country"), Some("Sri Lanka"));

        assert_eq!(export.records[2].key(), None);
        assert_eq!(export.records[2].field("country"), None);

        assert_eq!(export.records[3].field("country"), Some("Sri Lanka"));
    }

    #[test]
    fn content_fields_cover_everything_the_normalizer_emits() {
        let spec = students_spec();
        assert_eq!(
            spec.content_fields(),
            vec![
                "student_name",
                "staff",
                "networker",
                "country",
                "class",
                "source_file",
                "etl_user_id"
            ]
        );
    }
}
