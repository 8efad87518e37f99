//! Bulletin payload decoding, column normalization and classification.

use std::collections::BTreeMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use rasff_core::{AlertRecord, CanonicalColumn};
use scraper::{Html, Selector};
use thiserror::Error;

pub mod taxonomy;

pub use taxonomy::{classify, CategoryTable, Taxonomy};

pub const CRATE_NAME: &str = "rasff-adapters";

const OLE2_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_SIGNATURE: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// Every variant means the payload is not a usable table; callers skip the
/// period rather than abort.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unreadable workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("unreadable delimited text: {0}")]
    Delimited(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Xls,
    Xlsx,
    Html,
    Delimited,
    Unknown,
}

impl PayloadKind {
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&OLE2_SIGNATURE) {
            return PayloadKind::Xls;
        }
        if bytes.starts_with(&ZIP_SIGNATURE) {
            return PayloadKind::Xlsx;
        }
        let Ok(text) = std::str::from_utf8(bytes) else {
            return PayloadKind::Unknown;
        };
        let head = text
            .trim_start_matches('\u{feff}')
            .trim_start()
            .chars()
            .take(512)
            .collect::<String>()
            .to_ascii_lowercase();
        if head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<html") {
            PayloadKind::Html
        } else if head.trim().is_empty() {
            PayloadKind::Unknown
        } else {
            PayloadKind::Delimited
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PayloadKind::Xls => "xls",
            PayloadKind::Xlsx => "xlsx",
            PayloadKind::Html => "html",
            PayloadKind::Delimited => "csv",
            PayloadKind::Unknown => "bin",
        }
    }
}

/// A single decoded cell, independent of the source format.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    DateTime(NaiveDateTime),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            CellValue::Number(_) | CellValue::DateTime(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }

    /// References are `YYYY.NNNN`. Typed into a numeric cell they lose their
    /// trailing zeros (`2024.1800` reads back as `2024.18`), so fractional
    /// numbers are padded back to four decimals.
    pub fn as_reference(&self) -> Option<String> {
        match self {
            CellValue::Number(n) if n.fract() != 0.0 => Some(format!("{n:.4}")),
            other => other.as_text(),
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Empty => None,
            CellValue::DateTime(dt) => Some(dt.date()),
            CellValue::Number(serial) => excel_serial_to_date(*serial),
            CellValue::Text(text) => parse_date_text(text),
        }
    }
}

/// One source row keyed by normalized header.
pub type RawRow = BTreeMap<String, CellValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    /// Normalized headers in first-seen order across all sheets.
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    /// Appends a grid whose first non-empty row is the header.
    fn push_grid(&mut self, grid: impl IntoIterator<Item = Vec<CellValue>>) {
        let mut header: Option<Vec<Option<String>>> = None;
        for cells in grid {
            if cells.iter().all(CellValue::is_empty) {
                continue;
            }
            if header.is_none() {
                let columns = cells
                    .iter()
                    .map(|cell| cell.as_text().map(|h| normalize_header(&h)).filter(|h| !h.is_empty()))
                    .collect::<Vec<_>>();
                for name in columns.iter().flatten() {
                    if !self.headers.contains(name) {
                        self.headers.push(name.clone());
                    }
                }
                header = Some(columns);
                continue;
            }
            let Some(columns) = header.as_ref() else {
                continue;
            };

            let mut row = RawRow::new();
            for (name, cell) in columns.iter().zip(cells) {
                let Some(name) = name else { continue };
                match row.get(name) {
                    Some(existing) if !existing.is_empty() => {}
                    _ => {
                        row.insert(name.clone(), cell);
                    }
                }
            }
            self.rows.push(row);
        }
    }
}

/// `"Notifying Country "` -> `"notifying_country"`.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Decodes a fetched or uploaded bulletin into rows. Does not interpret columns.
pub fn decode_bulletin(bytes: &[u8]) -> Result<RawTable, AdapterError> {
    match PayloadKind::sniff(bytes) {
        PayloadKind::Xls | PayloadKind::Xlsx => decode_workbook(bytes),
        PayloadKind::Delimited => decode_delimited(bytes),
        PayloadKind::Html => Err(AdapterError::MalformedPayload(describe_html_page(bytes))),
        PayloadKind::Unknown => Err(AdapterError::MalformedPayload(format!(
            "unrecognised {} byte payload",
            bytes.len()
        ))),
    }
}

fn decode_workbook(bytes: &[u8]) -> Result<RawTable, AdapterError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let mut table = RawTable::default();
    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name)?;
        table.push_grid(
            range
                .rows()
                .map(|row| row.iter().map(cell_from_workbook).collect::<Vec<_>>()),
        );
    }
    Ok(table)
}

fn cell_from_workbook(data: &Data) -> CellValue {
    match data {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Text(b.to_string()),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Number(dt.as_f64())),
    }
}

fn decode_delimited(bytes: &[u8]) -> Result<RawTable, AdapterError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| AdapterError::MalformedPayload(format!("text payload is not UTF-8: {e}")))?
        .trim_start_matches('\u{feff}');
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let delimiter = [b';', b',', b'\t']
        .into_iter()
        .max_by_key(|d| first_line.bytes().filter(|b| b == d).count())
        .unwrap_or(b',');

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record?;
        grid.push(
            record
                .iter()
                .map(|field| {
                    if field.trim().is_empty() {
                        CellValue::Empty
                    } else {
                        CellValue::Text(field.to_string())
                    }
                })
                .collect::<Vec<_>>(),
        );
    }
    let mut table = RawTable::default();
    table.push_grid(grid);
    Ok(table)
}

fn describe_html_page(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&text);
    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|n| n.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });
    match title {
        Some(title) => format!("received an HTML page ({title}) instead of a spreadsheet"),
        None => "received an HTML page instead of a spreadsheet".to_string(),
    }
}

/// Excel 1900 date system; serials outside the representable range are ignored.
fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial.trunc() as i64))
}

const DATETIME_FORMATS: [&str; 7] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];

pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.date());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    None
}

/// Normalized source header -> canonical column.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    entries: BTreeMap<String, CanonicalColumn>,
}

impl ColumnMapping {
    /// Accepts only the canonical column names themselves.
    pub fn identity() -> Self {
        Self {
            entries: CanonicalColumn::ALL
                .into_iter()
                .map(|c| (c.as_str().to_string(), c))
                .collect(),
        }
    }

    pub fn with_alias(mut self, header: &str, column: CanonicalColumn) -> Self {
        self.entries.insert(normalize_header(header), column);
        self
    }

    pub fn resolve(&self, header: &str) -> Option<CanonicalColumn> {
        self.entries
            .get(header)
            .or_else(|| self.entries.get(&normalize_header(header)))
            .copied()
    }
}

impl Default for ColumnMapping {
    /// Layout of the published weekly bulletins.
    fn default() -> Self {
        Self::identity()
            .with_alias("date", CanonicalColumn::DateOfCase)
            .with_alias("reference", CanonicalColumn::Reference)
            .with_alias("notifying_country", CanonicalColumn::NotificationFrom)
            .with_alias("origin", CanonicalColumn::CountryOrigin)
            .with_alias("category", CanonicalColumn::ProductCategory)
            .with_alias("subject", CanonicalColumn::Product)
            .with_alias("hazards", CanonicalColumn::HazardSubstance)
            .with_alias("classification", CanonicalColumn::HazardCategory)
    }
}

/// Maps raw rows onto [`AlertRecord`] and fills the derived columns.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mapping: ColumnMapping,
    taxonomy: Taxonomy,
}

impl Normalizer {
    pub fn new(mapping: ColumnMapping, taxonomy: Taxonomy) -> Self {
        Self { mapping, taxonomy }
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn normalize(&self, row: &RawRow) -> AlertRecord {
        let mut record = AlertRecord::empty();
        for (header, cell) in row {
            let Some(column) = self.mapping.resolve(header) else {
                continue;
            };
            match column {
                CanonicalColumn::DateOfCase => {
                    if record.date_of_case.is_none() {
                        record.set_date_of_case(cell.as_date());
                    }
                }
                CanonicalColumn::Reference => {
                    if record.reference.is_none() {
                        record.reference = cell.as_reference();
                    }
                }
                other => {
                    if record.text(other).is_none() {
                        record.set_text(other, cell.as_text());
                    }
                }
            }
        }
        record.set_product_classification(classify(
            record.product_category.as_deref(),
            &self.taxonomy.products,
        ));
        record.set_hazard_classification(classify(
            record.hazard_substance.as_deref(),
            &self.taxonomy.hazards,
        ));
        record
    }

    /// Fails only when the table has no header or none of its columns is
    /// recognised. Rows whose mapped cells are all empty are dropped.
    pub fn normalize_table(&self, table: &RawTable) -> Result<Vec<AlertRecord>, AdapterError> {
        if table.headers.is_empty() {
            return Err(AdapterError::MalformedPayload("no header row found".to_string()));
        }
        if !table.headers.iter().any(|h| self.mapping.resolve(h).is_some()) {
            return Err(AdapterError::MalformedPayload(format!(
                "none of the columns [{}] match the bulletin layout",
                table.headers.join(", ")
            )));
        }
        Ok(table
            .rows
            .iter()
            .filter(|row| {
                row.iter()
                    .any(|(h, cell)| self.mapping.resolve(h).is_some() && !cell.is_empty())
            })
            .map(|row| self.normalize(row))
            .collect())
    }

    pub fn normalize_payload(&self, bytes: &[u8]) -> Result<Vec<AlertRecord>, AdapterError> {
        let table = decode_bulletin(bytes)?;
        self.normalize_table(&table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasff_core::ClassificationPair;

    const BULLETIN_CSV: &str = "\
Date;Reference;Notifying Country;Origin;Category;Subject;Hazards;Classification;Risk decision
13/03/2024;2024.1801;France;Spain;Fruits and vegetables;Pesticide residues in peppers from Spain;chlorpyrifos;alert notification;serious
14/03/2024 09:15:00;2024.1822;Germany;India;herbs and spices;Salmonella in black pepper;Salmonella;border rejection;serious
;;;;;;;;
;2024.1830;Italy;;Wine;Sulphites in wine;something new;information notification;
";

    fn normalizer() -> Normalizer {
        Normalizer::new(ColumnMapping::default(), Taxonomy::builtin().unwrap())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn headers_are_normalized_to_snake_case() {
        assert_eq!(normalize_header(" Notifying Country "), "notifying_country");
        assert_eq!(normalize_header("Hazards"), "hazards");
        assert_eq!(normalize_header("date-of-case"), "date_of_case");
    }

    #[test]
    fn sniffing_distinguishes_payload_kinds() {
        let mut xls = OLE2_SIGNATURE.to_vec();
        xls.extend_from_slice(b"rest");
        assert_eq!(PayloadKind::sniff(&xls), PayloadKind::Xls);
        assert_eq!(PayloadKind::sniff(b"PK\x03\x04zip"), PayloadKind::Xlsx);
        assert_eq!(
            PayloadKind::sniff(b"  <!DOCTYPE html><html><title>x</title></html>"),
            PayloadKind::Html
        );
        assert_eq!(PayloadKind::sniff(b"date;reference\n"), PayloadKind::Delimited);
        assert_eq!(PayloadKind::sniff(&[0xff, 0xfe, 0x00, 0x81]), PayloadKind::Unknown);
        assert_eq!(PayloadKind::Xls.extension(), "xls");
    }

    #[test]
    fn bulletin_rows_map_to_canonical_records() {
        let records = normalizer().normalize_payload(BULLETIN_CSV.as_bytes()).unwrap();
        assert_eq!(records.len(), 3, "blank row is dropped");

        let first = &records[0];
        assert_eq!(first.date_of_case, Some(date(2024, 3, 13)));
        assert_eq!(first.reference.as_deref(), Some("2024.1801"));
        assert_eq!(first.notification_from.as_deref(), Some("France"));
        assert_eq!(first.country_origin.as_deref(), Some("Spain"));
        assert_eq!(first.product.as_deref(), Some("Pesticide residues in peppers from Spain"));
        assert_eq!(first.product_category.as_deref(), Some("Fruits and vegetables"));
        assert_eq!(first.hazard_substance.as_deref(), Some("chlorpyrifos"));
        assert_eq!(first.hazard_category.as_deref(), Some("alert notification"));
        assert_eq!(
            first.product_classification(),
            ClassificationPair::new("Fruits and vegetables", "Plant products")
        );
        assert_eq!(
            first.hazard_classification(),
            ClassificationPair::new("Chlorpyrifos", "Pesticide residues")
        );
        assert_eq!((first.year, first.week), (Some(2024), Some(11)));

        let second = &records[1];
        assert_eq!(second.date_of_case, Some(date(2024, 3, 14)));
        assert_eq!(second.grouphaz, "Pathogenic micro-organisms");
    }

    #[test]
    fn missing_columns_become_null_without_error() {
        let records = normalizer().normalize_payload(BULLETIN_CSV.as_bytes()).unwrap();
        let last = &records[2];
        assert_eq!(last.date_of_case, None);
        assert_eq!((last.year, last.week), (None, None));
        assert_eq!(last.country_origin, None);
        assert_eq!(last.product_classification(), ClassificationPair::new("Wine", "Beverages"));
        assert!(last.hazard_classification().is_unknown());

        let sparse = "reference,subject\n2024.0001,Aflatoxins in pistachios\n";
        let records = normalizer().normalize_payload(sparse.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.reference.as_deref(), Some("2024.0001"));
        assert_eq!(record.notification_from, None);
        assert_eq!(record.product_category, None);
        assert!(record.product_classification().is_unknown());
    }

    #[test]
    fn unmapped_columns_are_dropped() {
        let mut row = RawRow::new();
        row.insert("risk_decision".into(), CellValue::Text("serious".into()));
        row.insert("origin".into(), CellValue::Text("Brazil".into()));
        let record = normalizer().normalize(&row);
        let mut expected = AlertRecord::empty();
        expected.country_origin = Some("Brazil".into());
        assert_eq!(record, expected);
    }

    #[test]
    fn html_error_page_is_malformed() {
        let html = b"<html><head><title>404 Not Found</title></head><body>nope</body></html>";
        let err = normalizer().normalize_payload(html).unwrap_err();
        match err {
            AdapterError::MalformedPayload(message) => assert!(message.contains("404 Not Found")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn table_without_recognised_columns_is_malformed() {
        let err = normalizer()
            .normalize_payload(b"foo,bar\n1,2\n")
            .unwrap_err();
        assert!(matches!(err, AdapterError::MalformedPayload(_)));

        let err = normalizer().normalize_payload(b"\n\n").unwrap_err();
        assert!(matches!(err, AdapterError::MalformedPayload(_)));
    }

    #[test]
    fn header_only_table_yields_no_records() {
        let records = normalizer()
            .normalize_payload(b"date,reference,hazards\n")
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn corrupt_workbook_is_an_error() {
        let mut bytes = OLE2_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(decode_bulletin(&bytes).is_err());
    }

    #[test]
    fn dates_parse_from_text_serials_and_datetimes() {
        assert_eq!(parse_date_text("2024-03-15"), Some(date(2024, 3, 15)));
        assert_eq!(parse_date_text("15/03/2024"), Some(date(2024, 3, 15)));
        assert_eq!(parse_date_text("15.03.2024"), Some(date(2024, 3, 15)));
        assert_eq!(parse_date_text("2024-03-15 10:02:11"), Some(date(2024, 3, 15)));
        assert_eq!(parse_date_text("2024-03-15T10:02:11+01:00"), Some(date(2024, 3, 15)));
        assert_eq!(parse_date_text("not a date"), None);
        assert_eq!(CellValue::Number(45366.0).as_date(), Some(date(2024, 3, 15)));
        assert_eq!(CellValue::Number(-3.0).as_date(), None);
        let dt = date(2024, 3, 15).and_hms_opt(8, 0, 0).unwrap();
        assert_eq!(CellValue::DateTime(dt).as_date(), Some(date(2024, 3, 15)));
    }

    #[test]
    fn numeric_cells_render_without_trailing_zeroes() {
        assert_eq!(CellValue::Number(2024.0).as_text().as_deref(), Some("2024"));
        assert_eq!(CellValue::Number(1.5).as_text().as_deref(), Some("1.5"));
        assert_eq!(CellValue::Text("  ".into()).as_text(), None);
    }

    #[test]
    fn numeric_references_keep_four_decimals() {
        assert_eq!(CellValue::Number(2024.18).as_reference().as_deref(), Some("2024.1800"));
        assert_eq!(CellValue::Number(2024.1822).as_reference().as_deref(), Some("2024.1822"));
        assert_eq!(CellValue::Number(2024.0).as_reference().as_deref(), Some("2024"));
        assert_eq!(CellValue::Text(" 2024.0100 ".into()).as_reference().as_deref(), Some("2024.0100"));

        let mut row = RawRow::new();
        row.insert("reference".into(), CellValue::Number(2024.18));
        assert_eq!(normalizer().normalize(&row).reference.as_deref(), Some("2024.1800"));
    }
}
