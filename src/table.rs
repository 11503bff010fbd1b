use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

use crate::error::FetchCause;

/// A single cell of a fetched sheet.
///
/// Values come out of the sheet "numericised": integer-looking text is stored
/// as [`CellValue::Integer`], other finite numbers as [`CellValue::Number`].
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Integer(i64),
    Number(f64),
    Text(String),
    Empty,
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::Integer(i) => s.serialize_i64(*i),
            CellValue::Number(n) => s.serialize_f64(*n),
            CellValue::Text(t) => s.serialize_str(t),
            CellValue::Empty => s.serialize_str(""),
        }
    }
}

impl CellValue {
    /// Interpret raw sheet text the way the record reader does.
    pub fn numericise(raw: &str) -> Self {
        if raw.is_empty() {
            return CellValue::Empty;
        }
        if let Ok(i) = raw.parse::<i64>() {
            return CellValue::Integer(i);
        }
        // f64 parsing accepts "inf" and "NaN"; those stay text.
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => CellValue::Number(f),
            _ => CellValue::Text(raw.to_string()),
        }
    }

    /// Canonical text form used by search and export.
    pub fn canonical_text(&self) -> String {
        self.to_string()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Integer(i) => write!(f, "{}", i),
            // Display for f64 never uses exponent notation.
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Empty => Ok(()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s.to_string())
        }
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        if s.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s)
        }
    }
}

impl From<i64> for CellValue {
    fn from(i: i64) -> Self {
        CellValue::Integer(i)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

/// In-memory table: ordered column names and rows aligned to them.
///
/// Every row holds exactly one value per column. Short rows are padded with
/// [`CellValue::Empty`]. Cells past the last header cell get an unlabelled
/// column (blank name) so nothing in the sheet is dropped. Labelled column
/// names are unique; blank ones may repeat and are not addressable by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl Table {
    /// Build a table, enforcing unique column names and row width.
    pub fn new(mut columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Result<Self, FetchCause> {
        let mut seen = HashSet::with_capacity(columns.len());
        for name in columns.iter().filter(|c| !c.is_empty()) {
            if !seen.insert(name.as_str()) {
                return Err(FetchCause::Malformed(format!(
                    "the header row is not unique: '{}' appears twice",
                    name
                )));
            }
        }

        let widest = rows.iter().map(Vec::len).max().unwrap_or(0);
        if widest > columns.len() {
            columns.resize(widest, String::new());
        }

        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, CellValue::Empty);
                row
            })
            .collect();

        Ok(Table { columns, rows })
    }

    /// Assemble a table from parts that already satisfy its invariants.
    pub(crate) fn from_parts(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Table { columns, rows }
    }

    /// Build a table from rows given as (column, value) pairs. Columns are
    /// declared in first-seen order across all rows.
    pub fn from_records<K, V>(records: Vec<Vec<(K, V)>>) -> Self
    where
        K: Into<String>,
        V: Into<CellValue>,
    {
        let mut columns: Vec<String> = Vec::new();
        let mut keyed: Vec<Vec<(usize, CellValue)>> = Vec::with_capacity(records.len());

        for record in records {
            let mut cells = Vec::with_capacity(record.len());
            for (key, value) in record {
                let key = key.into();
                let idx = match columns.iter().position(|c| *c == key) {
                    Some(idx) => idx,
                    None => {
                        columns.push(key);
                        columns.len() - 1
                    }
                };
                cells.push((idx, value.into()));
            }
            keyed.push(cells);
        }

        let width = columns.len();
        let rows = keyed
            .into_iter()
            .map(|cells| {
                let mut row = vec![CellValue::Empty; width];
                for (idx, value) in cells {
                    row[idx] = value;
                }
                row
            })
            .collect();

        Table { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[CellValue]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Position of a labelled column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        self.columns.iter().position(|c| c == name)
    }

    /// Cell lookup by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&CellValue> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[col])
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Anything that can be rendered as a header plus ordered rows.
pub trait Tabular {
    fn columns(&self) -> &[String];
    fn row_iter(&self) -> Box<dyn Iterator<Item = &[CellValue]> + '_>;
}

impl Tabular for Table {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn row_iter(&self) -> Box<dyn Iterator<Item = &[CellValue]> + '_> {
        Box::new(self.rows.iter().map(Vec::as_slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numericise() {
        assert_eq!(CellValue::numericise(""), CellValue::Empty);
        assert_eq!(CellValue::numericise("10"), CellValue::Integer(10));
        assert_eq!(CellValue::numericise("-3"), CellValue::Integer(-3));
        assert_eq!(CellValue::numericise("1.5"), CellValue::Number(1.5));
        assert_eq!(
            CellValue::numericise("AAPL"),
            CellValue::Text("AAPL".to_string())
        );
        assert_eq!(CellValue::numericise("inf"), CellValue::Text("inf".into()));
        assert_eq!(CellValue::numericise("NaN"), CellValue::Text("NaN".into()));
        assert_eq!(CellValue::numericise("1e3"), CellValue::Number(1000.0));
        assert_eq!(CellValue::numericise("1.2.3"), CellValue::Text("1.2.3".into()));
    }

    #[test]
    fn test_canonical_text() {
        assert_eq!(CellValue::Integer(42).canonical_text(), "42");
        assert_eq!(CellValue::Number(10.0).canonical_text(), "10");
        assert_eq!(CellValue::Number(0.25).canonical_text(), "0.25");
        assert_eq!(CellValue::Number(1e20).canonical_text(), "100000000000000000000");
        assert_eq!(CellValue::Empty.canonical_text(), "");
        assert_eq!(CellValue::from("Beta").canonical_text(), "Beta");
    }

    #[test]
    fn test_new_pads_short_rows() {
        let table = Table::new(
            vec!["a".into(), "b".into()],
            vec![vec![CellValue::from("x")], vec![CellValue::from("1"), CellValue::from("2")]],
        )
        .unwrap();

        assert_eq!(table.row(0).unwrap(), &[CellValue::from("x"), CellValue::Empty]);
        assert_eq!(table.get(1, "b"), Some(&CellValue::from("2")));
    }

    #[test]
    fn test_new_keeps_cells_past_the_header() {
        let table = Table::new(
            vec!["a".into()],
            vec![
                vec![CellValue::from("x")],
                vec![CellValue::from("1"), CellValue::from("2"), CellValue::from("3")],
            ],
        )
        .unwrap();

        assert_eq!(table.columns(), &["a", "", ""]);
        assert_eq!(
            table.row(1).unwrap(),
            &[CellValue::from("1"), CellValue::from("2"), CellValue::from("3")]
        );
        assert_eq!(table.row(0).unwrap(), &[CellValue::from("x"), CellValue::Empty, CellValue::Empty]);
        assert_eq!(table.column_index(""), None);
    }

    #[test]
    fn test_blank_header_names_may_repeat() {
        let table = Table::new(vec!["a".into(), "".into(), "".into()], Vec::new()).unwrap();
        assert_eq!(table.column_count(), 3);
    }

    #[test]
    fn test_new_rejects_duplicate_columns() {
        let err = Table::new(vec!["a".into(), "a".into()], Vec::new()).unwrap_err();
        assert!(matches!(err, FetchCause::Malformed(_)));
    }

    #[test]
    fn test_from_records_first_seen_column_order() {
        let table = Table::from_records(vec![
            vec![("name", CellValue::from("Alpha")), ("price", CellValue::Integer(10))],
            vec![("price", CellValue::Integer(20)), ("sector", CellValue::from("Tech"))],
        ]);

        assert_eq!(table.columns(), &["name", "price", "sector"]);
        assert_eq!(table.get(0, "sector"), Some(&CellValue::Empty));
        assert_eq!(table.get(1, "name"), Some(&CellValue::Empty));
        assert_eq!(table.get(1, "price"), Some(&CellValue::Integer(20)));
    }
}
