use log::error;

use crate::table::Tabular;

pub const CSV_CONTENT_TYPE: &str = "text/csv";
pub const FILTERED_FILENAME: &str = "filtered_results.csv";
pub const FULL_FILENAME: &str = "full_sheet.csv";

/// A ready-to-serve CSV download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub filename: &'static str,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Convert a table or filtered view to CSV
///
/// This function exports tabular data to CSV (Comma-Separated Values) format:
/// - The header row lists the column names in declared order, exactly once
/// - Rows follow in the order of the input view
/// - Fields containing commas, quotes or line breaks are quoted, with
///   internal quotes doubled; all other fields are written bare
/// - Output is UTF-8 without a byte-order mark, `\n` terminated
///
/// Cell values are written in their canonical text form, so export never
/// fails because of cell content.
///
/// # Arguments
/// * `view` - The table or filtered view to convert
///
/// # Returns
/// * `Vec<u8>` - CSV content as bytes
///
/// # Examples
/// ```
/// use screener::table::{CellValue, Table};
/// use screener::downloader::to_csv;
///
/// let table = Table::from_records(vec![vec![
///     ("a", CellValue::from("x,y")),
///     ("b", CellValue::Integer(2)),
/// ]]);
/// assert_eq!(to_csv(&table), b"a,b\n\"x,y\",2\n");
/// ```
pub fn to_csv<T: Tabular + ?Sized>(view: &T) -> Vec<u8> {
    // Writes go into a Vec, so the only csv errors are I/O ones.
    write(view).unwrap_or_else(|e| {
        error!("CSV export failed: {}", e);
        Vec::new()
    })
}

fn write<T: Tabular + ?Sized>(view: &T) -> csv::Result<Vec<u8>> {
    // The csv writer renders an empty record as `""`; a table without
    // columns is written as bare line breaks instead.
    if view.columns().is_empty() {
        return Ok(vec![b'\n'; 1 + view.row_iter().count()]);
    }

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());

    writer.write_record(view.columns())?;
    for row in view.row_iter() {
        writer.write_record(row.iter().map(|cell| cell.canonical_text()))?;
    }

    writer.into_inner().map_err(|e| e.into_error().into())
}

/// Suggested download filename for a query
///
/// # Arguments
/// * `query` - The active search query (possibly empty)
///
/// # Returns
/// * `&'static str` - `filtered_results.csv` for a non-empty query, `full_sheet.csv` otherwise
pub fn download_filename(query: &str) -> &'static str {
    if query.trim().is_empty() {
        FULL_FILENAME
    } else {
        FILTERED_FILENAME
    }
}

/// Bundle a CSV export with its filename and content type.
pub fn csv_download<T: Tabular + ?Sized>(view: &T, query: &str) -> Download {
    Download {
        filename: download_filename(query),
        content_type: CSV_CONTENT_TYPE,
        bytes: to_csv(view),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::filter;
    use crate::table::{CellValue, Table};

    fn sample() -> Table {
        Table::from_records(vec![
            vec![("name", CellValue::from("Alpha")), ("price", CellValue::from("10"))],
            vec![("name", CellValue::from("Beta")), ("price", CellValue::from("20"))],
        ])
    }

    #[test]
    fn test_quoting() {
        let table = Table::new(
            vec!["note".into(), "n".into()],
            vec![
                vec![CellValue::from("say \"hi\""), CellValue::Number(1.5)],
                vec![CellValue::from("two\nlines"), CellValue::Empty],
                vec![CellValue::from("plain"), CellValue::Integer(-4)],
            ],
        )
        .unwrap();

        let csv = String::from_utf8(to_csv(&table)).unwrap();
        assert_eq!(
            csv,
            "note,n\n\"say \"\"hi\"\"\",1.5\n\"two\nlines\",\nplain,-4\n"
        );
    }

    #[test]
    fn test_filtered_view_export() {
        let table = sample();
        let view = filter(&table, "beta");
        assert_eq!(to_csv(&view), b"name,price\nBeta,20\n");
    }

    #[test]
    fn test_empty_view_still_has_header() {
        let table = sample();
        let view = filter(&table, "zzz");
        assert_eq!(to_csv(&view), b"name,price\n");
    }

    #[test]
    fn test_deterministic_and_no_bom() {
        let table = sample();
        let first = to_csv(&table);
        assert_eq!(first, to_csv(&table));
        assert!(!first.starts_with(&[0xEF, 0xBB, 0xBF]));
    }

    #[test]
    fn test_zero_column_table() {
        let table = Table::new(Vec::new(), vec![Vec::new(), Vec::new()]).unwrap();
        assert_eq!(to_csv(&table), b"\n\n\n");
        assert_eq!(to_csv(&Table::default()), b"\n");
    }

    #[test]
    fn test_download_filename() {
        assert_eq!(download_filename(""), FULL_FILENAME);
        assert_eq!(download_filename("  "), FULL_FILENAME);
        assert_eq!(download_filename("alpha"), FILTERED_FILENAME);

        let download = csv_download(&sample(), "alpha");
        assert_eq!(download.filename, "filtered_results.csv");
        assert_eq!(download.content_type, "text/csv");
    }
}
