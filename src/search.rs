use log::debug;

use crate::table::{CellValue, Table, Tabular};

/// How a search result should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    /// Empty query: the whole table is shown
    Unfiltered,
    /// Query matched this many rows
    Matches(usize),
    /// Query matched nothing; a warning, not a failure
    NoMatches,
}

/// Rows of a table selected by a query, in original order.
#[derive(Debug, Clone)]
pub struct FilteredView<'a> {
    table: &'a Table,
    indices: Vec<usize>,
    query: String,
}

/// Does any cell of `row` contain `needle`? `needle` must already be lowercase.
fn row_matches(row: &[CellValue], needle: &str) -> bool {
    row.iter()
        .any(|cell| cell.canonical_text().to_lowercase().contains(needle))
}

fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Keyword search across every column.
///
/// An empty (or all-whitespace) query selects every row. Otherwise a row is
/// kept when any cell's canonical text contains the trimmed query, ignoring
/// case.
pub fn filter<'a>(table: &'a Table, query: &str) -> FilteredView<'a> {
    let needle = normalize_query(query);
    let indices: Vec<usize> = if needle.is_empty() {
        (0..table.row_count()).collect()
    } else {
        table
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| row_matches(row, &needle))
            .map(|(i, _)| i)
            .collect()
    };

    debug!(
        "search {:?}: {} of {} rows",
        query.trim(),
        indices.len(),
        table.row_count()
    );
    FilteredView {
        table,
        indices,
        query: query.trim().to_string(),
    }
}

impl<'a> FilteredView<'a> {
    /// Apply another query within this view's rows.
    pub fn refine(&self, query: &str) -> FilteredView<'a> {
        let needle = normalize_query(query);
        let indices: Vec<usize> = if needle.is_empty() {
            self.indices.clone()
        } else {
            self.indices
                .iter()
                .copied()
                .filter(|&i| row_matches(&self.table.rows()[i], &needle))
                .collect()
        };
        let query = match (self.query.is_empty(), query.trim().is_empty()) {
            (_, true) => self.query.clone(),
            (true, false) => query.trim().to_string(),
            (false, false) => format!("{} {}", self.query, query.trim()),
        };
        FilteredView {
            table: self.table,
            indices,
            query,
        }
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }

    /// Indices into the underlying table.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_filtered(&self) -> bool {
        !self.query.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn status(&self) -> SearchStatus {
        match (self.is_filtered(), self.indices.len()) {
            (false, _) => SearchStatus::Unfiltered,
            (true, 0) => SearchStatus::NoMatches,
            (true, n) => SearchStatus::Matches(n),
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &'a [CellValue]> + '_ {
        let table = self.table;
        self.indices.iter().map(move |&i| table.rows()[i].as_slice())
    }

    /// Copy the selected rows into an owned table.
    pub fn to_table(&self) -> Table {
        Table::from_parts(
            self.table.columns().to_vec(),
            self.rows().map(<[CellValue]>::to_vec).collect(),
        )
    }
}

impl Tabular for FilteredView<'_> {
    fn columns(&self) -> &[String] {
        self.table.columns()
    }

    fn row_iter(&self) -> Box<dyn Iterator<Item = &[CellValue]> + '_> {
        let table = self.table;
        Box::new(self.indices.iter().map(move |&i| table.rows()[i].as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_records(vec![
            vec![("name", CellValue::from("Alpha")), ("price", CellValue::Integer(10))],
            vec![("name", CellValue::from("Beta")), ("price", CellValue::Integer(20))],
            vec![("name", CellValue::from("alphabet")), ("price", CellValue::Number(2.5))],
        ])
    }

    #[test]
    fn test_empty_query_returns_everything() {
        let table = sample();
        for q in ["", "   ", "\t"] {
            let view = filter(&table, q);
            assert_eq!(view.indices(), &[0, 1, 2]);
            assert_eq!(view.status(), SearchStatus::Unfiltered);
        }
    }

    #[test]
    fn test_case_insensitive_and_stable() {
        let table = sample();
        let lower = filter(&table, "alpha");
        let upper = filter(&table, "ALPHA");
        assert_eq!(lower.indices(), &[0, 2]);
        assert_eq!(lower.indices(), upper.indices());
        assert_eq!(lower.status(), SearchStatus::Matches(2));
    }

    #[test]
    fn test_numbers_match_on_canonical_text() {
        let table = sample();
        assert_eq!(filter(&table, "20").indices(), &[1]);
        assert_eq!(filter(&table, "2.5").indices(), &[2]);
        assert!(filter(&table, "2.50").is_empty());
    }

    #[test]
    fn test_no_matches_is_a_status() {
        let table = sample();
        let view = filter(&table, "zzz");
        assert!(view.is_empty());
        assert_eq!(view.status(), SearchStatus::NoMatches);
    }

    #[test]
    fn test_refine_is_idempotent() {
        let table = sample();
        let view = filter(&table, "alpha");
        let again = view.refine("alpha");
        assert_eq!(view.indices(), again.indices());

        let narrower = view.refine("bet");
        assert_eq!(narrower.indices(), &[2]);
        assert_eq!(narrower.query(), "alpha bet");
    }

    #[test]
    fn test_degenerate_tables() {
        let empty = Table::default();
        assert!(filter(&empty, "x").is_empty());
        assert_eq!(filter(&empty, "").status(), SearchStatus::Unfiltered);

        let no_columns = Table::new(Vec::new(), vec![Vec::new(), Vec::new()]).unwrap();
        assert!(filter(&no_columns, "x").is_empty());
        assert_eq!(filter(&no_columns, "").len(), 2);
    }

    #[test]
    fn test_to_table_materializes_selection() {
        let table = sample();
        let owned = filter(&table, "beta").to_table();
        assert_eq!(owned.columns(), table.columns());
        assert_eq!(owned.row_count(), 1);
        assert_eq!(owned.get(0, "price"), Some(&CellValue::Integer(20)));
    }
}
