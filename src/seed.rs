//! Catalog seeding from a master workbook.
//!
//! The workbook carries four named tables on one sheet. Headers only need to
//! contain the column name they stand for, so `tag_id (PK)` reads as `tag_id`.

use std::io::{Read, Seek};
use std::path::Path;

use calamine::{open_workbook, Data, Range, Xlsx, XlsxError};
use thiserror::Error;

use crate::ingest::cell::CellValue;
use crate::models::{BuildingRow, CatalogSeed, LocationRow, MeasureTypeRow, TagRow};

pub const DEFAULT_SHEET: &str = "テーブル";

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Cannot read workbook: {0}")]
    Workbook(#[from] XlsxError),

    #[error("Table {table} not found in sheet {sheet:?}")]
    MissingTable { table: &'static str, sheet: String },

    #[error("Table {table} has no {column} column")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("Table {table} row {row}, column {column}: {message}")]
    InvalidCell {
        table: &'static str,
        row: usize,
        column: &'static str,
        message: String,
    },
}

/// One named table with normalized headers and blank rows removed
#[derive(Debug)]
struct SeedTable {
    name: &'static str,
    headers: Vec<String>,
    /// (1-based data row, cells)
    rows: Vec<(usize, Vec<Data>)>,
}

impl SeedTable {
    /// `key` is the column whose blank cells mark a row as empty
    fn new(
        name: &'static str,
        headers: &[String],
        data: &Range<Data>,
        key: &'static str,
    ) -> Result<Self, SeedError> {
        let mut table = Self {
            name,
            headers: headers.iter().map(|h| h.trim().to_string()).collect(),
            rows: Vec::new(),
        };
        let key_index = table
            .column(key)
            .ok_or(SeedError::MissingColumn { table: name, column: key })?;

        table.rows = data
            .rows()
            .enumerate()
            .filter(|(_, cells)| {
                cells
                    .get(key_index)
                    .is_some_and(|cell| !CellValue::from(cell).is_empty())
            })
            .map(|(i, cells)| (i + 1, cells.to_vec()))
            .collect();
        Ok(table)
    }

    /// Exact header first, then the first header containing `key`
    fn column(&self, key: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h == key)
            .or_else(|| self.headers.iter().position(|h| h.contains(key)))
    }

    fn records(&self) -> impl Iterator<Item = SeedRecord<'_>> {
        self.rows.iter().map(move |(row, cells)| SeedRecord {
            table: self,
            row: *row,
            cells,
        })
    }
}

struct SeedRecord<'t> {
    table: &'t SeedTable,
    row: usize,
    cells: &'t [Data],
}

impl SeedRecord<'_> {
    /// `None` when the column is absent from the table
    fn cell(&self, column: &'static str) -> Option<CellValue> {
        self.table
            .column(column)
            .map(|i| self.cells.get(i).map(CellValue::from).unwrap_or(CellValue::Empty))
    }

    fn invalid(&self, column: &'static str, message: impl Into<String>) -> SeedError {
        SeedError::InvalidCell {
            table: self.table.name,
            row: self.row,
            column,
            message: message.into(),
        }
    }

    fn id(&self, column: &'static str) -> Result<i64, SeedError> {
        let cell = self.cell(column).ok_or(SeedError::MissingColumn {
            table: self.table.name,
            column,
        })?;
        let number = cell.to_number().map_err(|e| self.invalid(column, e.to_string()))?;
        if number.fract() != 0.0 {
            return Err(self.invalid(column, format!("{number} is not a whole number")));
        }
        Ok(number as i64)
    }

    fn text(&self, column: &'static str) -> Option<String> {
        self.cell(column).and_then(|c| c.header_text())
    }

    fn required_text(&self, column: &'static str) -> Result<String, SeedError> {
        self.text(column)
            .ok_or_else(|| self.invalid(column, "value is required"))
    }

    fn number(&self, column: &'static str) -> Result<Option<f64>, SeedError> {
        match self.cell(column) {
            None | Some(CellValue::Empty) => Ok(None),
            Some(cell) => cell
                .to_number()
                .map(Some)
                .map_err(|e| self.invalid(column, e.to_string())),
        }
    }

    /// Missing or blank reads as true
    fn flag(&self, column: &'static str) -> Result<bool, SeedError> {
        match self.cell(column) {
            None | Some(CellValue::Empty) => Ok(true),
            Some(CellValue::Number(n)) => Ok(n != 0.0),
            Some(CellValue::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                other => Err(self.invalid(column, format!("{other:?} is not a boolean"))),
            },
            Some(CellValue::Temporal(_)) => Err(self.invalid(column, "date is not a boolean")),
        }
    }
}

fn measure_types(table: &SeedTable) -> Result<Vec<MeasureTypeRow>, SeedError> {
    table
        .records()
        .map(|r| {
            Ok(MeasureTypeRow {
                measure_type_id: r.id("measure_type_id")?,
                measure_type_name: r.required_text("measure_type_name")?,
                unit: r.text("unit"),
            })
        })
        .collect()
}

fn buildings(table: &SeedTable) -> Result<Vec<BuildingRow>, SeedError> {
    table
        .records()
        .map(|r| {
            Ok(BuildingRow {
                building_id: r.id("building_id")?,
                building_name: r.required_text("building_name")?,
            })
        })
        .collect()
}

fn locations(table: &SeedTable) -> Result<Vec<LocationRow>, SeedError> {
    table
        .records()
        .map(|r| {
            Ok(LocationRow {
                location_id: r.id("location_id")?,
                building_id: r.id("building_id")?,
                location_name: r.required_text("location_name")?,
                floor: r.text("floor"),
                is_active: r.flag("is_active")?,
            })
        })
        .collect()
}

fn tags(table: &SeedTable) -> Result<Vec<TagRow>, SeedError> {
    table
        .records()
        .map(|r| {
            Ok(TagRow {
                tag_id: r.id("tag_id")?,
                building_id: r.id("building_id")?,
                location_id: r.id("location_id")?,
                measure_type_id: r.id("measure_type_id")?,
                tag_code: r.required_text("tag_code")?,
                min_value: r.number("min_value")?,
                max_value: r.number("max_value")?,
            })
        })
        .collect()
}

fn load_table<RS: Read + Seek>(
    workbook: &mut Xlsx<RS>,
    sheet: &str,
    name: &'static str,
    key: &'static str,
) -> Result<SeedTable, SeedError> {
    let missing = || SeedError::MissingTable {
        table: name,
        sheet: sheet.to_string(),
    };
    let table = workbook.table_by_name(name).map_err(|_| missing())?;
    if table.sheet_name() != sheet {
        return Err(missing());
    }
    let seed_table = SeedTable::new(name, table.columns(), table.data(), key)?;
    tracing::debug!(table = name, rows = seed_table.rows.len(), "Table read");
    Ok(seed_table)
}

/// Read the catalog master tables from `sheet` of the workbook at `path`
pub fn read_catalog_seed(path: &Path, sheet: &str) -> Result<CatalogSeed, SeedError> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    workbook.load_tables()?;

    Ok(CatalogSeed {
        measure_types: measure_types(&load_table(
            &mut workbook,
            sheet,
            "tbl_measure_types",
            "measure_type_name",
        )?)?,
        buildings: buildings(&load_table(&mut workbook, sheet, "tbl_buildings", "building_name")?)?,
        locations: locations(&load_table(&mut workbook, sheet, "tbl_locations", "location_name")?)?,
        tags: tags(&load_table(&mut workbook, sheet, "tbl_tags", "tag_code")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::create_test_store;
    use crate::storage::MeasurementStore;
    use rust_xlsxwriter::{Table, TableColumn, Workbook};
    use tempfile::TempDir;

    fn s(text: &str) -> Data {
        Data::String(text.to_string())
    }

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn range(rows: Vec<Vec<Data>>) -> Range<Data> {
        let width = rows.iter().map(Vec::len).max().unwrap_or(1) as u32;
        let mut range = Range::new((0, 0), (rows.len() as u32 - 1, width - 1));
        for (r, row) in rows.into_iter().enumerate() {
            for (c, value) in row.into_iter().enumerate() {
                range.set_value((r as u32, c as u32), value);
            }
        }
        range
    }

    #[test]
    fn test_headers_containing_key_are_matched() {
        let table = SeedTable::new(
            "tbl_tags",
            &headers(&["tag_id (PK)", "building_id (FK)", "location_id (FK)", "measure_type_id (FK)", "tag_code", "min_value", "max_value"]),
            &range(vec![vec![
                Data::Float(7.0),
                Data::Float(1.0),
                Data::Int(2),
                Data::Float(3.0),
                s("PWR-01"),
                Data::Float(0.0),
                Data::Empty,
            ]]),
            "tag_code",
        )
        .unwrap();

        let rows = tags(&table).unwrap();
        assert_eq!(
            rows,
            vec![TagRow {
                tag_id: 7,
                building_id: 1,
                location_id: 2,
                measure_type_id: 3,
                tag_code: "PWR-01".to_string(),
                min_value: Some(0.0),
                max_value: None,
            }]
        );
    }

    #[test]
    fn test_blank_key_rows_are_dropped() {
        let table = SeedTable::new(
            "tbl_buildings",
            &headers(&["building_id", "building_name"]),
            &range(vec![
                vec![Data::Float(1.0), s("Main")],
                vec![Data::Float(2.0), Data::Empty],
                vec![Data::Empty, s("  ")],
                vec![Data::Float(3.0), s("Annex")],
            ]),
            "building_name",
        )
        .unwrap();

        let rows = buildings(&table).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].building_id, 3);
        assert_eq!(rows[1].building_name, "Annex");
    }

    #[test]
    fn test_location_floor_and_active_flag() {
        let table = SeedTable::new(
            "tbl_locations",
            &headers(&["location_id", "building_id", "location_name", "floor", "is_active"]),
            &range(vec![
                vec![Data::Float(1.0), Data::Float(1.0), s("Lobby"), Data::Float(1.0), Data::Bool(true)],
                vec![Data::Float(2.0), Data::Float(1.0), s("Roof"), s("RF"), s("FALSE")],
                vec![Data::Float(3.0), Data::Float(1.0), s("Basement"), Data::Empty, Data::Empty],
            ]),
            "location_name",
        )
        .unwrap();

        let rows = locations(&table).unwrap();
        assert_eq!(rows[0].floor.as_deref(), Some("1"));
        assert!(rows[0].is_active);
        assert_eq!(rows[1].floor.as_deref(), Some("RF"));
        assert!(!rows[1].is_active);
        assert_eq!(rows[2].floor, None);
        assert!(rows[2].is_active);
    }

    #[test]
    fn test_invalid_id_names_row_and_column() {
        let table = SeedTable::new(
            "tbl_measure_types",
            &headers(&["measure_type_id", "measure_type_name", "unit"]),
            &range(vec![
                vec![Data::Float(1.0), s("power"), s("kW")],
                vec![s("two"), s("temperature"), s("℃")],
            ]),
            "measure_type_name",
        )
        .unwrap();

        let err = measure_types(&table).unwrap_err();
        assert!(matches!(
            err,
            SeedError::InvalidCell {
                table: "tbl_measure_types",
                row: 2,
                column: "measure_type_id",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_key_column() {
        let err = SeedTable::new(
            "tbl_tags",
            &headers(&["tag_id"]),
            &range(vec![vec![Data::Float(1.0)]]),
            "tag_code",
        )
        .unwrap_err();
        assert!(matches!(err, SeedError::MissingColumn { column: "tag_code", .. }));
    }

    /// Write one named table at `first_row` with headers and rows
    fn add_table(
        sheet: &mut rust_xlsxwriter::Worksheet,
        name: &str,
        first_row: u32,
        columns: &[&str],
        rows: &[Vec<Data>],
    ) {
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                let (r, c) = (first_row + 1 + r as u32, c as u16);
                match value {
                    Data::Float(n) => {
                        sheet.write_number(r, c, *n).unwrap();
                    }
                    Data::String(text) => {
                        sheet.write_string(r, c, text).unwrap();
                    }
                    _ => {}
                }
            }
        }
        let table_columns: Vec<TableColumn> = columns
            .iter()
            .map(|h| TableColumn::new().set_header(*h))
            .collect();
        let table = Table::new().set_name(name).set_columns(&table_columns);
        sheet
            .add_table(
                first_row,
                0,
                first_row + rows.len() as u32,
                columns.len() as u16 - 1,
                &table,
            )
            .unwrap();
    }

    fn write_master_workbook(path: &Path) {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(DEFAULT_SHEET).unwrap();

        add_table(
            sheet,
            "tbl_measure_types",
            0,
            &["measure_type_id (PK)", "measure_type_name", "unit"],
            &[vec![Data::Float(1.0), s("power"), s("kW")]],
        );
        add_table(
            sheet,
            "tbl_buildings",
            4,
            &["building_id (PK)", "building_name"],
            &[vec![Data::Float(1.0), s("Main")]],
        );
        add_table(
            sheet,
            "tbl_locations",
            8,
            &["location_id (PK)", "building_id (FK)", "location_name", "floor", "is_active"],
            &[vec![Data::Float(1.0), Data::Float(1.0), s("Lobby"), s("1F"), Data::Float(1.0)]],
        );
        add_table(
            sheet,
            "tbl_tags",
            12,
            &["tag_id (PK)", "building_id (FK)", "location_id (FK)", "measure_type_id (FK)", "tag_code", "min_value", "max_value"],
            &[
                vec![Data::Float(1.0), Data::Float(1.0), Data::Float(1.0), Data::Float(1.0), s("T1"), Data::Float(0.0), Data::Float(100.0)],
                vec![Data::Float(2.0), Data::Float(1.0), Data::Float(1.0), Data::Float(1.0), s("T2")],
            ],
        );
        workbook.save(path).unwrap();
    }

    #[tokio::test]
    async fn test_seed_workbook_into_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.xlsx");
        write_master_workbook(&path);

        let seed = read_catalog_seed(&path, DEFAULT_SHEET).unwrap();
        assert_eq!(seed.measure_types.len(), 1);
        assert_eq!(seed.locations[0].floor.as_deref(), Some("1F"));
        assert_eq!(seed.tags.len(), 2);
        assert_eq!(seed.tags[1].max_value, None);

        let (store, _db) = create_test_store().await;
        store.replace_catalog(&seed).await.unwrap();
        let mut loaded = store.load_tags().await.unwrap();
        loaded.sort_by_key(|t| t.tag_id);
        assert_eq!(loaded[0].tag_code, "T1");
        assert_eq!(loaded[0].max_value, Some(100.0));
    }

    #[test]
    fn test_wrong_sheet_is_missing_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.xlsx");
        write_master_workbook(&path);

        let err = read_catalog_seed(&path, "Sheet9").unwrap_err();
        assert!(matches!(err, SeedError::MissingTable { table: "tbl_measure_types", .. }));
    }
}
