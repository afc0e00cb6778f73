//! Decoder for the fixed wide-format monitoring export.
//!
//! Layout: one header row of tag codes starting at a given column and
//! repeating every `tag_column_stride` columns (value, quality flag, value,
//! ...), then one data row per timestamp with the date and time in their own
//! columns. Bad cells and rows come out of the iterator as `DecodeSkip`
//! items instead of failing the file.

use std::collections::VecDeque;
use std::path::Path;

use calamine::{open_workbook, Data, Range, Reader, Xlsx, XlsxError};
use chrono::{TimeZone, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use super::catalog::TagCatalog;
use super::cell::{CellError, CellValue};
use crate::config::LayoutConfig;
use crate::models::{RawReading, TagDescriptor};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Cannot open workbook: {0}")]
    Workbook(#[from] XlsxError),
    #[error("Workbook has no worksheets")]
    NoWorksheet,
    #[error("Invalid column reference {0:?}")]
    InvalidColumn(String),
    #[error("Invalid layout: {0}")]
    InvalidLayout(&'static str),
}

/// Sheet positions, all 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    pub tag_header_row: u32,
    pub data_start_row: u32,
    pub date_column: u32,
    pub time_column: u32,
    pub tag_start_column: u32,
    pub tag_column_stride: u32,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            tag_header_row: 36,
            data_start_row: 40,
            date_column: 1,
            time_column: 2,
            tag_start_column: 4,
            tag_column_stride: 2,
        }
    }
}

impl SheetLayout {
    pub fn from_config(config: &LayoutConfig) -> Result<Self, DecodeError> {
        if config.tag_row == 0 || config.data_start_row == 0 {
            return Err(DecodeError::InvalidLayout("rows are 1-based"));
        }
        if config.tag_column_stride == 0 {
            return Err(DecodeError::InvalidLayout("tag column stride must be at least 1"));
        }

        Ok(Self {
            tag_header_row: config.tag_row,
            data_start_row: config.data_start_row,
            date_column: column_index(&config.date_column)?,
            time_column: column_index(&config.time_column)?,
            tag_start_column: column_index(&config.tag_start_column)?,
            tag_column_stride: config.tag_column_stride,
        })
    }
}

/// Spreadsheet column letters to a 1-based index: "A" → 1, "AA" → 27
pub fn column_index(letters: &str) -> Result<u32, DecodeError> {
    let letters = letters.trim();
    if letters.is_empty() || letters.len() > 3 {
        return Err(DecodeError::InvalidColumn(letters.to_string()));
    }

    letters.chars().try_fold(0u32, |acc, c| {
        if c.is_ascii_alphabetic() {
            Ok(acc * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1))
        } else {
            Err(DecodeError::InvalidColumn(letters.to_string()))
        }
    })
}

/// Load the first worksheet of an `.xlsx`/`.xlsm` workbook
pub fn open_first_sheet(path: &Path) -> Result<Range<Data>, DecodeError> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(DecodeError::NoWorksheet)??;
    Ok(range)
}

/// A header column whose tag code is in the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct TagColumn {
    /// 1-based column index
    pub column: u32,
    pub descriptor: TagDescriptor,
}

/// A unit of data the decoder could not turn into a reading
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeSkip {
    /// The row's timestamp could not be built; the whole row is dropped
    Row { row: u32, reason: CellError },
    /// One value cell could not be read as a number
    Cell {
        row: u32,
        column: u32,
        tag_code: String,
        reason: CellError,
    },
}

fn cell_at(range: &Range<Data>, row: u32, column: u32) -> CellValue {
    // Callers pass 1-based positions; calamine addresses are 0-based
    range
        .get_value((row - 1, column - 1))
        .map(CellValue::from)
        .unwrap_or(CellValue::Empty)
}

/// Lazy iterator of readings over one worksheet.
///
/// Consumes the sheet as it goes; decode the file again to start over.
pub struct SheetDecoder {
    range: Range<Data>,
    layout: SheetLayout,
    columns: Vec<TagColumn>,
    unrecognized: Vec<(u32, String)>,
    next_row: u32,
    last_row: u32,
    pending: VecDeque<Result<RawReading, DecodeSkip>>,
    rows_seen: usize,
}

impl SheetDecoder {
    /// Scan the header row against `catalog` and position at the first data row
    pub fn new(range: Range<Data>, layout: SheetLayout, catalog: &TagCatalog) -> Self {
        let (last_row, last_column) = range
            .end()
            .map(|(row, column)| (row + 1, column + 1))
            .unwrap_or((0, 0));

        let mut columns = Vec::new();
        let mut unrecognized = Vec::new();
        if last_column >= layout.tag_start_column {
            for column in (layout.tag_start_column..=last_column)
                .step_by(layout.tag_column_stride as usize)
            {
                let Some(code) = cell_at(&range, layout.tag_header_row, column).header_text() else {
                    continue;
                };
                match catalog.lookup(&code) {
                    Some(descriptor) => columns.push(TagColumn {
                        column,
                        descriptor: descriptor.clone(),
                    }),
                    None => unrecognized.push((column, code)),
                }
            }
        }

        Self {
            range,
            layout,
            columns,
            unrecognized,
            next_row: layout.data_start_row,
            last_row,
            pending: VecDeque::new(),
            rows_seen: 0,
        }
    }

    pub fn columns(&self) -> &[TagColumn] {
        &self.columns
    }

    /// Header codes not in the catalog, with their 1-based column
    pub fn unrecognized(&self) -> &[(u32, String)] {
        &self.unrecognized
    }

    /// Data rows with both a date and a time cell visited so far
    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }

    fn decode_row(&mut self, row: u32) {
        let date = cell_at(&self.range, row, self.layout.date_column);
        let time = cell_at(&self.range, row, self.layout.time_column);
        if date.is_empty() || time.is_empty() {
            return;
        }
        self.rows_seen += 1;

        let timestamp = match date
            .to_date()
            .and_then(|d| time.to_time().map(|t| d.and_time(t)))
        {
            Ok(naive) => Utc.from_utc_datetime(&naive),
            Err(reason) => {
                self.pending.push_back(Err(DecodeSkip::Row { row, reason }));
                return;
            }
        };

        for tag in &self.columns {
            let cell = cell_at(&self.range, row, tag.column);
            if cell.is_empty() {
                continue;
            }
            let item = match cell.to_number() {
                Ok(value) => Ok(RawReading {
                    timestamp,
                    tag_code: tag.descriptor.tag_code.clone(),
                    value: Some(value),
                }),
                Err(reason) => Err(DecodeSkip::Cell {
                    row,
                    column: tag.column,
                    tag_code: tag.descriptor.tag_code.clone(),
                    reason,
                }),
            };
            self.pending.push_back(item);
        }
    }
}

impl Iterator for SheetDecoder {
    type Item = Result<RawReading, DecodeSkip>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.next_row > self.last_row {
                return None;
            }
            let row = self.next_row;
            self.next_row += 1;
            self.decode_row(row);
        }
    }
}

/// Readings per message handed from the decoding thread to the writer
pub const DECODE_CHUNK: usize = 1024;

/// What the decoding thread sends while it walks a sheet
#[derive(Debug)]
pub enum DecodeEvent {
    /// Sent once, before any items
    Header {
        columns: usize,
        unrecognized: Vec<(u32, String)>,
    },
    Items(Vec<Result<RawReading, DecodeSkip>>),
}

/// Open and decode `path` on the calling thread, streaming results to `tx`.
///
/// Blocks on the channel, so run it under `spawn_blocking`. Stops early when the
/// receiver is dropped. Returns the number of data rows walked.
pub fn decode_file(
    path: &Path,
    layout: SheetLayout,
    catalog: &TagCatalog,
    tx: mpsc::Sender<DecodeEvent>,
) -> Result<usize, DecodeError> {
    let range = open_first_sheet(path)?;
    let mut decoder = SheetDecoder::new(range, layout, catalog);

    let header = DecodeEvent::Header {
        columns: decoder.columns().len(),
        unrecognized: decoder.unrecognized().to_vec(),
    };
    if tx.blocking_send(header).is_err() {
        return Ok(0);
    }

    let mut chunk = Vec::with_capacity(DECODE_CHUNK);
    for item in decoder.by_ref() {
        chunk.push(item);
        if chunk.len() >= DECODE_CHUNK {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(DECODE_CHUNK));
            if tx.blocking_send(DecodeEvent::Items(full)).is_err() {
                return Ok(decoder.rows_seen());
            }
        }
    }
    if !chunk.is_empty() {
        // Receiver gone is the same early stop as above
        let _ = tx.blocking_send(DecodeEvent::Items(chunk));
    }

    Ok(decoder.rows_seen())
}
