//! Result table and output materialization
//!
//! The engine's dense per-term matrices become a sparse table with one row
//! per `(date, asset)` pair that is alive and passes the screen. Rows are
//! ordered by date, then ascending asset id.

use crate::error::{PipelineError, Result};
use crate::matrix::LabeledMatrix;
use crate::pipeline::cache::TermOutput;
use crate::types::{AssetId, Date};
use serde::Serialize;
use std::io::Write;

/// Row label of a [`ResultTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RowKey {
    pub date: Date,
    pub asset: AssetId,
}

/// Values of one output column
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    /// Numeric cells; `None` = undefined for that row
    Factor(Vec<Option<f64>>),
    Filter(Vec<bool>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Factor(values) => values.len(),
            ColumnData::Filter(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, row: usize) -> Option<Cell> {
        match self {
            ColumnData::Factor(values) => values.get(row).map(|v| Cell::Factor(*v)),
            ColumnData::Filter(values) => values.get(row).map(|v| Cell::Filter(*v)),
        }
    }
}

/// One value of the result table
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Factor(Option<f64>),
    Filter(bool),
}

impl Cell {
    /// Numeric value, if defined
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Factor(value) => *value,
            Cell::Filter(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Filter(value) => Some(*value),
            Cell::Factor(_) => None,
        }
    }

    fn to_csv_field(self) -> String {
        match self {
            Cell::Factor(Some(value)) => value.to_string(),
            Cell::Factor(None) => String::new(),
            Cell::Filter(value) => value.to_string(),
        }
    }
}

/// Named output column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultColumn {
    pub name: String,
    pub data: ColumnData,
}

/// Final per-date, per-asset table of one execution request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTable {
    rows: Vec<RowKey>,
    columns: Vec<ResultColumn>,
}

/// Borrowed view of one result row
#[derive(Debug, Clone, Copy)]
pub struct ResultRow<'a> {
    table: &'a ResultTable,
    index: usize,
}

impl<'a> ResultRow<'a> {
    pub fn date(&self) -> Date {
        self.table.rows[self.index].date
    }

    pub fn asset(&self) -> AssetId {
        self.table.rows[self.index].asset
    }

    pub fn get(&self, column: &str) -> Option<Cell> {
        self.table.column(column)?.cell(self.index)
    }

    /// Cells in column order
    pub fn cells(&self) -> Vec<Cell> {
        self.table
            .columns
            .iter()
            .filter_map(|c| c.data.cell(self.index))
            .collect()
    }
}

impl ResultTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> &[RowKey] {
        &self.rows
    }

    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.data)
    }

    pub fn factor_column(&self, name: &str) -> Option<&[Option<f64>]> {
        match self.column(name)? {
            ColumnData::Factor(values) => Some(values),
            ColumnData::Filter(_) => None,
        }
    }

    pub fn filter_column(&self, name: &str) -> Option<&[bool]> {
        match self.column(name)? {
            ColumnData::Filter(values) => Some(values),
            ColumnData::Factor(_) => None,
        }
    }

    pub fn row(&self, index: usize) -> Option<ResultRow<'_>> {
        (index < self.rows.len()).then_some(ResultRow { table: self, index })
    }

    pub fn rows(&self) -> impl Iterator<Item = ResultRow<'_>> + '_ {
        (0..self.rows.len()).map(move |index| ResultRow { table: self, index })
    }

    /// Cell lookup by label
    pub fn get(&self, date: Date, asset: AssetId, column: &str) -> Option<Cell> {
        let index = self.rows.binary_search(&RowKey { date, asset }).ok()?;
        self.column(column)?.cell(index)
    }

    /// Distinct dates with at least one row
    pub fn dates(&self) -> Vec<Date> {
        let mut dates: Vec<Date> = self.rows.iter().map(|k| k.date).collect();
        dates.dedup();
        dates
    }

    /// Assets with a row on `date`, ascending
    pub fn assets_on(&self, date: Date) -> Vec<AssetId> {
        let lo = self.rows.partition_point(|k| k.date < date);
        let hi = self.rows.partition_point(|k| k.date <= date);
        self.rows[lo..hi].iter().map(|k| k.asset).collect()
    }

    /// Write as CSV: `date,asset,<columns...>`, undefined cells left empty
    pub fn to_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = vec!["date".to_string(), "asset".to_string()];
        header.extend(self.columns.iter().map(|c| c.name.clone()));
        csv_writer.write_record(&header)?;

        for row in self.rows() {
            let mut record = vec![row.date().to_string(), row.asset().to_string()];
            record.extend(row.cells().into_iter().map(Cell::to_csv_field));
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Convert into a polars DataFrame with `date` and `asset` columns
    #[cfg(feature = "dataframe")]
    pub fn to_dataframe(&self) -> Result<polars::prelude::DataFrame> {
        use polars::prelude::*;

        let dates: Vec<chrono::NaiveDate> = self.rows.iter().map(|k| k.date).collect();
        let assets: Vec<u64> = self.rows.iter().map(|k| k.asset).collect();
        let mut series = vec![Series::new("date", dates), Series::new("asset", assets)];
        for column in &self.columns {
            series.push(match &column.data {
                ColumnData::Factor(values) => Series::new(&column.name, values.as_slice()),
                ColumnData::Filter(values) => Series::new(&column.name, values.as_slice()),
            });
        }
        DataFrame::new(series).map_err(|e| PipelineError::InvalidData(e.to_string()))
    }
}

/// Inputs to [`materialize`], all aligned on the requested sessions
pub(crate) struct MaterializeInput<'a> {
    pub sessions: &'a [Date],
    pub assets: &'a [AssetId],
    /// Lifetimes row per requested session
    pub lifetimes: Vec<&'a [bool]>,
    pub screen: Option<&'a LabeledMatrix<bool>>,
    pub outputs: Vec<(&'a str, &'a TermOutput)>,
}

/// Build the result table: count passing rows, allocate once, then fill.
pub(crate) fn materialize(input: MaterializeInput<'_>) -> Result<ResultTable> {
    let nsessions = input.sessions.len();
    if input.lifetimes.len() != nsessions {
        return Err(PipelineError::InvalidData(format!(
            "{} lifetimes rows for {} sessions",
            input.lifetimes.len(),
            nsessions
        )));
    }

    // Offsets of the requested range inside each (possibly longer) output.
    let screen_offset = match input.screen {
        Some(screen) => Some(tail_offset(screen.nrows(), nsessions, "screen")?),
        None => None,
    };
    let output_offsets = input
        .outputs
        .iter()
        .map(|(name, out)| tail_offset(out.nrows(), nsessions, name))
        .collect::<Result<Vec<_>>>()?;

    let passing: Vec<Vec<usize>> = (0..nsessions)
        .map(|r| {
            let alive = input.lifetimes[r];
            let screen_row = input
                .screen
                .zip(screen_offset)
                .map(|(screen, offset)| screen.row(offset + r));
            (0..input.assets.len())
                .filter(|c| alive[*c] && screen_row.map_or(true, |s| s[*c]))
                .collect()
        })
        .collect();
    let total: usize = passing.iter().map(Vec::len).sum();

    let mut rows = Vec::with_capacity(total);
    for (r, cols) in passing.iter().enumerate() {
        rows.extend(cols.iter().map(|c| RowKey {
            date: input.sessions[r],
            asset: input.assets[*c],
        }));
    }

    let columns = input
        .outputs
        .iter()
        .zip(&output_offsets)
        .map(|((name, out), offset)| {
            let data = match out {
                TermOutput::Float(m) => {
                    let mut values = Vec::with_capacity(total);
                    for (r, cols) in passing.iter().enumerate() {
                        let row = m.row(offset + r);
                        values.extend(cols.iter().map(|c| Some(row[*c]).filter(|v| !v.is_nan())));
                    }
                    ColumnData::Factor(values)
                }
                TermOutput::Bool(m) => {
                    let mut values = Vec::with_capacity(total);
                    for (r, cols) in passing.iter().enumerate() {
                        let row = m.row(offset + r);
                        values.extend(cols.iter().map(|c| row[*c]));
                    }
                    ColumnData::Filter(values)
                }
            };
            ResultColumn {
                name: (*name).to_string(),
                data,
            }
        })
        .collect();

    Ok(ResultTable { rows, columns })
}

fn tail_offset(nrows: usize, nsessions: usize, name: &str) -> Result<usize> {
    nrows.checked_sub(nsessions).ok_or_else(|| {
        PipelineError::InvalidData(format!(
            "{} has {} rows, {} sessions requested",
            name, nrows, nsessions
        ))
    })
}
