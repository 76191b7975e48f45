//! Per-iteration CSV telemetry (spec section 6, `-c/--chart-threads` and
//! `-C/--chart-memory`), grounded on `SPEC_FULL.md` section 12: a
//! semicolon-delimited `csv` writer over `serde`-derived row structs, one
//! file per chart kind, opened once at startup and appended to every tick.

use std::fs::File;
use std::path::Path;

use libc::pid_t;
use serde::Serialize;

use crate::error::Result;
use crate::topology::NodeId;

#[derive(Clone, Debug, Serialize)]
pub struct ThreadCsvRow {
    pub tick: u64,
    pub time_s: f64,
    pub pid: pid_t,
    pub tid: pid_t,
    pub node: NodeId,
    pub cpu_use: f64,
    pub performance: f64,
    pub relative_performance: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryCsvRow {
    pub tick: u64,
    pub time_s: f64,
    pub page: u64,
    pub current_node: NodeId,
    pub majority_node: NodeId,
    pub ratio: f64,
}

pub struct CsvExporter<T: Serialize> {
    writer: csv::Writer<File>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize> CsvExporter<T> {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
        Ok(CsvExporter {
            writer,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn write_row(&mut self, row: &T) -> Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl From<csv::Error> for crate::error::Error {
    fn from(e: csv::Error) -> Self {
        crate::error::Error::Misc { inner: failure::Error::from_boxed_compat(Box::new(e)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_semicolon_delimited_thread_row() {
        let dir = std::env::temp_dir().join(format!("csv-export-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("threads.csv");

        {
            let mut exporter: CsvExporter<ThreadCsvRow> = CsvExporter::create(&path).unwrap();
            exporter
                .write_row(&ThreadCsvRow {
                    tick: 0,
                    time_s: 0.0,
                    pid: 100,
                    tid: 100,
                    node: 0,
                    cpu_use: 0.5,
                    performance: 1.2,
                    relative_performance: 1.0,
                })
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(';'));
        assert!(contents.starts_with("tick;time_s;pid;tid;node;cpu_use;performance;relative_performance"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
