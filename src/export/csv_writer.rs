use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::classifier::ClassifiedFlow;
use crate::processor::features::{csv_header, identifier_fields};

/// One row per terminated flow, header first.
pub struct FlowCsvWriter<W: Write> {
    writer: csv::Writer<W>,
    class_names: Vec<String>,
    unscored_label: String,
    rows: u64,
}

impl FlowCsvWriter<File> {
    /// Creates (truncates) `path` and writes the header row.
    pub fn create<P: AsRef<Path>>(
        path: P,
        class_names: Vec<String>,
        unscored_label: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("create CSV output {}", path.display()))?;
        Self::new(file, class_names, unscored_label)
    }
}

impl<W: Write> FlowCsvWriter<W> {
    pub fn new(inner: W, class_names: Vec<String>, unscored_label: &str) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(csv_header()).context("write CSV header")?;
        writer.flush().context("flush CSV header")?;
        Ok(Self {
            writer,
            class_names,
            unscored_label: unscored_label.to_string(),
            rows: 0,
        })
    }

    pub fn write_flow(&mut self, flow: &ClassifiedFlow) -> Result<()> {
        let record = &flow.flow.record;
        let row = identifier_fields(record)
            .into_iter()
            .chain(flow.features.to_fields())
            .chain(std::iter::once(flow.label(&self.class_names, &self.unscored_label)));

        self.writer
            .write_record(row)
            .with_context(|| format!("write CSV row for {}", record.key))?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("flush CSV output")
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}
