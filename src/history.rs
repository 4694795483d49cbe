//! Per-iteration optimisation history.
//!
//! Plain text, whitespace separated: one header line, then one line per
//! driver iteration with the iteration number, objective, Lagrangian, the
//! design values and the objective sensitivities.

use crate::settings::DesignKind;
use crate::types::Result;
use std::io::Write;

/// Writer of the history table.
pub struct HistoryLog<W: Write> {
    writer: csv::Writer<W>,
    n: usize,
    header_written: bool,
    kind: DesignKind,
}

impl<W: Write> HistoryLog<W> {
    pub fn new(inner: W, n: usize, kind: DesignKind) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_writer(inner);
        Self { writer, n, header_written: false, kind }
    }

    fn write_header(&mut self) -> Result<()> {
        let label = self.kind.label();
        let mut header = Vec::with_capacity(3 + 2 * self.n);
        header.push("iter".to_string());
        header.push("objective".to_string());
        header.push("lagrangian".to_string());
        header.extend((0..self.n).map(|i| format!("{label}_{i}")));
        header.extend((0..self.n).map(|i| format!("dfd{label}_{i}")));
        self.writer.write_record(&header)?;
        self.header_written = true;
        Ok(())
    }

    /// Append one iteration.
    pub fn record(
        &mut self,
        iteration: usize,
        objective: f64,
        lagrangian: f64,
        design: &[f64],
        sensitivity: &[f64],
    ) -> Result<()> {
        if !self.header_written {
            self.write_header()?;
        }
        let mut row = Vec::with_capacity(3 + design.len() + sensitivity.len());
        row.push(iteration.to_string());
        row.push(format!("{objective:.15e}"));
        row.push(format!("{lagrangian:.15e}"));
        row.extend(design.iter().map(|v| format!("{v:.15e}")));
        row.extend(sensitivity.iter().map(|v| format!("{v:.15e}")));
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::types::OneShotError::Io(e.into_error()))
    }
}
