//! Text and JSON reports of evaluation outcomes.

use std::collections::BTreeMap;
use std::fmt;

use crate::outcome::Outcome;

/// Trait for text data table sources.
///
/// Tables can be formatted using [`Table::display`] to get a wrapper that
/// implements [`Display`](fmt::Display).
trait Table {
    /// Return the number of rows in this table.
    fn rows(&self) -> usize;

    /// Return the column headings for this table. This also determines the
    /// number of columns.
    fn headings(&self) -> &[&str];

    /// Return the text for a given table cell.
    fn cell(&self, row: usize, col: usize) -> String;

    /// Return the maximum number of characters used by any entry in column
    /// `col`.
    fn max_width(&self, col: usize) -> usize {
        (0..self.rows())
            .map(|row| self.cell(row, col).chars().count())
            .max()
            .unwrap_or(0)
    }

    /// Return a wrapper around this table which implements `Display`.
    fn display(&self, indent: usize) -> DisplayTable<'_, Self>
    where
        Self: Sized,
    {
        DisplayTable {
            table: self,
            indent,
        }
    }
}

struct DisplayTable<'a, T: Table> {
    table: &'a T,
    indent: usize,
}

impl<T: Table> fmt::Display for DisplayTable<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let col_widths: Vec<_> = self
            .table
            .headings()
            .iter()
            .enumerate()
            .map(|(col, heading)| heading.len().max(self.table.max_width(col)))
            .collect();
        let col_padding = 2;
        let last_col = col_widths.len().saturating_sub(1);

        let write_indent =
            |f: &mut fmt::Formatter<'_>| write!(f, "{:<indent$}", "", indent = self.indent);

        write_indent(f)?;
        for (col, (heading, width)) in self.table.headings().iter().zip(&col_widths).enumerate() {
            if col == last_col {
                write!(f, "{}", heading)?;
            } else {
                write!(f, "{:<width$}", heading, width = width + col_padding)?;
            }
        }
        writeln!(f)?;
        write_indent(f)?;
        for (col, width) in col_widths.iter().enumerate() {
            let padding = if col == last_col { 0 } else { col_padding };
            write!(f, "{:-<width$}{:<padding$}", "", "", width = width, padding = padding)?;
        }
        writeln!(f)?;

        for row in 0..self.table.rows() {
            write_indent(f)?;
            for (col, width) in col_widths.iter().enumerate() {
                let cell = self.table.cell(row, col);
                if col == last_col {
                    write!(f, "{}", cell)?;
                } else {
                    write!(f, "{:<width$}", cell, width = width + col_padding)?;
                }
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

fn format_diff(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.3e}", value),
        None => String::new(),
    }
}

/// Table with one row per outcome.
pub struct OutcomeTable<'a> {
    outcomes: &'a [Outcome],
}

impl<'a> OutcomeTable<'a> {
    pub fn new(outcomes: &'a [Outcome]) -> OutcomeTable<'a> {
        OutcomeTable { outcomes }
    }
}

impl Table for OutcomeTable<'_> {
    fn rows(&self) -> usize {
        self.outcomes.len()
    }

    fn headings(&self) -> &[&str] {
        &["name", "dynamic", "exporter", "success", "error_step", "abs", "rel"]
    }

    fn cell(&self, row: usize, col: usize) -> String {
        let outcome = &self.outcomes[row];
        match col {
            0 => outcome.name.clone().unwrap_or_default(),
            1 => outcome
                .dynamic
                .map(|dynamic| (dynamic as u8).to_string())
                .unwrap_or_default(),
            2 => outcome.exporter.clone().unwrap_or_default(),
            3 => (outcome.success as u8).to_string(),
            4 => outcome
                .error_step
                .map(|step| step.to_string())
                .unwrap_or_default(),
            5 => format_diff(outcome.abs),
            6 => format_diff(outcome.rel),
            _ => String::new(),
        }
    }
}

impl fmt::Display for OutcomeTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display(0))
    }
}

/// Success counts of one exporter, with or without dynamic shapes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExporterSummary {
    pub exporter: String,
    pub dynamic: bool,
    pub runs: usize,
    pub successes: usize,

    /// Number of failures for each error step, eg. "export".
    pub failures: BTreeMap<String, usize>,
}

/// Aggregate outcomes by exporter and dynamic flag, in exporter name order.
pub fn summarize(outcomes: &[Outcome]) -> Vec<ExporterSummary> {
    let mut groups: BTreeMap<(String, bool), ExporterSummary> = BTreeMap::new();
    for outcome in outcomes {
        let exporter = outcome.exporter.clone().unwrap_or_default();
        let dynamic = outcome.dynamic.unwrap_or(false);
        let summary = groups
            .entry((exporter.clone(), dynamic))
            .or_insert_with(|| ExporterSummary {
                exporter,
                dynamic,
                ..Default::default()
            });
        summary.runs += 1;
        if outcome.success {
            summary.successes += 1;
        } else {
            // Re-check failures are counted together regardless of example.
            let step = match outcome.error_step {
                Some(step) => step.to_string(),
                None => "?".to_string(),
            };
            let step = step.split('.').next().unwrap_or_default().to_string();
            *summary.failures.entry(step).or_insert(0) += 1;
        }
    }
    groups.into_values().collect()
}

/// Table with one row per exporter and dynamic flag.
pub struct SummaryTable {
    summaries: Vec<ExporterSummary>,
}

impl SummaryTable {
    pub fn new(outcomes: &[Outcome]) -> SummaryTable {
        SummaryTable {
            summaries: summarize(outcomes),
        }
    }
}

impl Table for SummaryTable {
    fn rows(&self) -> usize {
        self.summaries.len()
    }

    fn headings(&self) -> &[&str] {
        &["exporter", "dynamic", "success", "failures"]
    }

    fn cell(&self, row: usize, col: usize) -> String {
        let summary = &self.summaries[row];
        match col {
            0 => summary.exporter.clone(),
            1 => (summary.dynamic as u8).to_string(),
            2 => format!("{}/{}", summary.successes, summary.runs),
            3 => summary
                .failures
                .iter()
                .map(|(step, count)| format!("{}={}", step, count))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

impl fmt::Display for SummaryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display(0))
    }
}

/// Serialize outcomes as a JSON array of flat records.
pub fn outcomes_to_json(outcomes: &[Outcome]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(outcomes)
}

#[cfg(test)]
mod tests {
    use super::{outcomes_to_json, summarize, OutcomeTable, SummaryTable};
    use crate::outcome::{ErrorStep, Outcome};

    fn outcomes() -> Vec<Outcome> {
        let mut ok = Outcome {
            success: true,
            abs: Some(0.),
            rel: Some(0.),
            ..Default::default()
        };
        ok.identify("linear", false, "custom");

        let mut export = Outcome::failure(ErrorStep::Export, "boom");
        export.identify("linear", true, "custom");

        let mut diff = Outcome::failure(ErrorStep::Diff(1), "diff.1");
        diff.abs = Some(0.5);
        diff.identify("scalar_arg", true, "custom");

        vec![ok, export, diff]
    }

    #[test]
    fn test_outcome_table() {
        let text = OutcomeTable::new(&outcomes()).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2 + 3);
        assert!(lines[0].starts_with("name        dynamic  exporter  success  error_step  abs"));
        assert!(lines[1].starts_with("----------  -------"));
        assert!(lines[2].starts_with("linear      0        custom    1"));
        assert!(lines[4].contains("diff.1"));
        assert!(lines[4].contains("5.000e-1"));
    }

    #[test]
    fn test_summary() {
        let summaries = summarize(&outcomes());
        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].dynamic);
        assert_eq!(summaries[0].successes, 1);
        assert_eq!(summaries[1].runs, 2);
        assert_eq!(summaries[1].failures.get("export"), Some(&1));
        assert_eq!(summaries[1].failures.get("diff"), Some(&1));

        let text = SummaryTable::new(&outcomes()).to_string();
        assert!(text.contains("diff=1 export=1"));
    }

    #[test]
    fn test_json() {
        let json = outcomes_to_json(&outcomes()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[1]["error_step"], "export");
        assert_eq!(value[1]["dynamic"], 1);
        assert_eq!(value[0]["success"], 1);
    }
}
