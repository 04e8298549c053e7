//! Result presentation
//!
//! `table` prints one block per host on stdout. `json`, `excel` and `csv`
//! write a file named after the run's start time into the output directory.
//! The workbook merges the ID and Host cells across each host's rows; the CSV
//! carries the same columns flat, one running ID per row.

use crate::dispatcher::ResultSink;
use crate::error::{GossError, Result};
use crate::models::{RunReport, TaskResult, TaskStatus};
use crate::path_template::TIME_FORMAT;
use clap::ValueEnum;
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, XlsxError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const OUTPUT_COLUMN_WIDTH: usize = 40;
const DESCRIPTION_COLUMN_WIDTH: usize = 28;

pub const CSV_HEADERS: [&str; 8] = [
    "ID",
    "Host",
    "Task ID",
    "Task Description",
    "Task Type",
    "Task Info",
    "Output",
    "State",
];

const SHEET_NAME: &str = "Sheet1";
const SHEET_COLUMN_WIDTHS: [f64; 8] = [6.0, 20.0, 8.0, 28.0, 10.0, 40.0, 60.0, 10.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    /// `.xlsx` workbook
    Excel,
    Csv,
}

pub struct Printer {
    format: OutputFormat,
    output_dir: PathBuf,
}

impl Printer {
    pub fn new(format: OutputFormat, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            format,
            output_dir: output_dir.into(),
        }
    }

    fn output_path(&self, report: &RunReport, extension: &str) -> PathBuf {
        let stamp = report
            .started_at
            .with_timezone(&chrono::Local)
            .format(TIME_FORMAT);
        self.output_dir.join(format!("{}.{}", stamp, extension))
    }

    fn write_json(&self, report: &RunReport) -> Result<PathBuf> {
        let path = self.output_path(report, "json");
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| GossError::resource("write_results", path.display().to_string(), "cannot encode JSON").with_source(e))?;
        std::fs::create_dir_all(&self.output_dir).map_err(|e| write_error(&self.output_dir, e))?;
        std::fs::write(&path, json).map_err(|e| write_error(&path, e))?;
        Ok(path)
    }

    fn write_workbook(&self, report: &RunReport) -> Result<PathBuf> {
        let path = self.output_path(report, "xlsx");
        let workbook = write_xlsx(report).map_err(|e| write_error(&path, e))?;
        std::fs::create_dir_all(&self.output_dir).map_err(|e| write_error(&self.output_dir, e))?;
        std::fs::write(&path, workbook).map_err(|e| write_error(&path, e))?;
        Ok(path)
    }

    fn write_csv(&self, report: &RunReport) -> Result<PathBuf> {
        let path = self.output_path(report, "csv");
        std::fs::create_dir_all(&self.output_dir).map_err(|e| write_error(&self.output_dir, e))?;
        let file = std::fs::File::create(&path).map_err(|e| write_error(&path, e))?;
        write_csv(report, file).map_err(|e| write_error(&path, e))?;
        Ok(path)
    }
}

fn write_error(path: &Path, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> GossError {
    GossError::resource("write_results", path.display().to_string(), "cannot write results").with_source(err)
}

/// Text shown for a result: output on success, the error otherwise
fn result_text(result: &TaskResult) -> String {
    match &result.error {
        Some(err) if result.output.trim().is_empty() => err.to_string(),
        Some(err) => format!("{}\n{}", result.output.trim_end(), err),
        None => result.output.trim_end().to_string(),
    }
}

fn clip(text: &str, width: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= width {
        line.to_string()
    } else {
        let mut clipped: String = line.chars().take(width.saturating_sub(3)).collect();
        clipped.push_str("...");
        clipped
    }
}

/// Per-host tables followed by the run summary
pub fn write_table<W: Write>(report: &RunReport, out: &mut W) -> std::io::Result<()> {
    for set in &report.hosts {
        writeln!(
            out,
            "Host {} ({}): {} succeeded, {} failed, {} skipped",
            set.host.address(),
            set.host.user,
            set.count(TaskStatus::Success),
            set.count(TaskStatus::Failed),
            set.count(TaskStatus::Skipped)
        )?;
        writeln!(
            out,
            "{:<4} {:<9} {:<28} {:<8} {:<40} {}",
            "ID", "Type", "Description", "State", "Output", "Error"
        )?;
        writeln!(out, "{}", "-".repeat(110))?;

        for (position, result) in set.results.iter().enumerate() {
            let error = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            writeln!(
                out,
                "{:<4} {:<9} {:<28} {:<8} {:<40} {}",
                position + 1,
                result.task.task_type(),
                clip(&result.task.description, DESCRIPTION_COLUMN_WIDTH),
                result.status,
                clip(&result.output, OUTPUT_COLUMN_WIDTH),
                error
            )?;
        }
        writeln!(out)?;
    }

    let summary = &report.summary;
    writeln!(out, "Run {}", report.run_id)?;
    writeln!(out, "{:-<50}", "")?;
    writeln!(out, "Total Tasks:           {}", summary.total)?;
    writeln!(out, "Succeeded:             {}", summary.succeeded)?;
    writeln!(out, "Failed:                {}", summary.failed)?;
    writeln!(out, "Skipped:               {}", summary.skipped)?;
    writeln!(out, "Elapsed:               {:.2}s", summary.elapsed.as_secs_f64())?;
    writeln!(out, "Throughput:            {:.2} tasks/s", summary.throughput)?;
    writeln!(out, "Average Latency:       {:?}", summary.average_latency)?;
    Ok(())
}

/// Spreadsheet rows, one per (host, task)
pub fn write_csv<W: Write>(report: &RunReport, out: W) -> std::result::Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(CSV_HEADERS)?;

    let mut row = 0;
    for set in &report.hosts {
        for (position, result) in set.results.iter().enumerate() {
            row += 1;
            writer.write_record([
                row.to_string(),
                set.host.address(),
                (position + 1).to_string(),
                result.task.description.clone(),
                result.task.task_type().to_string(),
                result.task.info(),
                result_text(result),
                result.status.to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Workbook bytes, one row per (host, task) under a filled header row
pub fn write_xlsx(report: &RunReport) -> std::result::Result<Vec<u8>, XlsxError> {
    let cell = Format::new()
        .set_align(FormatAlign::Left)
        .set_align(FormatAlign::Top)
        .set_text_wrap()
        .set_border(FormatBorder::Medium);
    let header = cell
        .clone()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x3366CC));

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;
    for (col, (title, width)) in CSV_HEADERS.iter().zip(SHEET_COLUMN_WIDTHS).enumerate() {
        let col = col as u16;
        sheet.set_column_width(col, width)?;
        sheet.write_string_with_format(0, col, *title, &header)?;
    }

    let mut row: u32 = 1;
    for set in &report.hosts {
        let first = row;
        for (position, result) in set.results.iter().enumerate() {
            let values = [
                (position + 1).to_string(),
                result.task.description.clone(),
                result.task.task_type().to_string(),
                result.task.info(),
                result_text(result),
                result.status.to_string(),
            ];
            for (offset, value) in values.iter().enumerate() {
                sheet.write_string_with_format(row, 2 + offset as u16, value, &cell)?;
            }
            row += 1;
        }

        let id = (set.index + 1).to_string();
        let host = set.host.address();
        match set.results.len() {
            0 => {}
            1 => {
                sheet.write_string_with_format(first, 0, &id, &cell)?;
                sheet.write_string_with_format(first, 1, &host, &cell)?;
            }
            _ => {
                sheet.merge_range(first, 0, row - 1, 0, &id, &cell)?;
                sheet.merge_range(first, 1, row - 1, 1, &host, &cell)?;
            }
        }
    }

    workbook.save_to_buffer()
}

impl ResultSink for Printer {
    fn render(&self, report: &RunReport) -> Result<()> {
        match self.format {
            OutputFormat::Table => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                write_table(report, &mut lock).map_err(|e| write_error(Path::new("<stdout>"), e))?;
            }
            OutputFormat::Json => {
                let path = self.write_json(report)?;
                info!("Results written to {}", path.display());
            }
            OutputFormat::Excel => {
                let path = self.write_workbook(report)?;
                info!("Results written to {}", path.display());
            }
            OutputFormat::Csv => {
                let path = self.write_csv(report)?;
                info!("Results written to {}", path.display());
            }
        }
        Ok(())
    }
}
