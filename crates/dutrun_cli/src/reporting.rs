//! Console output for a run: a line per finished test, and a summary at the end.

use std::{io, path::Path};

use async_trait::async_trait;
use dutrun_results::{ReportClient, ReportError, TestResult};
use parking_lot::Mutex;
use termcolor::{Color, ColorSpec, WriteColor};

enum Status {
    Passed,
    Failed,
    Skipped,
}

fn status(result: &TestResult) -> Status {
    if result.failed() || !result.is_complete() {
        Status::Failed
    } else if result.skipped() {
        Status::Skipped
    } else {
        Status::Passed
    }
}

fn status_color(status: &Status) -> Color {
    match status {
        Status::Passed => Color::Green,
        Status::Failed => Color::Red,
        Status::Skipped => Color::Yellow,
    }
}

fn with_color<W>(
    writer: &mut W,
    color: Color,
    f: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()>
where
    W: WriteColor,
{
    writer.set_color(ColorSpec::new().set_fg(Some(color)))?;
    f(writer)?;
    writer.reset()
}

/// Formats a finished test on one line, followed by its errors.
pub fn format_result_line(writer: &mut impl WriteColor, result: &TestResult) -> io::Result<()> {
    write!(writer, "{}: ", result.name())?;
    let status = status(result);
    with_color(writer, status_color(&status), |w| match status {
        Status::Passed => write!(w, "ok"),
        Status::Failed => write!(w, "FAILED"),
        Status::Skipped => write!(w, "skipped ({})", result.skip_reason),
    })?;
    writeln!(writer)?;
    for error in &result.errors {
        writeln!(writer, "    {}", error.error)?;
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unstarted: usize,
}

impl Summary {
    pub fn new(results: &[TestResult], unstarted: &[String]) -> Self {
        let mut summary = Summary {
            unstarted: unstarted.len(),
            ..Default::default()
        };
        for result in results {
            match status(result) {
                Status::Passed => summary.passed += 1,
                Status::Failed => summary.failed += 1,
                Status::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

pub fn print_summary(writer: &mut impl WriteColor, summary: &Summary) -> io::Result<()> {
    writeln!(writer)?;
    write!(writer, "{} tests run: ", summary.passed + summary.failed + summary.skipped)?;
    with_color(writer, Color::Green, |w| write!(w, "{} passed", summary.passed))?;
    write!(writer, ", ")?;
    let fail_color = match summary.failed {
        0 => Color::Green,
        _ => Color::Red,
    };
    with_color(writer, fail_color, |w| write!(w, "{} failed", summary.failed))?;
    write!(writer, ", ")?;
    with_color(writer, Color::Yellow, |w| write!(w, "{} skipped", summary.skipped))?;
    writeln!(writer)?;
    if summary.unstarted > 0 {
        with_color(writer, Color::Red, |w| {
            writeln!(w, "{} tests did not run", summary.unstarted)
        })?;
    }
    Ok(())
}

/// Prints each result as it is reported.
pub struct ConsoleReportClient<W> {
    writer: Mutex<W>,
}

impl<W> ConsoleReportClient<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: WriteColor + Send> ReportClient for ConsoleReportClient<W> {
    async fn report_result(&self, result: &TestResult) -> Result<(), ReportError> {
        let mut writer = self.writer.lock();
        if let Err(error) = format_result_line(&mut *writer, result) {
            tracing::warn!(%error, "failed to print result");
        }
        Ok(())
    }

    fn new_test_log_writer(&self, _name: &str, _rel_path: &Path) -> Box<dyn io::Write + Send> {
        Box::new(io::sink())
    }
}
