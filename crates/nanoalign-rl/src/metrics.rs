//! Append-only per-iteration PPO metrics (JSON lines or CSV).

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nanoalign_core::MetricsFormat;

use crate::ppo::PpoStats;

pub struct MetricsLogger {
    format: MetricsFormat,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLogger {
    /// Create `dir` if needed and start a fresh log file inside it.
    pub fn create(dir: &Path, format: MetricsFormat) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
        let path = dir.join(format.file_name());
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if format == MetricsFormat::Csv {
            writeln!(writer, "{}", PpoStats::CSV_HEADER)?;
            writer.flush()?;
        }
        Ok(Self {
            format,
            path,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, stats: &PpoStats) -> Result<()> {
        match self.format {
            MetricsFormat::Jsonl => {
                let line = serde_json::to_string(stats)?;
                writeln!(self.writer, "{}", line)?;
            }
            MetricsFormat::Csv => writeln!(self.writer, "{}", stats.csv_row())?,
        }
        // Flushed per line so a crashed run still leaves its history.
        self.writer
            .flush()
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_one_object_per_line() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut logger = MetricsLogger::create(dir.path(), MetricsFormat::Jsonl)?;
        for i in 0..3 {
            logger.log(&PpoStats {
                iteration: i,
                mean_score: i as f64 * 0.5,
                ..Default::default()
            })?;
        }
        let text = fs::read_to_string(logger.path())?;
        let rows: Vec<PpoStats> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].iteration, 2);
        assert_eq!(rows[1].mean_score, 0.5);
        Ok(())
    }

    #[test]
    fn test_csv_has_header_and_matching_columns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut logger = MetricsLogger::create(dir.path(), MetricsFormat::Csv)?;
        logger.log(&PpoStats::default())?;
        let text = fs::read_to_string(dir.path().join("ppo_metrics.csv"))?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], PpoStats::CSV_HEADER);
        assert_eq!(
            lines[1].split(',').count(),
            PpoStats::CSV_HEADER.split(',').count()
        );
        Ok(())
    }
}
