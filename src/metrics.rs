use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    /// Largest pixel change from the originals.
    pub linf: f32,
    pub restored: bool,
}

/// Appends one JSON object per step to `metrics.jsonl`.
pub struct MetricsLog {
    writer: BufWriter<File>,
}

impl MetricsLog {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        tracing::debug!(
            step = metrics.step,
            loss = metrics.loss,
            lr = metrics.lr,
            linf = metrics.linf,
            restored = metrics.restored,
            "step"
        );
        serde_json::to_writer(&mut self.writer, metrics)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_json_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let logs = dir.path().join("logs");
        let mut log = MetricsLog::create(&logs)?;
        for step in 1..=2 {
            log.log(&StepMetrics {
                step,
                loss: 0.5,
                lr: 1e-5,
                linf: 0.01,
                restored: step == 2,
            })?;
        }
        log.flush()?;
        let content = std::fs::read_to_string(logs.join("metrics.jsonl"))?;
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 2);
        assert_eq!(lines[1]["restored"], true);
        assert_eq!(lines[0]["loss"], 0.5);
        Ok(())
    }
}
