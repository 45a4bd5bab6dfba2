//! File persistence
//!
//! Pretty JSON dumps of the cache and a JSONL recorder that appends every
//! tick of a symbol to its own file.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::handler::TickHandler;
use crate::tick::{Symbol, Tick};

/// Write `value` as pretty JSON, creating parent directories as needed
pub async fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| StreamError::SerializationError(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, body).await?;
    Ok(())
}

/// Appends one JSON line per tick to `<dir>/<SYMBOL>_streaming_data.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlRecorder {
    dir: PathBuf,
}

impl JsonlRecorder {
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Recording ticks");
        Ok(Self { dir })
    }

    pub fn path_for(&self, symbol: &Symbol) -> PathBuf {
        self.dir.join(format!("{}_streaming_data.jsonl", symbol))
    }

    async fn append(&self, tick: &Tick) -> Result<()> {
        let mut line = tick.to_json()?;
        line.push('\n');

        let path = self.path_for(&tick.symbol);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(symbol = %tick.symbol, path = %path.display(), "Recorded tick");
        Ok(())
    }
}

#[async_trait]
impl TickHandler for JsonlRecorder {
    async fn on_tick(&self, tick: &Tick) -> anyhow::Result<()> {
        self.append(tick).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_recorder_appends_lines_per_symbol() {
        let dir = tempdir().unwrap();
        let recorder = JsonlRecorder::create(dir.path().join("ticks")).await.unwrap();
        let aapl = Symbol::parse("AAPL").unwrap();
        let tsla = Symbol::parse("TSLA").unwrap();

        for last in [dec!(150.25), dec!(150.50)] {
            let tick = Tick {
                last: Some(last),
                ..Tick::new(aapl.clone())
            };
            recorder.on_tick(&tick).await.unwrap();
        }
        assert_ok!(recorder.on_tick(&Tick::new(tsla.clone())).await);

        let aapl_path = recorder.path_for(&aapl);
        assert!(aapl_path.ends_with("AAPL_streaming_data.jsonl"));

        let content = std::fs::read_to_string(&aapl_path).unwrap();
        let lines: Vec<Tick> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].last, Some(dec!(150.50)));

        let tsla_content = std::fs::read_to_string(recorder.path_for(&tsla)).unwrap();
        assert_eq!(tsla_content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_write_json_is_pretty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tick.json");
        let tick = Tick::new(Symbol::parse("AAPL").unwrap());

        assert_ok!(write_json(&tick, &path).await);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\n  \"symbol\": \"AAPL\""));
        assert_eq!(serde_json::from_str::<Tick>(&content).unwrap(), tick);
    }

    #[tokio::test]
    async fn test_write_json_reports_io_errors() {
        let dir = tempdir().unwrap();
        // A directory cannot be overwritten by a file
        let err = assert_err!(write_json(&1u8, dir.path()).await);
        assert!(matches!(err, StreamError::Persistence(_)));
    }
}
