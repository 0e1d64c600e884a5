//! Log initialization
//!
//! Sets up the `tracing` subscriber from the log flags: level, format
//! (plain or json), color, and output paths. Multiple output paths tee the
//! same stream to every sink.

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: String,
    pub format: String,
    pub color: bool,
    pub output_paths: Vec<String>,
    pub sampling_interval: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
            color: false,
            output_paths: Vec::new(),
            sampling_interval: Duration::from_millis(100),
        }
    }
}

/// Writer that duplicates every line to a set of sinks.
struct TeeWriter {
    sinks: Vec<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in &self.sinks {
            let mut sink = sink.lock().expect("log sink poisoned");
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &self.sinks {
            let mut sink = sink.lock().expect("log sink poisoned");
            sink.flush()?;
        }
        Ok(())
    }
}

fn open_sinks(paths: &[String]) -> Result<Vec<Arc<Mutex<Box<dyn Write + Send>>>>> {
    let mut sinks: Vec<Arc<Mutex<Box<dyn Write + Send>>>> = Vec::new();
    if paths.is_empty() {
        sinks.push(Arc::new(Mutex::new(Box::new(io::stdout()))));
        return Ok(sinks);
    }
    for path in paths {
        let sink: Box<dyn Write + Send> = match path.as_str() {
            "stdout" => Box::new(io::stdout()),
            "stderr" => Box::new(io::stderr()),
            file => Box::new(File::create(file)?),
        };
        sinks.push(Arc::new(Mutex::new(sink)));
    }
    Ok(sinks)
}

/// Install the global subscriber. Must be called once, before any log line
/// is emitted.
pub fn init(opts: &LogOptions) -> Result<()> {
    let filter = EnvFilter::try_new(&opts.level)
        .map_err(|e| TransferError::config(format!("unable to parse log level: {}", e)))?;

    let sinks = open_sinks(&opts.output_paths)?;
    let make_writer = move || TeeWriter {
        sinks: sinks.clone(),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(opts.color)
        .with_writer(make_writer);

    match opts.format.as_str() {
        "json" | "JSON" => builder
            .json()
            .try_init()
            .map_err(|e| TransferError::config(format!("log init error: {}", e)))?,
        "plain" | "console" => builder
            .try_init()
            .map_err(|e| TransferError::config(format!("log init error: {}", e)))?,
        other => {
            return Err(TransferError::config(format!(
                "unable to parse log format: {}",
                other
            )))
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tee_writer_writes_all_sinks() {
        let a: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(Box::new(Vec::new())));
        let b: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(Box::new(Vec::new())));
        let mut tee = TeeWriter {
            sinks: vec![a, b],
        };
        tee.write_all(b"hello").unwrap();
        tee.flush().unwrap();
    }

    #[test]
    fn test_default_options() {
        let opts = LogOptions::default();
        assert_eq!(opts.level, "info");
        assert_eq!(opts.format, "plain");
        assert!(opts.output_paths.is_empty());
    }
}
