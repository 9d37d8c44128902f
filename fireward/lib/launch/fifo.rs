use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{
    config::{FIFO_TEMP_DIR_PREFIX, LOG_FIFO_NAME, METRICS_FIFO_NAME},
    FirewardError, FirewardResult,
};

use super::ScopedResources;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The hypervisor's log and metrics pipes.
#[derive(Debug, Clone, Default)]
pub struct LogPipes {
    /// Host path of the log pipe.
    pub log_fifo: Option<PathBuf>,

    /// Host path of the metrics pipe.
    pub metrics_fifo: Option<PathBuf>,

    /// File receiving everything written to the log pipe.
    pub sink: Option<LogSink>,
}

/// A shared handle to the file that receives piped log content.
///
/// Closing the sink through any clone closes it for all of them.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LogSink {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> FirewardResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Returns the path of the sink.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `buf` to the sink. Fails once the sink is closed.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log sink lock poisoned"))?;

        match guard.as_mut() {
            Some(file) => file.write_all(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "log sink closed")),
        }
    }

    /// Flushes and closes the sink.
    pub fn close(&self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log sink lock poisoned"))?;

        match guard.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decides the log and metrics pipe paths.
///
/// A log file target and a raw log pipe are mutually exclusive. With a log file target, the log
/// pipe is synthesized and drained into the file, and the metrics pipe is synthesized unless
/// given. Without one, a missing pipe is synthesized only if the other one is given. Synthesized
/// pipes live in a private temporary directory removed when `resources` is released.
pub fn resolve_log_pipes(
    log_fifo: Option<&Path>,
    metrics_fifo: Option<&Path>,
    fifo_log_file: Option<&Path>,
    resources: &mut ScopedResources,
) -> FirewardResult<LogPipes> {
    let mut pipes = LogPipes {
        log_fifo: log_fifo.map(Path::to_path_buf),
        metrics_fifo: metrics_fifo.map(Path::to_path_buf),
        sink: None,
    };

    let (generate_log, generate_metrics) = match fifo_log_file {
        Some(target) => {
            if log_fifo.is_some() {
                return Err(FirewardError::LogOptionsConflict);
            }

            let sink = LogSink::open(target).map_err(|e| {
                FirewardError::custom(anyhow::anyhow!(
                    "failed to create fifo log file {}: {}",
                    target.display(),
                    e
                ))
            })?;

            let closing = sink.clone();
            resources.register(format!("log sink {}", target.display()), move || {
                closing.close()
            });

            pipes.sink = Some(sink);
            (true, metrics_fifo.is_none())
        }
        None if log_fifo.is_some() || metrics_fifo.is_some() => {
            (log_fifo.is_none(), metrics_fifo.is_none())
        }
        None => (false, false),
    };

    if generate_log || generate_metrics {
        let dir = tempfile::Builder::new()
            .prefix(FIFO_TEMP_DIR_PREFIX)
            .tempdir()
            .map_err(|e| {
                FirewardError::custom(anyhow::anyhow!("failed to create temporary directory: {e}"))
            })?;

        if generate_log {
            pipes.log_fifo = Some(dir.path().join(LOG_FIFO_NAME));
        }

        if generate_metrics {
            pipes.metrics_fifo = Some(dir.path().join(METRICS_FIFO_NAME));
        }

        tracing::debug!("synthesized log pipes in {}", dir.path().display());
        resources.register(format!("pipe directory {}", dir.path().display()), move || {
            dir.close()
        });
    }

    Ok(pipes)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
