//! Finalization worker processes.
//!
//! Each finalizing record is handed to a transient child process whose
//! sole task is to run the finalizers; the parent keeps ingesting and
//! joins outstanding children at the next archive flush. Tests (and the
//! `finalize-worker` child itself) can run the same work in-process.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("finalization of {record} failed: {detail}")]
    Failed { record: PathBuf, detail: String },
}

/// How records get finalized.
#[derive(Debug, Clone)]
pub enum FinalizeMode {
    /// Run the finalizers inline (tests, and the worker child itself).
    InProcess,
    /// Spawn `<exe> finalize-worker --record <path>` per record.
    Worker { exe: PathBuf },
}

/// A finalization in flight.
pub struct FinalizeChild {
    record_path: PathBuf,
    child: Option<Child>,
}

/// Begin finalizing a record directory.
pub fn start_finalize(mode: &FinalizeMode, record_path: &Path) -> Result<FinalizeChild, WorkerError> {
    match mode {
        FinalizeMode::InProcess => {
            crate::finalize::finalize_record(record_path).map_err(|e| WorkerError::Failed {
                record: record_path.to_path_buf(),
                detail: e.to_string(),
            })?;
            Ok(FinalizeChild {
                record_path: record_path.to_path_buf(),
                child: None,
            })
        }
        FinalizeMode::Worker { exe } => {
            let child = Command::new(exe)
                .arg("finalize-worker")
                .arg("--record")
                .arg(record_path)
                .stdin(Stdio::null())
                .spawn()?;
            Ok(FinalizeChild {
                record_path: record_path.to_path_buf(),
                child: Some(child),
            })
        }
    }
}

impl FinalizeChild {
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Wait for the child and surface a non-zero exit as an error.
    pub fn join(mut self) -> Result<(), WorkerError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(WorkerError::Failed {
                record: self.record_path.clone(),
                detail: format!("worker exited with {status}"),
            })
        }
    }
}
