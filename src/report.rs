//! Invocation report: a JSON record of one `hbplan run`.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::template::{InvocationRecord, InvocationResult};

#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub plan_path: String,
    pub output: String,
    pub invocations: Vec<InvocationRecord>,
    /// RFC 3339 timestamp taken when the report is built.
    pub completed_at: String,
}

impl InvocationReport {
    pub fn new(plan_path: &Path, result: InvocationResult) -> Self {
        Self {
            plan_path: plan_path.display().to_string(),
            output: result.output,
            invocations: result.invocations,
            completed_at: Utc::now().to_rfc3339(),
        }
    }

    /// Write the report as pretty JSON, creating parent directories. The
    /// file is written to a temp path first and renamed into place.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create report directory {}: {e}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        let written = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp_path, path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            anyhow::bail!("failed to write report {}: {e}", path.display());
        }
        Ok(())
    }
}
