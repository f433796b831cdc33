use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;

/// Writes per-run JSON documents named `{artifact-kind}-{timestamp}.json`
/// into a working directory. Shapes are informational, not contract.
#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn write<T: Serialize>(&self, kind: &str, value: &T) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating artifact dir {}", self.dir.display()))?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let path = self.dir.join(format!("{kind}-{timestamp}.json"));
        let body = serde_json::to_vec_pretty(value).context("serialising artifact")?;
        fs::write(&path, body)
            .with_context(|| format!("writing artifact {}", path.display()))?;

        tracing::info!(target: "runner", artifact = %path.display(), "artifact written");
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn artifacts_land_with_kind_and_timestamp_in_name() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path());

        let path = writer
            .write("health-report", &json!({"status": "healthy"}))
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("health-report-"));
        assert!(name.ends_with(".json"));

        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("reports/daily");
        let writer = ArtifactWriter::new(&nested);
        writer.write("rollback-report", &json!({})).unwrap();
        assert!(nested.exists());
    }
}
