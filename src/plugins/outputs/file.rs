use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::PluginOptions;
use crate::error::{ConfigError, ConfigResult, OutputError, OutputResult};
use crate::plugin::Output;
use crate::registry::BuildContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOutputOptions {
    /// Files every payload is appended to
    pub files: Vec<PathBuf>,
    /// Truncate the files when the output connects
    #[serde(default)]
    pub truncate: bool,
}

/// Appends payloads to one or more files.
#[derive(Debug)]
pub struct FileOutput {
    name: String,
    options: FileOutputOptions,
    handles: Vec<File>,
}

impl FileOutput {
    pub fn new(name: impl Into<String>, options: FileOutputOptions) -> Self {
        Self {
            name: name.into(),
            options,
            handles: Vec::new(),
        }
    }

    pub fn build(options: &PluginOptions, ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Output>> {
        let options: FileOutputOptions = options.deserialize(ctx.name)?;
        if options.files.is_empty() {
            return Err(ConfigError::invalid_options(ctx.name, "at least one file is required"));
        }
        Ok(Box::new(Self::new(ctx.name, options)))
    }

    async fn open(&mut self) -> OutputResult<()> {
        let mut handles = Vec::with_capacity(self.options.files.len());
        for path in &self.options.files {
            let mut open = OpenOptions::new();
            open.create(true);
            if self.options.truncate {
                open.write(true).truncate(true);
            } else {
                open.append(true);
            }
            let file = open.open(path).await.map_err(|e| OutputError::ConnectionFailed {
                name: self.name.clone(),
                message: format!("{}: {}", path.display(), e),
            })?;
            handles.push(file);
        }
        self.handles = handles;
        debug!(target: "conduit::output", output = %self.name, files = self.handles.len(), "Files opened");
        Ok(())
    }
}

#[async_trait]
impl Output for FileOutput {
    fn description(&self) -> &str {
        "Write metrics to files"
    }

    async fn connect(&mut self) -> OutputResult<()> {
        self.open().await
    }

    async fn write(&mut self, payload: &[u8]) -> OutputResult<()> {
        if self.handles.is_empty() {
            self.open().await?;
        }
        for file in &mut self.handles {
            file.write_all(payload).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> OutputResult<()> {
        for file in &mut self.handles {
            file.sync_all().await?;
        }
        self.handles.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_appends_to_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.out");
        let b = dir.path().join("b.out");
        std::fs::write(&a, "old\n").unwrap();

        let mut out = FileOutput::new(
            "file",
            FileOutputOptions {
                files: vec![a.clone(), b.clone()],
                truncate: false,
            },
        );
        out.connect().await.unwrap();
        out.write(b"one\n").await.unwrap();
        out.write(b"two\n").await.unwrap();
        out.close().await.unwrap();

        assert_eq!(std::fs::read_to_string(&a).unwrap(), "old\none\ntwo\n");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_truncate_and_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.out");
        std::fs::write(&a, "old\n").unwrap();

        let mut out = FileOutput::new(
            "file",
            FileOutputOptions {
                files: vec![a.clone()],
                truncate: true,
            },
        );
        out.write(b"new\n").await.unwrap();
        out.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "new\n");

        let mut broken = FileOutput::new(
            "file",
            FileOutputOptions {
                files: vec![dir.path().join("missing/dir/x.out")],
                truncate: false,
            },
        );
        let err = broken.connect().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
