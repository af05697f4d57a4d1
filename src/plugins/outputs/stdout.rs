use async_trait::async_trait;
use tokio::io::{self, AsyncWriteExt, Stdout as TokioStdout};

use crate::config::PluginOptions;
use crate::error::{ConfigError, ConfigResult, OutputResult};
use crate::plugin::Output;
use crate::registry::BuildContext;

/// Writes serialized payloads to standard output.
#[derive(Debug)]
pub struct Stdout {
    out: TokioStdout,
}

impl Stdout {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }

    pub fn build(options: &PluginOptions, _ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Output>> {
        if !options.is_empty() {
            return Err(ConfigError::invalid_options("stdout", "takes no options"));
        }
        Ok(Box::new(Self::new()))
    }
}

impl Default for Stdout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Output for Stdout {
    fn description(&self) -> &str {
        "Write metrics to standard output"
    }

    async fn write(&mut self, payload: &[u8]) -> OutputResult<()> {
        self.out.write_all(payload).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> OutputResult<()> {
        self.out.flush().await?;
        Ok(())
    }
}
