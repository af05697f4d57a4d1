use async_trait::async_trait;

use crate::config::PluginOptions;
use crate::error::{ConfigResult, OutputResult};
use crate::plugin::Output;
use crate::registry::BuildContext;

/// Accepts every payload and drops it.
#[derive(Debug, Default)]
pub struct Discard;

impl Discard {
    pub fn build(_options: &PluginOptions, _ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Output>> {
        Ok(Box::new(Discard))
    }
}

#[async_trait]
impl Output for Discard {
    fn description(&self) -> &str {
        "Send metrics to nowhere at all"
    }

    async fn write(&mut self, _payload: &[u8]) -> OutputResult<()> {
        Ok(())
    }
}
