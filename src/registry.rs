// ============================================================================
// SECTION 15: PLUGIN REGISTRY
// ============================================================================
// Maps a configuration `type` name to a constructor, per plugin kind. Filled
// once at startup through `RegistryBuilder`, then frozen into an immutable
// `PluginRegistry` shared by the agent.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::PluginOptions;
use crate::error::{ConfigError, ConfigResult};
use crate::plugin::{Aggregator, Input, Output, Parser, Processor, Serializer};
use crate::stats::StatsRegistry;

/// What constructors get besides their options.
pub struct BuildContext<'a> {
    /// Display name of the plugin being built
    pub name: &'a str,
    /// Live pipeline statistics
    pub stats: &'a Arc<StatsRegistry>,
    /// For plugins that need a serializer or parser of their own
    pub registry: &'a PluginRegistry,
}

pub type InputFactory = fn(&PluginOptions, &BuildContext<'_>) -> ConfigResult<Box<dyn Input>>;
pub type ProcessorFactory = fn(&PluginOptions, &BuildContext<'_>) -> ConfigResult<Box<dyn Processor>>;
pub type AggregatorFactory = fn(&PluginOptions, &BuildContext<'_>) -> ConfigResult<Box<dyn Aggregator>>;
pub type OutputFactory = fn(&PluginOptions, &BuildContext<'_>) -> ConfigResult<Box<dyn Output>>;
pub type SerializerFactory = fn(&PluginOptions) -> ConfigResult<Arc<dyn Serializer>>;
pub type ParserFactory = fn(&PluginOptions) -> ConfigResult<Arc<dyn Parser>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginKind {
    Input,
    Processor,
    Aggregator,
    Output,
    Serializer,
    Parser,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Input => "input",
            PluginKind::Processor => "processor",
            PluginKind::Aggregator => "aggregator",
            PluginKind::Output => "output",
            PluginKind::Serializer => "serializer",
            PluginKind::Parser => "parser",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Entry<F> {
    description: &'static str,
    factory: F,
}

struct Table<F> {
    kind: PluginKind,
    entries: BTreeMap<&'static str, Entry<F>>,
}

impl<F: Copy> Table<F> {
    fn new(kind: PluginKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, name: &'static str, description: &'static str, factory: F) -> ConfigResult<()> {
        if self.entries.contains_key(name) {
            return Err(ConfigError::DuplicatePlugin {
                kind: self.kind.as_str(),
                name: name.to_string(),
            });
        }
        self.entries.insert(name, Entry { description, factory });
        Ok(())
    }

    fn get(&self, name: &str) -> ConfigResult<F> {
        self.entries
            .get(name)
            .map(|e| e.factory)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                kind: self.kind.as_str(),
                name: name.to_string(),
            })
    }

    fn describe(&self) -> impl Iterator<Item = PluginInfo> + '_ {
        self.entries.iter().map(|(name, e)| PluginInfo {
            kind: self.kind,
            name: *name,
            description: e.description,
        })
    }
}

/// One listed plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginInfo {
    pub kind: PluginKind,
    pub name: &'static str,
    pub description: &'static str,
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

pub struct RegistryBuilder {
    inputs: Table<InputFactory>,
    processors: Table<ProcessorFactory>,
    aggregators: Table<AggregatorFactory>,
    outputs: Table<OutputFactory>,
    serializers: Table<SerializerFactory>,
    parsers: Table<ParserFactory>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            inputs: Table::new(PluginKind::Input),
            processors: Table::new(PluginKind::Processor),
            aggregators: Table::new(PluginKind::Aggregator),
            outputs: Table::new(PluginKind::Output),
            serializers: Table::new(PluginKind::Serializer),
            parsers: Table::new(PluginKind::Parser),
        }
    }

    /// A builder holding every plugin shipped with the crate.
    pub fn with_builtins() -> ConfigResult<Self> {
        let mut builder = Self::new();
        crate::plugins::register_builtins(&mut builder)?;
        Ok(builder)
    }

    pub fn input(&mut self, name: &'static str, description: &'static str, factory: InputFactory) -> ConfigResult<&mut Self> {
        self.inputs.insert(name, description, factory)?;
        Ok(self)
    }

    pub fn processor(
        &mut self,
        name: &'static str,
        description: &'static str,
        factory: ProcessorFactory,
    ) -> ConfigResult<&mut Self> {
        self.processors.insert(name, description, factory)?;
        Ok(self)
    }

    pub fn aggregator(
        &mut self,
        name: &'static str,
        description: &'static str,
        factory: AggregatorFactory,
    ) -> ConfigResult<&mut Self> {
        self.aggregators.insert(name, description, factory)?;
        Ok(self)
    }

    pub fn output(&mut self, name: &'static str, description: &'static str, factory: OutputFactory) -> ConfigResult<&mut Self> {
        self.outputs.insert(name, description, factory)?;
        Ok(self)
    }

    pub fn serializer(
        &mut self,
        name: &'static str,
        description: &'static str,
        factory: SerializerFactory,
    ) -> ConfigResult<&mut Self> {
        self.serializers.insert(name, description, factory)?;
        Ok(self)
    }

    pub fn parser(&mut self, name: &'static str, description: &'static str, factory: ParserFactory) -> ConfigResult<&mut Self> {
        self.parsers.insert(name, description, factory)?;
        Ok(self)
    }

    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            inputs: self.inputs,
            processors: self.processors,
            aggregators: self.aggregators,
            outputs: self.outputs,
            serializers: self.serializers,
            parsers: self.parsers,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Read-only after startup.
pub struct PluginRegistry {
    inputs: Table<InputFactory>,
    processors: Table<ProcessorFactory>,
    aggregators: Table<AggregatorFactory>,
    outputs: Table<OutputFactory>,
    serializers: Table<SerializerFactory>,
    parsers: Table<ParserFactory>,
}

impl PluginRegistry {
    pub fn builtin() -> ConfigResult<Self> {
        Ok(RegistryBuilder::with_builtins()?.build())
    }

    pub fn input(&self, plugin: &str, options: &PluginOptions, ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Input>> {
        (self.inputs.get(plugin)?)(options, ctx)
    }

    pub fn processor(
        &self,
        plugin: &str,
        options: &PluginOptions,
        ctx: &BuildContext<'_>,
    ) -> ConfigResult<Box<dyn Processor>> {
        (self.processors.get(plugin)?)(options, ctx)
    }

    pub fn aggregator(
        &self,
        plugin: &str,
        options: &PluginOptions,
        ctx: &BuildContext<'_>,
    ) -> ConfigResult<Box<dyn Aggregator>> {
        (self.aggregators.get(plugin)?)(options, ctx)
    }

    pub fn output(&self, plugin: &str, options: &PluginOptions, ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Output>> {
        (self.outputs.get(plugin)?)(options, ctx)
    }

    pub fn serializer(&self, format: &str, options: &PluginOptions) -> ConfigResult<Arc<dyn Serializer>> {
        (self.serializers.get(format)?)(options)
    }

    pub fn parser(&self, format: &str, options: &PluginOptions) -> ConfigResult<Arc<dyn Parser>> {
        (self.parsers.get(format)?)(options)
    }

    pub fn has(&self, kind: PluginKind, name: &str) -> bool {
        match kind {
            PluginKind::Input => self.inputs.entries.contains_key(name),
            PluginKind::Processor => self.processors.entries.contains_key(name),
            PluginKind::Aggregator => self.aggregators.entries.contains_key(name),
            PluginKind::Output => self.outputs.entries.contains_key(name),
            PluginKind::Serializer => self.serializers.entries.contains_key(name),
            PluginKind::Parser => self.parsers.entries.contains_key(name),
        }
    }

    /// Every registered plugin, grouped by kind then sorted by name.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.inputs
            .describe()
            .chain(self.processors.describe())
            .chain(self.aggregators.describe())
            .chain(self.outputs.describe())
            .chain(self.serializers.describe())
            .chain(self.parsers.describe())
            .collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list().len())
            .finish()
    }
}
