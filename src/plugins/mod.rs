// ============================================================================
// SECTION 16: BUILT-IN PLUGINS
// ============================================================================
// Thin adapters over the plugin traits, registered under their config names.
// ============================================================================

pub mod aggregators;
pub mod inputs;
pub mod outputs;
pub mod parsers;
pub mod processors;
pub mod serializers;

use crate::error::ConfigResult;
use crate::registry::RegistryBuilder;

/// Register every shipped plugin.
pub fn register_builtins(builder: &mut RegistryBuilder) -> ConfigResult<()> {
    builder
        .input(
            "internal",
            "Collect statistics about the agent itself",
            inputs::internal::Internal::build,
        )?
        .input("file", "Parse complete files each interval", inputs::file::FileInput::build)?
        .processor(
            "printer",
            "Print all metrics that pass through",
            processors::printer::Printer::build,
        )?
        .aggregator(
            "minmax",
            "Keep the min and max of each numeric field",
            aggregators::minmax::MinMax::build,
        )?
        .output("stdout", "Write metrics to standard output", outputs::stdout::Stdout::build)?
        .output("file", "Write metrics to files", outputs::file::FileOutput::build)?
        .output("discard", "Send metrics to nowhere at all", outputs::discard::Discard::build)?
        .serializer(
            "json",
            "One JSON object per metric",
            serializers::json::JsonSerializer::build,
        )?;

    #[cfg(feature = "line-protocol")]
    builder
        .serializer(
            "influx",
            "InfluxDB line protocol",
            serializers::influx::InfluxSerializer::build,
        )?
        .parser("influx", "InfluxDB line protocol", parsers::influx::InfluxParser::build)?;

    Ok(())
}
