// ============================================================================
// SECTION 20: METRIC FILTERS
// ============================================================================
// Glob-based selection over metric names, tags and fields. Shared by inputs,
// processors, aggregators and outputs.
// ============================================================================

use glob::Pattern;

use crate::config::FilterConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::metric::Metric;

/// Compiled form of a [`FilterConfig`].
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    namepass: Vec<Pattern>,
    namedrop: Vec<Pattern>,
    tagpass: Vec<(String, Vec<Pattern>)>,
    tagdrop: Vec<(String, Vec<Pattern>)>,
    fieldpass: Vec<Pattern>,
    fielddrop: Vec<Pattern>,
}

fn compile_all(field: &str, globs: &[String]) -> ConfigResult<Vec<Pattern>> {
    globs
        .iter()
        .map(|g| {
            Pattern::new(g).map_err(|e| {
                ConfigError::invalid_value(field, format!("bad pattern '{}': {}", g, e))
            })
        })
        .collect()
}

fn compile_tags(
    field: &str,
    tags: &std::collections::BTreeMap<String, Vec<String>>,
) -> ConfigResult<Vec<(String, Vec<Pattern>)>> {
    tags.iter()
        .map(|(k, globs)| Ok((k.clone(), compile_all(field, globs)?)))
        .collect()
}

fn any_match(patterns: &[Pattern], s: &str) -> bool {
    patterns.iter().any(|p| p.matches(s))
}

fn tags_match(rules: &[(String, Vec<Pattern>)], metric: &Metric) -> bool {
    rules.iter().any(|(key, patterns)| {
        metric
            .tag(key)
            .is_some_and(|value| any_match(patterns, value))
    })
}

impl MetricFilter {
    pub fn compile(config: &FilterConfig) -> ConfigResult<Self> {
        Ok(Self {
            namepass: compile_all("namepass", &config.namepass)?,
            namedrop: compile_all("namedrop", &config.namedrop)?,
            tagpass: compile_tags("tagpass", &config.tagpass)?,
            tagdrop: compile_tags("tagdrop", &config.tagdrop)?,
            fieldpass: compile_all("fieldpass", &config.fieldpass)?,
            fielddrop: compile_all("fielddrop", &config.fielddrop)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.namepass.is_empty()
            && self.namedrop.is_empty()
            && self.tagpass.is_empty()
            && self.tagdrop.is_empty()
            && self.fieldpass.is_empty()
            && self.fielddrop.is_empty()
    }

    /// Name and tag rules only.
    pub fn selects(&self, metric: &Metric) -> bool {
        if !self.namepass.is_empty() && !any_match(&self.namepass, metric.name()) {
            return false;
        }
        if any_match(&self.namedrop, metric.name()) {
            return false;
        }
        if !self.tagpass.is_empty() && !tags_match(&self.tagpass, metric) {
            return false;
        }
        if tags_match(&self.tagdrop, metric) {
            return false;
        }
        true
    }

    /// Select the metric and strip filtered fields. `None` when the metric is
    /// not selected or no field survives.
    pub fn apply(&self, mut metric: Metric) -> Option<Metric> {
        if !self.selects(&metric) {
            return None;
        }
        if self.fieldpass.is_empty() && self.fielddrop.is_empty() {
            return Some(metric);
        }

        let fieldpass = &self.fieldpass;
        let fielddrop = &self.fielddrop;
        metric.fields_mut().retain(|f| {
            (fieldpass.is_empty() || any_match(fieldpass, &f.key)) && !any_match(fielddrop, &f.key)
        });

        if metric.fields().is_empty() {
            None
        } else {
            Some(metric)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Timestamp;

    fn metric(name: &str) -> Metric {
        Metric::new(name, Timestamp::EPOCH)
            .with_tag("host", "web-01")
            .with_tag("env", "prod-eu")
            .with_field("usage_user", 1.0)
            .with_field("usage_idle", 99.0)
    }

    fn filter(toml: &str) -> MetricFilter {
        let config: FilterConfig = toml::from_str(toml).unwrap();
        MetricFilter::compile(&config).unwrap()
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let f = MetricFilter::default();
        assert!(f.is_empty());
        assert_eq!(f.apply(metric("cpu")), Some(metric("cpu")));
    }

    #[test]
    fn test_name_rules() {
        let f = filter("namepass = [\"cpu*\"]\nnamedrop = [\"cpu_total\"]");
        assert!(f.selects(&metric("cpu")));
        assert!(f.selects(&metric("cpu_core")));
        assert!(!f.selects(&metric("cpu_total")));
        assert!(!f.selects(&metric("mem")));
    }

    #[test]
    fn test_tag_rules() {
        let pass = filter("[tagpass]\nenv = [\"prod*\"]");
        assert!(pass.selects(&metric("cpu")));
        assert!(!pass.selects(&Metric::new("cpu", Timestamp::EPOCH).with_field("v", 1i64)));

        let drop = filter("[tagdrop]\nhost = [\"web-*\"]");
        assert!(!drop.selects(&metric("cpu")));
    }

    #[test]
    fn test_field_rules() {
        let f = filter("fieldpass = [\"usage_*\"]\nfielddrop = [\"usage_idle\"]");
        let out = f.apply(metric("cpu")).unwrap();
        assert_eq!(out.fields().len(), 1);
        assert!(out.field("usage_user").is_some());

        let none_left = filter("fielddrop = [\"usage_*\"]");
        assert!(none_left.apply(metric("cpu")).is_none());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = FilterConfig {
            namepass: vec!["[".into()],
            ..FilterConfig::default()
        };
        assert!(MetricFilter::compile(&config).is_err());
    }
}
