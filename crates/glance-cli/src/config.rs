use anyhow::{Context, Result};
use glance_core::PipelineConfig;
use std::path::{Path, PathBuf};

/// Load the pipeline configuration: `--config`, else `GLANCE_CONFIG`, else
/// defaults; then apply `GLANCE_*` overrides and validate.
pub fn load(path: Option<&Path>) -> Result<PipelineConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("GLANCE_CONFIG").ok().map(PathBuf::from));

    let mut config = match &path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading configuration");
            PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate().context("invalid configuration after environment overrides")?;
    Ok(config)
}

fn apply_overrides(config: &mut PipelineConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = lookup("GLANCE_MODEL_DIR") {
        config.model_dir = PathBuf::from(dir);
    }
    config.queue_size = parsed(&lookup, "GLANCE_QUEUE_SIZE", config.queue_size);
    config.intra_threads = parsed(&lookup, "GLANCE_INTRA_THREADS", config.intra_threads);

    let detection = &mut config.face_detection;
    detection.confidence_threshold =
        parsed(&lookup, "GLANCE_CONFIDENCE_THRESHOLD", detection.confidence_threshold);
    detection.roi_scale_factor =
        parsed(&lookup, "GLANCE_ROI_SCALE_FACTOR", detection.roi_scale_factor);
}

/// Parse `key` if set; unparsable values keep the current setting.
fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    current: T,
) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = PipelineConfig::default();
        apply_overrides(
            &mut config,
            lookup(&[
                ("GLANCE_MODEL_DIR", "/srv/models"),
                ("GLANCE_QUEUE_SIZE", "4"),
                ("GLANCE_CONFIDENCE_THRESHOLD", "0.7"),
                ("GLANCE_ROI_SCALE_FACTOR", "1.3"),
                ("GLANCE_INTRA_THREADS", "1"),
            ]),
        );
        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.queue_size, 4);
        assert_eq!(config.intra_threads, 1);
        assert_eq!(config.face_detection.confidence_threshold, 0.7);
        assert_eq!(config.face_detection.roi_scale_factor, 1.3);
    }

    #[test]
    fn test_unparsable_override_keeps_value() {
        let mut config = PipelineConfig::default();
        apply_overrides(&mut config, lookup(&[("GLANCE_QUEUE_SIZE", "many")]));
        assert_eq!(config.queue_size, 16);
    }
}
