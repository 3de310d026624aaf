//! Flattened reconciler configuration. Loaded from an optional YAML file,
//! then overridden from the environment, then defaulted.

use serde::Deserialize;
use std::path::Path;

use crate::util::Error;

fn default_cpu_overcommit() -> f64 {
    2.0
}

fn default_ram_overcommit() -> f64 {
    1.25
}

fn default_password_validity_secs() -> u64 {
    10
}

/// `loadBalancerService`: either a plain boolean or a map of default
/// labels/annotations to merge into every VM's rendered `Service`, mirroring
/// the `bool or map` contract `vmop_types::LoadBalancerServiceSpec` uses for
/// the per-VM override.
#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", untagged)]
pub enum LoadBalancerDefault {
    Bool(bool),
    Enabled {
        #[serde(default)]
        labels: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        annotations: std::collections::BTreeMap<String, String>,
    },
    #[default]
    None,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    pub namespace: String,
    pub runner_data_pvc_storage_class_name: Option<String>,
    #[serde(default = "default_cpu_overcommit")]
    pub cpu_overcommit: f64,
    #[serde(default = "default_ram_overcommit")]
    pub ram_overcommit: f64,
    pub load_balancer_service: LoadBalancerDefault,
    pub logging_properties: Option<String>,
    #[serde(default = "default_password_validity_secs")]
    pub password_validity_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            runner_data_pvc_storage_class_name: None,
            cpu_overcommit: default_cpu_overcommit(),
            ram_overcommit: default_ram_overcommit(),
            load_balancer_service: LoadBalancerDefault::None,
            logging_properties: None,
            password_validity_secs: default_password_validity_secs(),
        }
    }
}

/// CLI-level overrides, already parsed by `clap` in `main.rs`.
pub struct LoadOptions {
    pub config_file: Option<std::path::PathBuf>,
    pub namespace: Option<String>,
}

/// Loads the YAML config file (if given or found via `VMOP_CONFIG`), then
/// applies environment overrides, then resolves the namespace: explicit
/// config, then `--namespace`/`VMOP_NAMESPACE`, then the in-cluster
/// namespace file, else a fatal [`Error::Config`].
pub fn load(opts: LoadOptions) -> Result<ReconcilerConfig, Error> {
    let mut config = match opts
        .config_file
        .clone()
        .or_else(|| std::env::var("VMOP_CONFIG").ok().map(Into::into))
    {
        Some(path) => read_file(&path)?,
        None => ReconcilerConfig::default(),
    };

    apply_env_overrides(&mut config);

    if config.namespace.is_empty() {
        config.namespace = opts
            .namespace
            .or_else(|| std::env::var("VMOP_NAMESPACE").ok())
            .map(Ok)
            .unwrap_or_else(read_in_cluster_namespace)?;
    }

    Ok(config)
}

fn read_file(path: &Path) -> Result<ReconcilerConfig, Error> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    serde_yaml::from_str(&contents).map_err(Error::from)
}

fn apply_env_overrides(config: &mut ReconcilerConfig) {
    if let Ok(value) = std::env::var("VMOP_CPU_OVERCOMMIT")
        && let Ok(parsed) = value.parse()
    {
        config.cpu_overcommit = parsed;
    }
    if let Ok(value) = std::env::var("VMOP_RAM_OVERCOMMIT")
        && let Ok(parsed) = value.parse()
    {
        config.ram_overcommit = parsed;
    }
    if let Ok(value) = std::env::var("VMOP_PASSWORD_VALIDITY_SECS")
        && let Ok(parsed) = value.parse()
    {
        config.password_validity_secs = parsed;
    }
    if let Ok(value) = std::env::var("VMOP_STORAGE_CLASS_NAME") {
        config.runner_data_pvc_storage_class_name = Some(value);
    }
}

const IN_CLUSTER_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

fn read_in_cluster_namespace() -> Result<String, Error> {
    std::fs::read_to_string(IN_CLUSTER_NAMESPACE_FILE)
        .map(|s| s.trim().to_string())
        .map_err(|_| {
            Error::Config(
                "no namespace configured, passed on the command line, or found in the in-cluster \
                 service account namespace file"
                    .to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.cpu_overcommit, 2.0);
        assert_eq!(config.ram_overcommit, 1.25);
        assert_eq!(config.password_validity_secs, 10);
        assert!(matches!(config.load_balancer_service, LoadBalancerDefault::None));
    }

    #[test]
    fn parses_yaml_config() {
        let yaml = r#"
namespace: demo
cpuOvercommit: 3.0
loadBalancerService:
  labels:
    tier: frontend
"#;
        let config: ReconcilerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "demo");
        assert_eq!(config.cpu_overcommit, 3.0);
        match config.load_balancer_service {
            LoadBalancerDefault::Enabled { labels, .. } => {
                assert_eq!(labels.get("tier").map(String::as_str), Some("frontend"));
            }
            other => panic!("expected Enabled, got {other:?}"),
        }
    }

    #[test]
    fn parses_yaml_config_with_bool_load_balancer_service() {
        let yaml = r#"
namespace: demo
loadBalancerService: true
"#;
        let config: ReconcilerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.load_balancer_service, LoadBalancerDefault::Bool(true));
    }
}
