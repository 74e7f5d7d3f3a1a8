//! Loading and validation of the node settings.
//!
//! An example configuration lives in `configs/node.toml` at the repository root. Every value can
//! be overridden by an environment variable, e.g. `FEDLAB_SECURITY__PLAN_APPROVAL=false`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use validator::Validate;

use fedlab_core::{
    settings::{self, LoggingSettings, SettingsError},
    DatasetDescriptor,
};

#[derive(Debug, Deserialize, Validate)]
/// The combined node settings.
pub struct NodeSettings {
    #[validate]
    pub node: NodeIdentitySettings,
    #[serde(default)]
    pub security: SecuritySettings,
    pub exchange: ExchangeSettings,
    /// The datasets shared by the node.
    ///
    /// **TOML**
    /// ```text
    /// [[datasets]]
    /// dataset_id = "heart-1"
    /// name = "heart"
    /// tags = ["heart", "csv"]
    /// path = "/data/heart.csv"
    /// ```
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
    pub log: LoggingSettings,
}

impl NodeSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        settings::load(path)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct NodeIdentitySettings {
    /// The identifier of the node, unique among the nodes of a federation.
    #[validate(length(min = 1))]
    pub id: String,
    /// Where downloaded plans, parameters and results are stored while a round runs.
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct SecuritySettings {
    /// Whether training plans must be approved before they run.
    #[serde(default = "default_plan_approval")]
    pub plan_approval: bool,
    /// The file of the plan registry. Without it, approvals are lost on restart.
    #[serde(default)]
    pub registry: Option<PathBuf>,
}

fn default_plan_approval() -> bool {
    true
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            plan_approval: default_plan_approval(),
            registry: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeSettings {
    /// The directory shared with the researcher through which artifacts are exchanged.
    pub store: PathBuf,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONFIG: &str = r#"
[node]
id = "node-1"
tmp_dir = "tmp/node-1"

[exchange]
store = "exchange/store"

[[datasets]]
dataset_id = "heart-1"
name = "heart"
tags = ["heart", "csv"]
path = "/data/heart.csv"

[log]
filter = "info"
"#;

    fn load(config: &str) -> Result<NodeSettings, SettingsError> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(config.as_bytes()).unwrap();
        NodeSettings::new(file.path())
    }

    #[test]
    fn test_load_settings() {
        let settings = load(CONFIG).unwrap();
        assert_eq!(settings.node.id, "node-1");
        assert_eq!(settings.exchange.store, PathBuf::from("exchange/store"));
        assert_eq!(settings.datasets.len(), 1);
        assert_eq!(settings.datasets[0].tags, vec!["heart", "csv"]);
        assert!(settings.datasets[0].shape.is_empty());
    }

    #[test]
    fn test_plan_approval_is_required_by_default() {
        let settings = load(CONFIG).unwrap();
        assert!(settings.security.plan_approval);
        assert!(settings.security.registry.is_none());

        let config = format!("{}\n[security]\nplan_approval = false\n", CONFIG);
        assert!(!load(&config).unwrap().security.plan_approval);
    }

    #[test]
    fn test_empty_id_is_invalid() {
        let config = CONFIG.replace("id = \"node-1\"", "id = \"\"");
        assert!(matches!(load(&config), Err(SettingsError::Validation(_))));
    }
}
