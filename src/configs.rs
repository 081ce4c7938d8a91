use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bosh::BoshDriver;
use crate::error::Result;
use crate::hooks::env_var_key;

/// One config downloaded from the director.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedConfig {
    pub config_type: String,
    pub name: String,
    pub path: PathBuf,
}

/// Downloads `(type, name)` configs into a workdir and tracks what actually
/// arrived; `*` expands to every config of the type.
pub struct ConfigFetcher {
    workdir: PathBuf,
    configs: Vec<DownloadedConfig>,
}

impl ConfigFetcher {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            configs: Vec::new(),
        }
    }

    pub fn fetch(&mut self, driver: &BoshDriver, config_type: &str, name: &str) -> Result<()> {
        if name == "*" {
            for (ctype, cname) in driver.configs(config_type)? {
                if ctype == config_type {
                    self.fetch_one(driver, &ctype, &cname)?;
                }
            }
            return Ok(());
        }
        self.fetch_one(driver, config_type, name)
    }

    fn fetch_one(&mut self, driver: &BoshDriver, config_type: &str, name: &str) -> Result<()> {
        if self.config_file(config_type, name).is_some() {
            debug!("{config_type}/{name} config already downloaded");
            return Ok(());
        }
        let content = driver.download_config(config_type, name)?;
        let path = self.workdir.join(format!("{config_type}-{name}-config.yml"));
        fs::write(&path, content)?;
        info!("downloaded {config_type}/{name} config");
        self.configs.push(DownloadedConfig {
            config_type: config_type.to_string(),
            name: name.to_string(),
            path,
        });
        Ok(())
    }

    pub fn config_file(&self, config_type: &str, name: &str) -> Option<&Path> {
        self.configs
            .iter()
            .find(|c| c.config_type == config_type && c.name == name)
            .map(|c| c.path.as_path())
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.configs.iter().map(|c| c.path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// `GENESIS_<TYPE>_CONFIG` for the default config of a type,
    /// `GENESIS_<TYPE>_CONFIG_<NAME>` for named ones.
    pub fn env_exports(&self) -> BTreeMap<String, String> {
        let mut exports = BTreeMap::new();
        for config in &self.configs {
            let key = if config.name == "default" {
                format!("GENESIS_{}_CONFIG", env_var_key(&config.config_type))
            } else {
                format!(
                    "GENESIS_{}_CONFIG_{}",
                    env_var_key(&config.config_type),
                    env_var_key(&config.name)
                )
            };
            exports.insert(key, config.path.display().to_string());
        }
        exports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bosh::{BoshDriver, BoshRunner};
    use crate::store::CliOutput;
    use std::sync::Arc;

    struct StubBosh;

    impl BoshRunner for StubBosh {
        fn run(
            &self,
            _connection: &BTreeMap<String, String>,
            args: &[String],
            _capture: bool,
        ) -> Result<CliOutput> {
            let stdout = match args[0].as_str() {
                "configs" => {
                    r#"{"Tables":[{"Rows":[
                        {"type":"cloud","name":"default"},
                        {"type":"cloud","name":"dns"}
                    ]}]}"#
                }
                "config" => r#"{"Tables":[{"Rows":[{"content":"azs: [z1]\n"}]}]}"#,
                _ => "{}",
            };
            Ok(CliOutput {
                status: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    fn driver() -> BoshDriver {
        let mut exodus = BTreeMap::new();
        exodus.insert("url".to_string(), "https://10.0.0.4:25555".to_string());
        BoshDriver::from_exodus("proto", &exodus, Arc::new(StubBosh)).unwrap()
    }

    #[test]
    fn wildcard_downloads_every_config_of_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = ConfigFetcher::new(dir.path());
        fetcher.fetch(&driver(), "cloud", "*").unwrap();
        assert!(fetcher.config_file("cloud", "default").is_some());
        assert!(fetcher.config_file("cloud", "dns").is_some());
        assert_eq!(fetcher.files().len(), 2);
        let content = fs::read_to_string(fetcher.config_file("cloud", "dns").unwrap()).unwrap();
        assert_eq!(content, "azs: [z1]\n");
    }

    #[test]
    fn exports_follow_default_and_named_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = ConfigFetcher::new(dir.path());
        fetcher.fetch(&driver(), "cloud", "*").unwrap();
        let exports = fetcher.env_exports();
        assert!(exports.contains_key("GENESIS_CLOUD_CONFIG"));
        assert!(exports.contains_key("GENESIS_CLOUD_CONFIG_DNS"));
    }

    #[test]
    fn repeat_fetches_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = ConfigFetcher::new(dir.path());
        fetcher.fetch(&driver(), "cloud", "default").unwrap();
        fetcher.fetch(&driver(), "cloud", "default").unwrap();
        assert_eq!(fetcher.files().len(), 1);
    }
}
