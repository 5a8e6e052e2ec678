use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use harvest::HarvesterConfig;
use serde::Deserialize;

use crate::{Error, Result};

const fn default_chunk_size() -> usize {
    64
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the ingestion state is kept.
    pub data_dir: PathBuf,

    /// Keys this deployment accepts, every source key by default.
    #[serde(default)]
    pub keys: Option<Vec<String>>,

    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub harvester: HarvesterConfig,

    /// Records per chunk, state is persisted after every chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::Configuration(format!("read {path:?} failed, {err}")))?;

        let config = Self::parse(&content)?;
        std::fs::create_dir_all(&config.data_dir).map_err(|err| {
            Error::Configuration(format!(
                "create data_dir {:?} failed, {err}",
                config.data_dir
            ))
        })?;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|err| Error::Configuration(format!("invalid config, {err}")))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Configuration("no source configured".to_string()));
        }

        for (key, source) in &self.sources {
            if source.harvester.frequency.is_zero() {
                return Err(Error::Configuration(format!(
                    "frequency of source {key:?} must be positive"
                )));
            }
            if source.chunk_size == 0 {
                return Err(Error::Configuration(format!(
                    "chunk_size of source {key:?} must be positive"
                )));
            }
        }

        if let Some(keys) = &self.keys {
            if let Some(key) = self.sources.keys().find(|key| !keys.contains(key)) {
                return Err(Error::Configuration(format!(
                    "source {key:?} is not in the supported keys"
                )));
            }
        }

        Ok(())
    }

    pub fn supported_keys(&self) -> Vec<String> {
        match &self.keys {
            Some(keys) => keys.clone(),
            None => self.sources.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harvest::Mode;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse() {
        let config = Config::parse(
            r#"
data_dir: /var/lib/harvestd
sources:
  ctdbp_telemetered:
    directory: /data/ctdbp
    pattern: "*.dat"
    frequency: 5
    file_mod_wait: 30
    chunk_size: 16
  adcp_recovered:
    mode: growing
    directory: /data/adcp
    pattern: adcp.log
    frequency: 0.5
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/harvestd"));
        assert_eq!(
            config.supported_keys(),
            vec!["adcp_recovered".to_string(), "ctdbp_telemetered".to_string()]
        );

        let ctdbp = &config.sources["ctdbp_telemetered"];
        assert_eq!(
            ctdbp.harvester,
            HarvesterConfig::directory("/data/ctdbp", "*.dat")
        );
        assert_eq!(ctdbp.chunk_size, 16);

        let adcp = &config.sources["adcp_recovered"];
        assert_eq!(adcp.harvester.mode, Mode::Growing);
        assert_eq!(adcp.harvester.frequency, Duration::from_millis(500));
        assert_eq!(adcp.harvester.file_mod_wait, Duration::from_secs(30));
        assert_eq!(adcp.chunk_size, 64);
    }

    #[test]
    fn invalid() {
        for (name, content) in [
            ("no sources", "data_dir: /tmp\nsources: {}\n"),
            ("unknown field", "data_dir: /tmp\nfoo: 1\nsources: {}\n"),
            (
                "zero frequency",
                "data_dir: /tmp\nsources:\n  a:\n    directory: /tmp\n    pattern: '*'\n    frequency: 0\n",
            ),
            (
                "zero chunk size",
                "data_dir: /tmp\nsources:\n  a:\n    directory: /tmp\n    pattern: '*'\n    chunk_size: 0\n",
            ),
            (
                "unsupported key",
                "data_dir: /tmp\nkeys: [b]\nsources:\n  a:\n    directory: /tmp\n    pattern: '*'\n",
            ),
            ("missing pattern", "data_dir: /tmp\nsources:\n  a:\n    directory: /tmp\n"),
        ] {
            let err = Config::parse(content).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{name}: {err}");
        }
    }

    #[test]
    fn load_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("state");
        let path = dir.path().join("harvestd.yaml");
        std::fs::write(
            &path,
            format!(
                "data_dir: {}\nsources:\n  a:\n    directory: /tmp\n    pattern: '*'\n",
                data_dir.display()
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.data_dir, data_dir);
        assert!(data_dir.is_dir());
    }
}
