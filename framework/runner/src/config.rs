use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rpc_tester_core::prelude::{
    SchedulingGroup, SchedulingGroupError, SchedulingGroups, DEFAULT_SHARES,
};
use serde::Deserialize;

use crate::job::JobSpec;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Unknown job type `{kind}` for job `{job}`")]
    UnknownJobType { job: String, kind: String },
    #[error("Unknown verb `{verb}` for job `{job}`")]
    UnknownVerb { job: String, verb: String },
    #[error("Job `{job}` is missing the `{field}` field")]
    MissingField { job: String, field: &'static str },
    #[error("Job `{job}` must have a parallelism of at least 1")]
    ZeroParallelism { job: String },
    #[error("More than one job is named `{0}`")]
    DuplicateJob(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            nodelay: default_nodelay(),
        }
    }
}

fn default_nodelay() -> bool {
    true
}

fn default_shares() -> u32 {
    DEFAULT_SHARES
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub verb: Option<String>,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default = "default_shares")]
    pub shares: u32,

    /// Set from the command line for every job.
    #[serde(skip)]
    pub duration: Duration,
    /// The default group until [RunConfig::assign_scheduling_groups] runs.
    #[serde(skip)]
    pub scheduling_group: SchedulingGroup,
}

/// Everything read from the config file. Read-only once loaded, shared by all shards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub client: ConnectionConfig,
    #[serde(default)]
    pub server: ConnectionConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty file is a run without jobs.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        for job in &mut self.jobs {
            job.duration = duration;
        }
        self
    }

    /// Check every job before anything touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            JobSpec::from_config(job)?;
        }
        Ok(())
    }

    /// Create one scheduling group per job, named after the job and weighted by its shares.
    pub fn assign_scheduling_groups(
        &mut self,
        groups: &mut SchedulingGroups,
    ) -> Result<(), SchedulingGroupError> {
        for job in &mut self.jobs {
            job.scheduling_group = groups.create(&job.name, job.shares)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
client:
  nodelay: false
jobs:
  - name: echo1
    type: rpc
    verb: echo
    parallelism: 4
  - name: echo2
    type: rpc
    verb: echo
    parallelism: 1
    shares: 400
"#;

    #[test]
    fn parse_sample() {
        let config = RunConfig::from_yaml(SAMPLE).unwrap();

        assert!(!config.client.nodelay);
        assert!(config.server.nodelay);
        assert_eq!(2, config.jobs.len());
        assert_eq!("echo1", config.jobs[0].name);
        assert_eq!("rpc", config.jobs[0].kind);
        assert_eq!(Some("echo".to_string()), config.jobs[0].verb);
        assert_eq!(Some(4), config.jobs[0].parallelism);
        assert_eq!(100, config.jobs[0].shares);
        assert_eq!(400, config.jobs[1].shares);
        config.validate().unwrap();
    }

    #[test]
    fn empty_config() {
        let config = RunConfig::from_yaml("").unwrap();
        assert!(config.client.nodelay);
        assert!(config.jobs.is_empty());

        let config = RunConfig::from_yaml("server:\n  nodelay: false\n").unwrap();
        assert!(!config.server.nodelay);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = RunConfig::load(file.path())
            .unwrap()
            .with_duration(Duration::from_secs(7));
        assert!(config
            .jobs
            .iter()
            .all(|job| job.duration == Duration::from_secs(7)));
    }

    #[test]
    fn missing_file() {
        let err = RunConfig::load(Path::new("/does/not/exist.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }), "{err:?}");
    }

    #[test]
    fn unknown_verb_is_rejected() {
        let config = RunConfig::from_yaml(
            "jobs:\n  - name: j\n    type: rpc\n    verb: teleport\n    parallelism: 1\n",
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(
            matches!(&err, ConfigError::UnknownVerb { job, verb } if job == "j" && verb == "teleport"),
            "{err:?}"
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let config = RunConfig::from_yaml("jobs:\n  - name: j\n    type: disk\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownJobType { .. }), "{err:?}");
    }

    #[test]
    fn rpc_job_needs_verb_and_parallelism() {
        let config =
            RunConfig::from_yaml("jobs:\n  - name: j\n    type: rpc\n    parallelism: 2\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingField { field: "verb", .. }),
            "{err:?}"
        );

        let config =
            RunConfig::from_yaml("jobs:\n  - name: j\n    type: rpc\n    verb: echo\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingField { field: "parallelism", .. }),
            "{err:?}"
        );

        let config = RunConfig::from_yaml(
            "jobs:\n  - name: j\n    type: rpc\n    verb: echo\n    parallelism: 0\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroParallelism { .. }), "{err:?}");
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let config = RunConfig::from_yaml(
            "jobs:\n  - {name: a, type: rpc, verb: echo, parallelism: 1}\n  - {name: a, type: rpc, verb: echo, parallelism: 2}\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateJob(name) if name == "a"));
    }

    #[test]
    fn malformed_yaml() {
        let err = RunConfig::from_yaml("jobs: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn scheduling_groups_follow_jobs() {
        let mut config = RunConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!("main", config.jobs[0].scheduling_group.name());

        let mut groups = SchedulingGroups::new();
        config.assign_scheduling_groups(&mut groups).unwrap();

        assert_eq!("echo1", config.jobs[0].scheduling_group.name());
        assert_eq!(100, config.jobs[0].scheduling_group.shares());
        assert_eq!("echo2", config.jobs[1].scheduling_group.name());
        assert_eq!(400, config.jobs[1].scheduling_group.shares());
        assert_ne!(
            config.jobs[0].scheduling_group.id(),
            config.jobs[1].scheduling_group.id()
        );
    }

    #[test]
    fn zero_shares_are_rejected() {
        let mut config = RunConfig::from_yaml(
            "jobs:\n  - {name: a, type: rpc, verb: echo, parallelism: 1, shares: 0}\n",
        )
        .unwrap();
        let err = config
            .assign_scheduling_groups(&mut SchedulingGroups::new())
            .unwrap_err();
        assert!(matches!(err, SchedulingGroupError::ZeroShares { .. }));
    }
}
