use clap::ValueEnum;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::error;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigError> {
    if !path.is_file() {
        Err(ConfigError::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Unreadable { path: PathBuf, source: Error },
    #[error("failed to parse config file")]
    MalformedConfig(#[from] serde_yaml::Error),
}

/// Static environment of the harness, loaded from an optional YAML file.
/// Everything per-batch lives in `RunConfiguration` instead.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// path to the solver binary driven by the harness
    #[serde(default = "default_solver_exec")]
    pub solver_exec: PathBuf,
    /// directory holding the problem instances
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,
    /// directory holding predefined `bound_<method>.csv` tables
    #[serde(default = "default_bound_dir")]
    pub bound_dir: PathBuf,
    /// directory all snapshots and reports are written to
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
    /// glob filtering the instance files inside the dataset directory
    #[serde(default = "default_instance_glob")]
    pub instance_glob: String,
    /// number of concurrently running solver processes
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// seconds between periodic partial snapshots
    #[serde(default = "default_save_interval")]
    pub save_interval_seconds: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            solver_exec: default_solver_exec(),
            dataset_dir: default_dataset_dir(),
            bound_dir: default_bound_dir(),
            result_dir: default_result_dir(),
            instance_glob: default_instance_glob(),
            jobs: default_jobs(),
            save_interval_seconds: default_save_interval(),
        }
    }
}

impl HarnessConfig {
    /// load the config file when one is given, fall back to defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let file = File::open(path).map_err(|source| ConfigError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                })?;

                Ok(serde_yaml::from_reader(file)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn compile_glob(&self) -> Result<GlobMatcher, globset::Error> {
        Ok(GlobBuilder::new(&self.instance_glob)
            .build()?
            .compile_matcher())
    }

    /// attempt to catch all errors instead of piece-by-piece to make
    /// debugging easier for users
    pub fn preflight_checks(&self, use_predefined_upper_bound: bool) -> bool {
        let mut contains_error = false;

        match check_executable(&self.solver_exec) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Solver target {} is not executable, this might cause problems",
                    self.solver_exec.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to find solver_exec at {}: {e}",
                    self.solver_exec.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if !use_predefined_upper_bound && !self.dataset_dir.is_dir() {
            error!(
                "dataset_dir {} is not a directory",
                self.dataset_dir.to_string_lossy()
            );
            contains_error = true;
        }

        if use_predefined_upper_bound && !self.bound_dir.is_dir() {
            error!(
                "bound_dir {} is not a directory but predefined bounds were requested",
                self.bound_dir.to_string_lossy()
            );
            contains_error = true;
        }

        if let Err(e) = self.compile_glob() {
            error!("Failed to compile instance glob: {e}");
            contains_error = true;
        }

        if self.jobs == 0 {
            error!("jobs cannot be 0, no solver process could ever be dispatched");
            contains_error = true;
        }

        contains_error
    }
}

#[derive(ValueEnum, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolvingMethod {
    OneVarLess,
    OneVarGreater,
    TwoVarsLess,
    TwoVarsGreater,
    StaircaseAux,
    StaircaseNoAux,
}

impl SolvingMethod {
    /// spelling the solver binary expects on its command line
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::OneVarLess => "one-var-less",
            Self::OneVarGreater => "one-var-greater",
            Self::TwoVarsLess => "two-vars-less",
            Self::TwoVarsGreater => "two-vars-greater",
            Self::StaircaseAux => "staircase-aux",
            Self::StaircaseNoAux => "staircase-no-aux",
        }
    }
}

#[derive(ValueEnum, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SolverEngine {
    #[default]
    Cadical,
    Kissat,
}

impl SolverEngine {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Cadical => "cadical",
            Self::Kissat => "kissat",
        }
    }
}

// clap renders the default engine on --help through Display
impl std::fmt::Display for SolverEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Full set of solver flags for one batch.
/// Immutable for the duration of the batch and shared by all runs.
#[derive(Clone, Debug)]
pub struct RunConfiguration {
    pub solver_exec: PathBuf,
    pub method: SolvingMethod,
    pub time_limit: Option<u64>,
    pub incremental: bool,
    pub incremental_var: Option<String>,
    pub symmetry_breaking: bool,
    pub heuristics: bool,
    pub engine: SolverEngine,
}

impl RunConfiguration {
    /// file name stem encoding the batch configuration, snapshots from
    /// differently configured runs never collide
    pub fn result_stem(&self) -> String {
        let mut stem = format!("BCP_{}", self.method.as_arg());

        if self.symmetry_breaking {
            stem.push_str("_symmetry-breaking");
        }

        if self.heuristics {
            stem.push_str("_heuristic");
        }

        if self.incremental {
            stem.push_str("_incremental");
        }

        if self.engine != SolverEngine::default() {
            stem.push('_');
            stem.push_str(self.engine.as_arg());
        }

        stem
    }
}

fn default_solver_exec() -> PathBuf {
    PathBuf::from("./bcp")
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("./dataset")
}

fn default_bound_dir() -> PathBuf {
    PathBuf::from("./bound")
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("./result")
}

fn default_instance_glob() -> String {
    String::from("*")
}

fn default_jobs() -> usize {
    1
}

fn default_save_interval() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_run() -> RunConfiguration {
        RunConfiguration {
            solver_exec: PathBuf::from("./bcp"),
            method: SolvingMethod::TwoVarsLess,
            time_limit: None,
            incremental: false,
            incremental_var: None,
            symmetry_breaking: false,
            heuristics: false,
            engine: SolverEngine::Cadical,
        }
    }

    #[test]
    fn result_stem_encodes_enabled_flags() {
        let mut run = base_run();
        assert_eq!(run.result_stem(), "BCP_two-vars-less");

        run.symmetry_breaking = true;
        run.heuristics = true;
        run.incremental = true;
        run.engine = SolverEngine::Kissat;
        assert_eq!(
            run.result_stem(),
            "BCP_two-vars-less_symmetry-breaking_heuristic_incremental_kissat"
        );
    }

    #[test]
    fn config_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dataset_dir: /tmp/instances\njobs: 4").unwrap();

        let config = HarnessConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.dataset_dir, PathBuf::from("/tmp/instances"));
        assert_eq!(config.jobs, 4);
        // untouched fields keep their defaults
        assert_eq!(config.save_interval_seconds, 300);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datset_dir: /tmp/typo").unwrap();

        assert!(HarnessConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn executable_check_distinguishes_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solver");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!check_executable(&path).unwrap());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(check_executable(&path).unwrap());

        assert!(check_executable(&dir.path().join("missing")).is_err());
    }
}
