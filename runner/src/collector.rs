use crate::{
    config::{HarnessConfig, SolvingMethod},
    results::ResultTable,
};
use ignore::WalkBuilder;
use itertools::Itertools;
use std::{fs, path::PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("instance glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("failed to read bound table {path}: {source}")]
    BoundTableUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bound table {path} is malformed: {reason}")]
    MalformedBoundTable { path: PathBuf, reason: String },
}

/// One problem input, immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub path: PathBuf,
    pub upper_bound: Option<i64>,
}

/// Build the work list for a batch, either from the dataset directory or
/// from the predefined bound table of the solving method.
///
/// Instances whose name is already present in the seed table are dropped
/// here, a resumed batch never re-submits completed work.
pub fn collect_instances(
    config: &HarnessConfig,
    method: SolvingMethod,
    use_predefined_upper_bound: bool,
    done: &ResultTable,
) -> Result<Vec<Instance>, CollectorError> {
    let instances = if use_predefined_upper_bound {
        from_bound_table(config, method)?
    } else {
        from_dataset_dir(config)?
    };

    let (fresh, skipped): (Vec<_>, Vec<_>) = instances
        .into_iter()
        .partition(|instance| !done.contains_name(&instance.name));

    if !skipped.is_empty() {
        debug!("Skipping {} already completed instances", skipped.len());
    }

    Ok(fresh)
}

fn from_dataset_dir(config: &HarnessConfig) -> Result<Vec<Instance>, CollectorError> {
    let glob = config.compile_glob()?;

    // the dataset directory is flat, instances are its immediate files
    Ok(WalkBuilder::new(&config.dataset_dir)
        .max_depth(Some(1))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for instances: {e}");
                None
            }
        })
        .filter(|entry| {
            entry
                .file_type()
                .map(|file_type| file_type.is_file())
                .unwrap_or(false)
        })
        .filter(|entry| glob.is_match(entry.file_name()))
        .map(|entry| Instance {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.into_path(),
            upper_bound: None,
        })
        .sorted_by(|a, b| a.name.cmp(&b.name))
        .collect_vec())
}

/// read `bound_<method>.csv`, a two column `name,upper_bound` table mapping
/// instance names to precomputed bounds
fn from_bound_table(
    config: &HarnessConfig,
    method: SolvingMethod,
) -> Result<Vec<Instance>, CollectorError> {
    let path = config
        .bound_dir
        .join(format!("bound_{}.csv", method.as_arg()));
    let content =
        fs::read_to_string(&path).map_err(|source| CollectorError::BoundTableUnreadable {
            path: path.clone(),
            source,
        })?;

    let mut lines = content.lines();
    let header = lines
        .next()
        .ok_or_else(|| CollectorError::MalformedBoundTable {
            path: path.clone(),
            reason: "empty file".to_string(),
        })?;

    let columns = header.split(',').map(str::trim).collect_vec();
    let name_index = columns.iter().position(|c| *c == "name");
    let bound_index = columns.iter().position(|c| *c == "upper_bound");
    let (name_index, bound_index) = match (name_index, bound_index) {
        (Some(name), Some(bound)) => (name, bound),
        _ => {
            return Err(CollectorError::MalformedBoundTable {
                path,
                reason: "header is missing the `name` or `upper_bound` column".to_string(),
            })
        }
    };

    let mut instances = Vec::new();
    for (number, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }

        let cells = line.split(',').map(str::trim).collect_vec();
        let name = cells.get(name_index).copied().unwrap_or_default();
        let bound = cells
            .get(bound_index)
            .and_then(|cell| cell.parse::<i64>().ok());

        match (name.is_empty(), bound) {
            (false, Some(bound)) => instances.push(Instance {
                name: name.to_string(),
                path: config.dataset_dir.join(name),
                upper_bound: Some(bound),
            }),
            _ => {
                return Err(CollectorError::MalformedBoundTable {
                    path,
                    reason: format!("row {} has no usable name/upper_bound pair", number + 2),
                })
            }
        }
    }

    Ok(instances)
}
