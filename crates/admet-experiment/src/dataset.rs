//! ADMET datasets: rows of (molecule, measured property) turned into samples.
//!
//! Currently supports `caco2_wang` (Caco-2 permeability, Wang dataset, unit
//! log(cm/s)), read from a tab-separated file with columns `Drug` (SMILES),
//! `Y` (float) and an optional `Drug_ID`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExperimentError;

/// Environment variable overriding the Caco-2 dataset location.
pub const CACO2_WANG_PATH_ENV: &str = "CACO2_WANG_PATH";

/// Default Caco-2 dataset location, relative to the working directory.
pub const CACO2_WANG_DEFAULT_PATH: &str = "data/caco2_wang.tab";

/// One problem with its (optional) numeric ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub problem: String,
    pub groundtruth: Option<f64>,
}

impl Sample {
    pub fn new(problem: impl Into<String>, groundtruth: Option<f64>) -> Self {
        Self {
            problem: problem.into(),
            groundtruth,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Caco2Row {
    #[serde(rename = "Drug")]
    drug: String,
    #[serde(rename = "Y")]
    y: f64,
}

/// Problem statement for a Caco-2 permeability prediction.
pub fn caco2_problem(smiles: &str) -> String {
    format!(
        "You are an ADMET prediction assistant.\n\n\
         Task:\n\
         Given a molecule represented by SMILES, predict its Caco-2 permeability \
         (Wang dataset, unit: log(cm/s)).\n\n\
         Requirements:\n\
         - Return ONLY a single float number (no units, no explanation).\n\
         - Use reasonable scientific prior, but do not hallucinate impossible values.\n\n\
         Molecule SMILES: {smiles}\n\
         Answer:"
    )
}

/// Load a named dataset.
pub fn load_dataset(name: &str) -> Result<Vec<Sample>, ExperimentError> {
    match name {
        "caco2_wang" => {
            let path = std::env::var(CACO2_WANG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(CACO2_WANG_DEFAULT_PATH));
            load_caco2_wang(&path)
        }
        other => Err(ExperimentError::UnsupportedDataset(other.to_string())),
    }
}

/// Load the Caco-2 Wang dataset from a TSV file.
pub fn load_caco2_wang(path: &Path) -> Result<Vec<Sample>, ExperimentError> {
    if !path.exists() {
        return Err(ExperimentError::DatasetNotFound {
            name: "caco2_wang".to_string(),
            path: path.to_path_buf(),
        });
    }

    let dataset_err = |source| ExperimentError::Dataset {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .map_err(dataset_err)?;

    let mut samples = Vec::new();
    for row in reader.deserialize::<Caco2Row>() {
        let row = row.map_err(dataset_err)?;
        samples.push(Sample::new(caco2_problem(row.drug.trim()), Some(row.y)));
    }

    info!(path = %path.display(), samples = samples.len(), "Loaded caco2_wang dataset");
    Ok(samples)
}

/// Keep only the first `limit` samples, if a limit is given.
pub fn truncate(mut samples: Vec<Sample>, limit: Option<usize>) -> Vec<Sample> {
    if let Some(limit) = limit {
        samples.truncate(limit);
    }
    samples
}
