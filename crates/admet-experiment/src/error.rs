//! Structural errors: the failures that propagate to the caller instead of
//! being absorbed into a smaller batch.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("batch shape mismatch: {samples} samples but {responses} responses")]
    InputShape { samples: usize, responses: usize },

    #[error("dataset {name} not found at {path}")]
    DatasetNotFound { name: String, path: PathBuf },

    #[error("unsupported dataset: {0}")]
    UnsupportedDataset(String),

    #[error("failed to read dataset {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}
