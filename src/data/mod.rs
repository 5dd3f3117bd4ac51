//! Data loading: NIfTI/CSV files, per-node datasets, transforms, batching
//! and case splits.

pub mod dataset;
pub mod loader;
pub mod nifti;
pub mod split;
pub mod transforms;

pub use dataset::{case_file, sample_seed, Dataset, NodeDataset};
pub use loader::{Batch, DataLoader, NodeLoaders, OrderedSampler};
pub use nifti::{read_csv_values, read_nifti, write_nifti, Volume};
pub use split::{collect_case_ids, resolve_cases, CasePolicy, DataSplit};
pub use transforms::{
    apply_all, MinMaxNormalize, OneHot, RandomFlip, RandomMask, RandomRotate, RandomShift, RandomZoom, Transform,
    TransformConfig, ZScoreNormalize,
};
