pub mod bdist;
pub mod merge;
pub mod postprocess;
pub mod wheel;
