//! Library side of the `nanoalign` binary: the staged alignment pipeline.

pub mod pipeline;

pub use pipeline::{Pipeline, PipelineSummary, PpoSummary, SftSummary};
