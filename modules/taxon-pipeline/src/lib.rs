pub mod pipeline;

pub use pipeline::{Collaborators, Pipeline, PipelineSettings, RunReport, RunStats};
