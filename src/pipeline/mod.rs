pub mod runner;
pub mod stage;

pub use runner::PipelineRunner;
pub use stage::{default_stages, Stage, StageContext};
