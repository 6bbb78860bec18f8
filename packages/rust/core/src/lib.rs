//! Episode production for Showrunner.
//!
//! This crate ties retrieval, grounded script generation, narration audio,
//! and rendering into one resumable pipeline ([`pipeline::PipelineContext`]).

pub mod assembler;
pub mod chapters;
pub mod generator;
pub mod narration;
pub mod pipeline;
pub mod prompt;
pub mod publish;
pub mod render;
pub mod synthesizer;
pub mod transcript;
pub mod visuals;

#[cfg(test)]
mod testing;

pub use assembler::{AssemblySettings, EpisodeAssembler, build_timeline};
pub use generator::{GeneratorConfig, ScriptGenerator};
pub use pipeline::{PipelineContext, PipelineSettings, ProgressReporter, SilentProgress};
pub use publish::{OutboxPublisher, PublishConfirmation, PublishMetadata, Publisher};
pub use render::{FfmpegRenderer, RenderSettings, RenderedMedia, Renderer};
pub use synthesizer::{AudioSynthesizer, SynthesizerConfig};
pub use visuals::{DirectoryAssetProvider, VisualAssetProvider};
