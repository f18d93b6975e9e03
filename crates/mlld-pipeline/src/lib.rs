// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-pipeline
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cancellation primitives.
pub mod cancel;
/// Built-in format transformers and reserved names.
pub mod format;
/// The stage execution machine and the executor seam.
pub mod machine;
/// Bounded parallel iteration.
pub mod parallel;
/// Stage-list preprocessing.
pub mod preprocess;

pub use cancel::CancellationToken;
pub use format::{is_reserved, RESERVED_EFFECTS, RESERVED_TRANSFORMERS};
pub use machine::{
    ensure_newline, MxContext, MxOp, PipelineMachine, PipelineOptions, StageExecutor,
    StageOutcome, DEFAULT_MAX_RETRIES,
};
pub use parallel::{parallel_map, ParallelOptions, DEFAULT_PARALLEL_LIMIT};
pub use preprocess::{is_effect, preprocess, preprocess_with_source, EffectStage, PreparedStage};
