//! Image processing core shared by the API service.
//!
//! - `buffer`: decoded pixel grids handed between stages.
//! - `codec`: decode/encode adapter over the native image library.
//! - `pipeline`: ordered stage execution, stage catalog, and results.

pub mod buffer;
pub mod codec;
pub mod pipeline;

pub use buffer::{BufferError, Channels, PixelBuffer};
pub use codec::{CodecError, FormatAllowList, ImageCodec, ImageFormat, NativeCodec};
pub use pipeline::{
    Detection, Findings, ParamOverrides, Pipeline, PipelineError, PipelineStage,
    ProcessingResult, ResolvedParams, Stage, StageCatalog, StageError, StageOutcome,
    StageOutput, StageParams, StageReport, Termination,
};
