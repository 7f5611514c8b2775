//! Ordered stage execution over a single pixel buffer.
//!
//! A `Pipeline` is built once at startup from a fixed stage list and shared
//! read-only by every request. One `run` executes the stages strictly in
//! order on the calling thread; a failing stage aborts the run and nothing it
//! or its predecessors produced is returned.

use std::{collections::HashSet, sync::Arc, time::Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::buffer::PixelBuffer;

pub mod catalog;
mod params;
mod stage;
pub mod stages;

pub use catalog::StageCatalog;
pub use params::{ParamOverrides, StageParams};
pub use stage::{Detection, Findings, Stage, StageError, StageOutput};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline configuration: {0}")]
    Config(String),
    #[error("stage {stage:?}: invalid parameter {key:?}: {reason}")]
    InvalidParameter {
        stage: String,
        key: String,
        reason: String,
    },
    #[error("stage {stage:?} failed: {cause}")]
    Stage { stage: String, cause: String },
}

impl PipelineError {
    fn from_stage(stage: &str, err: StageError) -> Self {
        match err {
            StageError::InvalidParameter { key, reason } => PipelineError::InvalidParameter {
                stage: stage.to_string(),
                key,
                reason,
            },
            StageError::Fault(cause) => PipelineError::Stage {
                stage: stage.to_string(),
                cause,
            },
        }
    }
}

/// One registered entry of the stage list.
#[derive(Clone, Debug)]
pub struct PipelineStage {
    name: String,
    stage: Arc<dyn Stage>,
    defaults: StageParams,
}

impl PipelineStage {
    /// Register `stage` under `name`; the default parameters are validated
    /// immediately.
    pub fn new(
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
        defaults: StageParams,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        stage
            .validate(&defaults)
            .map_err(|err| PipelineError::from_stage(&name, err))?;
        Ok(Self {
            name,
            stage,
            defaults,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.stage.kind()
    }

    pub fn defaults(&self) -> &StageParams {
        &self.defaults
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Continued,
    Finished,
}

/// Timing and outcome of one executed stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: f64,
    pub outcome: StageOutcome,
}

/// Why a run stopped before the last stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Termination {
    pub stage: String,
    pub reason: String,
}

/// Terminal artifact of one pipeline run.
#[derive(Debug)]
pub struct ProcessingResult {
    /// Output image, absent when a stage finished without one.
    pub image: Option<PixelBuffer>,
    pub findings: Findings,
    pub stages: Vec<StageReport>,
    pub terminated_by: Option<Termination>,
}

/// Effective per-stage parameters for one request, in stage order.
#[derive(Clone, Debug)]
pub struct ResolvedParams {
    per_stage: Vec<StageParams>,
}

#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Result<Self, PipelineError> {
        let mut names = HashSet::new();
        for stage in &stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "stage name {:?} is registered twice",
                    stage.name
                )));
            }
        }
        Ok(Self { stages })
    }

    /// Pipeline with no stages: the decoded input is the output.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Build from a textual stage list, see [`catalog`].
    pub fn from_stage_list(catalog: &StageCatalog, list: &str) -> Result<Self, PipelineError> {
        Self::new(catalog.parse(list)?)
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Merge request overrides over each stage's defaults and validate the
    /// result. Overrides naming a stage that is not registered are rejected.
    pub fn resolve(&self, overrides: &ParamOverrides) -> Result<ResolvedParams, PipelineError> {
        for name in overrides.stage_names() {
            if !self.stages.iter().any(|stage| stage.name == name) {
                return Err(PipelineError::InvalidParameter {
                    stage: name.to_string(),
                    key: "*".into(),
                    reason: "no stage with this name is configured".into(),
                });
            }
        }

        let per_stage = self
            .stages
            .iter()
            .map(|entry| {
                let params = entry.defaults.merged(overrides.for_stage(&entry.name));
                entry
                    .stage
                    .validate(&params)
                    .map_err(|err| PipelineError::from_stage(&entry.name, err))?;
                Ok(params)
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        Ok(ResolvedParams { per_stage })
    }

    /// Resolve `overrides` and run every stage in order.
    pub fn run(
        &self,
        input: PixelBuffer,
        overrides: &ParamOverrides,
    ) -> Result<ProcessingResult, PipelineError> {
        let resolved = self.resolve(overrides)?;
        self.run_resolved(input, &resolved)
    }

    /// Run with parameters already produced by [`Pipeline::resolve`] on this
    /// pipeline.
    pub fn run_resolved(
        &self,
        input: PixelBuffer,
        resolved: &ResolvedParams,
    ) -> Result<ProcessingResult, PipelineError> {
        if resolved.per_stage.len() != self.stages.len() {
            return Err(PipelineError::Config(format!(
                "resolved parameters cover {} stages but the pipeline has {}",
                resolved.per_stage.len(),
                self.stages.len()
            )));
        }

        let mut current = input;
        let mut findings = Findings::default();
        let mut reports = Vec::with_capacity(self.stages.len());

        for (index, (entry, params)) in self.stages.iter().zip(&resolved.per_stage).enumerate() {
            let span = tracing::info_span!("stage", name = %entry.name, kind = entry.kind(), index);
            let _guard = span.enter();
            let started = Instant::now();

            let output = entry
                .stage
                .run(&current, params)
                .map_err(|err| PipelineError::from_stage(&entry.name, err))?;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match output {
                StageOutput::Continue {
                    buffer,
                    findings: stage_findings,
                } => {
                    debug!(
                        width = buffer.width(),
                        height = buffer.height(),
                        elapsed_ms,
                        "stage continued"
                    );
                    findings.absorb(&entry.name, stage_findings);
                    reports.push(StageReport {
                        name: entry.name.clone(),
                        elapsed_ms,
                        outcome: StageOutcome::Continued,
                    });
                    current = buffer;
                }
                StageOutput::Finish {
                    reason,
                    buffer,
                    findings: stage_findings,
                } => {
                    debug!(%reason, elapsed_ms, "stage finished the pipeline early");
                    findings.absorb(&entry.name, stage_findings);
                    reports.push(StageReport {
                        name: entry.name.clone(),
                        elapsed_ms,
                        outcome: StageOutcome::Finished,
                    });
                    return Ok(ProcessingResult {
                        image: buffer,
                        findings,
                        stages: reports,
                        terminated_by: Some(Termination {
                            stage: entry.name.clone(),
                            reason,
                        }),
                    });
                }
            }
        }

        Ok(ProcessingResult {
            image: Some(current),
            findings,
            stages: reports,
            terminated_by: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Channels;

    fn input() -> PixelBuffer {
        PixelBuffer::filled(4, 4, Channels::Rgb, 100).unwrap()
    }

    #[test]
    fn identity_returns_input_untouched() {
        let result = Pipeline::identity()
            .run(input(), &ParamOverrides::new())
            .unwrap();
        assert_eq!(result.image, Some(input()));
        assert!(result.stages.is_empty());
        assert!(result.terminated_by.is_none());
    }

    #[test]
    fn stages_run_in_registration_order() {
        // brightness then threshold differs from threshold then brightness
        let pipeline = Pipeline::from_stage_list(
            &StageCatalog::builtin(),
            "brightness:delta=50;threshold:level=128",
        )
        .unwrap();
        let result = pipeline.run(input(), &ParamOverrides::new()).unwrap();
        let image = result.image.unwrap();
        assert!(image.data().iter().all(|&v| v == 255));

        let reversed = Pipeline::from_stage_list(
            &StageCatalog::builtin(),
            "threshold:level=128;brightness:delta=50",
        )
        .unwrap();
        let result = reversed.run(input(), &ParamOverrides::new()).unwrap();
        assert!(result.image.unwrap().data().iter().all(|&v| v == 50));
    }

    #[test]
    fn failure_midway_returns_only_the_error() {
        let pipeline = Pipeline::from_stage_list(
            &StageCatalog::builtin(),
            "measure;fail:message=sensor offline;invert",
        )
        .unwrap();
        let err = pipeline.run(input(), &ParamOverrides::new()).unwrap_err();
        match err {
            PipelineError::Stage { stage, cause } => {
                assert_eq!(stage, "fail");
                assert_eq!(cause, "sensor offline");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn finish_skips_remaining_stages() {
        let pipeline =
            Pipeline::from_stage_list(&StageCatalog::builtin(), "detect:threshold=250;fail").unwrap();
        let result = pipeline.run(input(), &ParamOverrides::new()).unwrap();
        let termination = result.terminated_by.unwrap();
        assert_eq!(termination.stage, "detect");
        assert_eq!(termination.reason, stages::NO_OBJECT_DETECTED);
        assert_eq!(result.stages.len(), 1);
        assert!(result.image.is_none());
        assert_eq!(result.findings.measurements["detect.foreground_area"], 0.0);
    }

    #[test]
    fn overrides_apply_to_the_named_stage() {
        let pipeline =
            Pipeline::from_stage_list(&StageCatalog::builtin(), "brightness:delta=10").unwrap();
        let mut overrides = ParamOverrides::new();
        overrides.set("brightness", "delta", -100);
        let result = pipeline.run(input(), &overrides).unwrap();
        assert!(result.image.unwrap().data().iter().all(|&v| v == 0));
    }

    #[test]
    fn overrides_for_unknown_stages_are_rejected() {
        let pipeline = Pipeline::from_stage_list(&StageCatalog::builtin(), "invert").unwrap();
        let mut overrides = ParamOverrides::new();
        overrides.set("blur", "sigma", 2);
        assert!(matches!(
            pipeline.resolve(&overrides),
            Err(PipelineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn invalid_override_values_are_rejected_before_running() {
        let pipeline = Pipeline::from_stage_list(&StageCatalog::builtin(), "blur").unwrap();
        let mut overrides = ParamOverrides::new();
        overrides.set("blur", "sigma", "-1");
        assert!(matches!(
            pipeline.resolve(&overrides),
            Err(PipelineError::InvalidParameter { ref stage, .. }) if stage == "blur"
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let stage = StageCatalog::builtin().create("invert").unwrap();
        let entries = vec![
            PipelineStage::new("x", stage.clone(), StageParams::new()).unwrap(),
            PipelineStage::new("x", stage, StageParams::new()).unwrap(),
        ];
        assert!(matches!(Pipeline::new(entries), Err(PipelineError::Config(_))));
    }
}
