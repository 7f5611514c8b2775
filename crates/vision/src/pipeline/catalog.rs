//! Named stage kinds and the textual stage-list syntax.
//!
//! A stage list is a `;` separated sequence of `kind[:key=value[,key=value]]`
//! entries, e.g. `grayscale;blur:sigma=1.5;detect:threshold=200`. When a kind
//! repeats, later entries are named `kind_2`, `kind_3`, ... so request
//! overrides can address each one.

use std::{collections::BTreeMap, sync::Arc};

use crate::pipeline::{
    PipelineError, PipelineStage,
    params::StageParams,
    stage::Stage,
    stages::{
        Blur, Brightness, Contrast, Crop, Delay, Detect, Fail, Grayscale, Invert, Measure,
        Resize, Threshold,
    },
};

type StageFactory = fn() -> Arc<dyn Stage>;

fn make<S: Stage + Default + 'static>() -> Arc<dyn Stage> {
    Arc::new(S::default())
}

/// Registry of stage kinds that may appear in a stage list.
#[derive(Clone)]
pub struct StageCatalog {
    factories: BTreeMap<&'static str, StageFactory>,
}

impl StageCatalog {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Catalog with every built-in stage.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register("grayscale", make::<Grayscale>);
        catalog.register("invert", make::<Invert>);
        catalog.register("brightness", make::<Brightness>);
        catalog.register("contrast", make::<Contrast>);
        catalog.register("threshold", make::<Threshold>);
        catalog.register("blur", make::<Blur>);
        catalog.register("resize", make::<Resize>);
        catalog.register("crop", make::<Crop>);
        catalog.register("measure", make::<Measure>);
        catalog.register("detect", make::<Detect>);
        catalog.register("delay", make::<Delay>);
        catalog.register("fail", make::<Fail>);
        catalog
    }

    pub fn register(&mut self, kind: &'static str, factory: StageFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn create(&self, kind: &str) -> Option<Arc<dyn Stage>> {
        self.factories.get(kind).map(|factory| factory())
    }

    /// Parse a stage list into pipeline entries, validating every default
    /// parameter set.
    pub fn parse(&self, list: &str) -> Result<Vec<PipelineStage>, PipelineError> {
        let mut stages: Vec<PipelineStage> = Vec::new();
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();

        for entry in list.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (kind, params_text) = match entry.split_once(':') {
                Some((kind, rest)) => (kind.trim(), rest.trim()),
                None => (entry, ""),
            };
            let stage = self.create(kind).ok_or_else(|| PipelineError::Config(format!(
                "unknown stage kind {kind:?} (known: {})",
                self.kinds().collect::<Vec<_>>().join(", ")
            )))?;
            let params = parse_params(kind, params_text)?;

            let occurrence = seen.entry(kind.to_string()).or_insert(0);
            *occurrence += 1;
            let name = if *occurrence == 1 {
                kind.to_string()
            } else {
                format!("{kind}_{occurrence}")
            };

            stages.push(PipelineStage::new(name, stage, params)?);
        }
        Ok(stages)
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn parse_params(kind: &str, text: &str) -> Result<StageParams, PipelineError> {
    let mut params = StageParams::new();
    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            PipelineError::Config(format!(
                "stage {kind:?}: parameter {pair:?} is not key=value"
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(PipelineError::Config(format!(
                "stage {kind:?}: parameter {pair:?} has an empty key"
            )));
        }
        params.insert(key, value.trim());
    }
    Ok(params)
}
