use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use serde::Serialize;

use crate::pipeline::stage::StageError;

/// String key/value parameters for one stage, with typed accessors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StageParams {
    values: BTreeMap<String, String>,
}

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Values from `overrides` replace ours key by key.
    pub fn merged(&self, overrides: Option<&StageParams>) -> StageParams {
        let mut merged = self.clone();
        if let Some(overrides) = overrides {
            for (key, value) in &overrides.values {
                merged.values.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Parsed value of `key`, or `None` when unset.
    pub fn get<T>(&self, key: &str) -> Result<Option<T>, StageError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|err| StageError::InvalidParameter {
                    key: key.to_string(),
                    reason: format!("{raw:?}: {err}"),
                }),
        }
    }

    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, StageError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn require<T>(&self, key: &str) -> Result<T, StageError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)?.ok_or_else(|| StageError::InvalidParameter {
            key: key.to_string(),
            reason: "missing required value".into(),
        })
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for StageParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = StageParams::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

/// Per-request parameter overrides keyed by stage name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamOverrides {
    by_stage: HashMap<String, StageParams>,
}

impl ParamOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        stage: impl Into<String>,
        key: impl Into<String>,
        value: impl ToString,
    ) -> &mut Self {
        self.by_stage
            .entry(stage.into())
            .or_default()
            .insert(key, value);
        self
    }

    pub fn for_stage(&self, stage: &str) -> Option<&StageParams> {
        self.by_stage.get(stage)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.by_stage.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_stage.is_empty()
    }

    /// Collect `<stage>.<key>=<value>` pairs; pairs without a dot are ignored
    /// so they can carry request-level options.
    pub fn from_query_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut overrides = Self::new();
        for (name, value) in pairs {
            if let Some((stage, key)) = name.split_once('.') {
                if !stage.is_empty() && !key.is_empty() {
                    overrides.set(stage, key, value);
                }
            }
        }
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_report_the_offending_key() {
        let params = StageParams::new().with("delta", "lots");
        let err = params.get::<i32>("delta").unwrap_err();
        assert!(matches!(err, StageError::InvalidParameter { ref key, .. } if key == "delta"));
        assert_eq!(params.get_or::<i32>("missing", 7).unwrap(), 7);
        assert!(params.require::<i32>("missing").is_err());
    }

    #[test]
    fn overrides_replace_defaults_key_by_key() {
        let defaults = StageParams::new().with("a", 1).with("b", 2);
        let overrides = StageParams::new().with("b", 20);
        let merged = defaults.merged(Some(&overrides));
        assert_eq!(merged.raw("a"), Some("1"));
        assert_eq!(merged.raw("b"), Some("20"));
    }

    #[test]
    fn query_pairs_split_on_first_dot() {
        let overrides = ParamOverrides::from_query_pairs([
            ("brightness.delta", "30"),
            ("output", "image"),
            ("resize.max_side", "64"),
            (".bad", "1"),
        ]);
        assert_eq!(
            overrides.for_stage("brightness").and_then(|p| p.raw("delta")),
            Some("30")
        );
        assert_eq!(
            overrides.for_stage("resize").and_then(|p| p.raw("max_side")),
            Some("64")
        );
        assert_eq!(overrides.stage_names().count(), 2);
    }
}
