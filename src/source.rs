use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::blueprint::{Blueprint, Handle, Pipeline};

/// Where a pipeline comes from.
///
/// The engine never inspects pipeline scripts itself. A source tells it which
/// files make up the definition, so they can be snapshotted and watched, and
/// how to turn them into a [`Pipeline`].
pub trait PipelineSource: Send + Sync {
    /// Path of the entry file, used to name the persisted cache.
    fn entry(&self) -> &Utf8Path;

    /// Every file the definition depends on, the entry included.
    fn script_files(&self) -> anyhow::Result<Vec<Utf8PathBuf>>;

    /// Builds a fresh pipeline. Called again whenever a script file changes.
    fn evaluate(&self) -> anyhow::Result<Pipeline>;
}

type Define = dyn Fn(&mut Blueprint) -> anyhow::Result<Handle> + Send + Sync;

/// A pipeline defined by a Rust closure.
///
/// # Example
///
/// ```rust,no_run
/// use assetpipe::{Definition, Transformer};
///
/// let source = Definition::new("assets.rs", |bp| {
///     let css = bp.select(["styles/*.css"]).bulk().register()?;
///     let img = bp.select(["images/**/*"]).register()?;
///     Ok(bp.group([css, img]).register()?)
/// });
/// ```
#[derive(Clone)]
pub struct Definition {
    entry: Utf8PathBuf,
    scripts: Vec<Utf8PathBuf>,
    define: Arc<Define>,
}

impl Definition {
    pub fn new<F>(entry: impl Into<Utf8PathBuf>, define: F) -> Self
    where
        F: Fn(&mut Blueprint) -> anyhow::Result<Handle> + Send + Sync + 'static,
    {
        let entry = entry.into();

        Self {
            scripts: vec![entry.clone()],
            entry,
            define: Arc::new(define),
        }
    }

    /// Adds files the definition depends on besides the entry.
    pub fn scripts(mut self, scripts: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        self.scripts.extend(scripts.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("entry", &self.entry)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl PipelineSource for Definition {
    fn entry(&self) -> &Utf8Path {
        &self.entry
    }

    fn script_files(&self) -> anyhow::Result<Vec<Utf8PathBuf>> {
        Ok(self.scripts.clone())
    }

    fn evaluate(&self) -> anyhow::Result<Pipeline> {
        let mut blueprint = Blueprint::new();
        let root = (self.define)(&mut blueprint)?;
        Ok(blueprint.finish(root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition() {
        let source = Definition::new("assets.rs", |bp| Ok(bp.select(["*.txt"]).register()?))
            .scripts(["lib/helpers.rs"]);

        assert_eq!(source.entry(), "assets.rs");
        assert_eq!(
            source.script_files().unwrap(),
            vec![Utf8PathBuf::from("assets.rs"), Utf8PathBuf::from("lib/helpers.rs")]
        );
        assert_eq!(source.evaluate().unwrap().nodes().len(), 1);
    }

    #[test]
    fn test_definition_errors() {
        let source = Definition::new("assets.rs", |bp| {
            let ignored = bp.ignore(["*.tmp"])?;
            Ok(ignored)
        });

        assert!(source.evaluate().is_err());

        let source = Definition::new("assets.rs", |_| anyhow::bail!("broken script"));
        assert_eq!(source.evaluate().unwrap_err().to_string(), "broken script");
    }
}
