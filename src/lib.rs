#![forbid(unsafe_code)]
//! An incremental asset pipeline.
//!
//! A pipeline is a tree of nodes that select files from disk and run them
//! through user-supplied [`Transformer`]s. Results are cached on disk, keyed
//! by node, so a rebuild only reruns the transformers whose inputs changed. In
//! watch mode the engine subscribes to filesystem changes, cancels the run in
//! flight and starts a new one.
//!
//! ```rust,no_run
//! use assetpipe::{Definition, Settings, Transformer};
//!
//! # async fn run() -> Result<(), assetpipe::AssetpipeError> {
//! let source = Definition::new("assets.rs", |bp| {
//!     let vendor = bp.claim(["styles/vendor/*.css"]).bulk().register()?;
//!     let styles = bp
//!         .select(["styles/**/*.css"])
//!         .pipe(Transformer::sync(|files| Ok(files)))
//!         .register()?;
//!     Ok(bp.group([vendor, styles]).register()?)
//! });
//!
//! let settings = Settings::default().cache_dir(".cache");
//! let files = assetpipe::build(&source, &settings).await?;
//! # Ok(())
//! # }
//! ```

mod blueprint;
mod cache;
mod core;
mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;
mod node;
mod output;
mod query;
mod source;
mod utils;
#[cfg(feature = "live")]
mod watch;

use camino::Utf8PathBuf;
use console::style;

pub use crate::blueprint::{Blueprint, Handle, Pipeline, QueryDef, StageDef};
pub use crate::cache::{Cache, CacheKey};
pub use crate::core::{File, Mode, Settings};
pub use crate::engine::{CancelToken, ChangeKind, RunOutcome, Runtime};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::node::{
    Command, ContextNode, FilesNode, GroupBy, GroupNode, IgnoreNode, Node, NodeId, QueryNode,
    Transformer,
};
pub use crate::output::save_to_dist;
pub use crate::source::{Definition, PipelineSource};

/// Evaluates the source and sets up a runtime for it, loading the cache if
/// one is configured. Returns the runtime and the absolute script paths.
pub(crate) fn prepare<S>(source: &S, settings: &Settings) -> Result<(Runtime, Vec<Utf8PathBuf>), AssetpipeError>
where
    S: PipelineSource + ?Sized,
{
    let root = utils::absolute(&settings.root)?;
    let entry = utils::absolute(source.entry())?;

    let scripts = source
        .script_files()
        .map_err(AssetpipeError::Source)?
        .iter()
        .map(|path| utils::absolute(path))
        .collect::<Result<Vec<_>, _>>()?;

    let pipeline = source.evaluate().map_err(AssetpipeError::Source)?;

    let cache = match &settings.cache_dir {
        Some(dir) => Some(Cache::load(settings.resolve(dir), &entry, &scripts)?),
        None => None,
    };

    Ok((Runtime::new(pipeline, root, cache), scripts))
}

/// Runs the pipeline once and writes the final files to the output directory.
pub async fn build<S>(source: &S, settings: &Settings) -> Result<Vec<File>, AssetpipeError>
where
    S: PipelineSource + ?Sized,
{
    eprintln!(
        "Running {} in {} mode.",
        style("assetpipe").red(),
        style(Mode::Build).blue()
    );

    let (mut runtime, _) = prepare(source, settings)?;

    let files = match runtime.execute(&CancelToken::new()).await? {
        RunOutcome::Completed(files) => files,
        RunOutcome::Cancelled => return Err(AssetpipeError::Cancelled),
    };

    if let Some(out_dir) = &settings.out_dir {
        save_to_dist(&files, &settings.resolve(out_dir))?;
    }

    Ok(files)
}

/// Runs the pipeline, then keeps rerunning it whenever one of its inputs or
/// scripts changes. Returns on Ctrl-C.
#[cfg(feature = "live")]
pub async fn watch<S>(source: &S, settings: &Settings) -> Result<(), WatchError>
where
    S: PipelineSource + ?Sized,
{
    eprintln!(
        "Running {} in {} mode.",
        style("assetpipe").red(),
        style(Mode::Watch).blue()
    );

    watch::watch(source, settings).await
}
