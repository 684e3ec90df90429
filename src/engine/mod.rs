//! Incremental evaluation of a pipeline.
//!
//! A [`Runtime`] owns everything that survives between runs of the same
//! pipeline: the resolved queries, the set of inputs that changed since the
//! last successful run, and the result cache. Each call to
//! [`Runtime::execute`] performs one run:
//!
//! 1. Stale query and ignore nodes are re-resolved against the filesystem.
//! 2. The claim/ignore overlay is recomputed.
//! 3. Every node is marked as a cache hit or not, bottom-up.
//! 4. The root is computed. Nodes are memoized per run, so a node shared by
//!    several parents is computed once.
//!
//! A run can be cancelled at any point through its [`CancelToken`]. Cancelled
//! and failed runs leave the committed cache untouched.

mod cancel;
mod eval;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::try_join_all;
use tracing::{Instrument, Level};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::File;
use crate::blueprint::Pipeline;
use crate::cache::Cache;
use crate::core::fingerprint;
use crate::error::{EvalError, QueryError, RunError};
use crate::node::{Node, NodeId};
use crate::query::{QueryPattern, QueryState, overlay, resolve};
use crate::utils::{PROGRESS_STYLE, as_overhead};

pub use cancel::CancelToken;
use eval::Run;

/// Kind of a filesystem change reported to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// How a run ended, when it did not fail.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Vec<File>),
    Cancelled,
}

/// Session state of a pipeline.
#[derive(Debug)]
pub struct Runtime {
    pipeline: Arc<Pipeline>,
    root: Utf8PathBuf,
    cache: Option<Cache>,
    queries: BTreeMap<NodeId, QueryState>,
    ignores: BTreeMap<NodeId, Vec<File>>,
    /// Query and ignore nodes to re-resolve before the next run.
    stale: BTreeSet<NodeId>,
    /// Inputs changed since the last successful save.
    touched: BTreeSet<Utf8PathBuf>,
    /// Whether inputs were compared against the fingerprints of the previous
    /// session.
    fingerprinted: bool,
}

impl Runtime {
    /// Creates a runtime resolving relative patterns against `root`. Every
    /// query starts out stale.
    pub fn new(pipeline: Pipeline, root: impl Into<Utf8PathBuf>, cache: Option<Cache>) -> Self {
        let mut queries = BTreeMap::new();
        let mut stale = BTreeSet::new();

        for (id, query) in pipeline.query_nodes() {
            queries.insert(
                id,
                QueryState {
                    claim: query.claim,
                    ..Default::default()
                },
            );
            stale.insert(id);
        }

        let ignores = pipeline.ignore_nodes().map(|(id, _)| (id, Vec::new())).collect();
        stale.extend(pipeline.ignore_nodes().map(|(id, _)| id));

        Self {
            pipeline: Arc::new(pipeline),
            root: root.into(),
            cache,
            queries,
            ignores,
            stale,
            touched: BTreeSet::new(),
            fingerprinted: false,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The pipeline, shared with whoever needs its patterns while a run owns
    /// the runtime.
    pub(crate) fn shared_pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    /// Files matched by a query node, before the overlay.
    pub fn query_result(&self, id: NodeId) -> Option<&[File]> {
        self.queries.get(&id).map(|state| state.result.as_slice())
    }

    /// Files left to a query node after the overlay of the last run.
    pub fn filtered_result(&self, id: NodeId) -> Option<&[File]> {
        self.queries.get(&id).map(|state| state.filtered.as_slice())
    }

    /// Records a change to the file at the absolute `path`.
    ///
    /// Returns whether the change affects any query, i.e. whether a new run
    /// is needed. Paths matched by an ignore node never affect queries, but
    /// every node matching them is still re-resolved before the next run.
    pub fn record_change(&mut self, path: &Utf8Path, kind: ChangeKind) -> bool {
        let ignored: Vec<_> = self.pipeline.ignored_by(&self.root, path).collect();
        let queried: Vec<_> = self.pipeline.queried_by(&self.root, path).collect();

        self.stale.extend(ignored.iter().chain(&queried).copied());

        if !ignored.is_empty() {
            tracing::debug!("ignoring {kind:?} of {path}");
            return false;
        }

        if queried.is_empty() {
            return false;
        }

        for id in &queried {
            if let Some(state) = self.queries.get_mut(id) {
                state.misses.insert(path.to_path_buf());
            }
        }

        tracing::debug!("recorded {kind:?} of {path}");
        self.touched.insert(path.to_path_buf());
        true
    }

    /// Performs one run of the pipeline.
    pub async fn execute(&mut self, cancel: &CancelToken) -> Result<RunOutcome, RunError> {
        let s = Instant::now();

        if let Err(e) = self.refresh().await {
            if let Some(cache) = &mut self.cache {
                cache.reset();
            }
            return Err(e);
        }

        overlay(self.ignores.values().flatten(), &mut self.queries);

        let span = tracing::span!(Level::INFO, "evaluate");
        span.pb_set_style(&PROGRESS_STYLE);
        span.pb_set_length(self.pipeline.nodes.len() as u64);
        span.pb_set_message("Evaluating pipeline...");

        let result = {
            let run = Run::new(&self.pipeline, &self.queries, self.cache.as_ref(), cancel, span.clone());
            run.compute(self.pipeline.root).instrument(span).await
        };

        let files = match result {
            Ok(files) => files,
            Err(EvalError::Cancelled) => {
                tracing::info!("run cancelled {}", as_overhead(s));
                if let Some(cache) = &mut self.cache {
                    cache.reset();
                }
                return Ok(RunOutcome::Cancelled);
            }
            Err(e) => {
                if let Some(cache) = &mut self.cache {
                    cache.reset();
                }
                return Err(e.into());
            }
        };

        if let Some(cache) = &mut self.cache {
            if let Err(e) = cache.save() {
                cache.reset();
                return Err(e.into());
            }
            self.fingerprinted = true;
        }

        for state in self.queries.values_mut() {
            state.misses.clear();
        }
        self.touched.clear();

        tracing::info!("run produced {} files {}", files.len(), as_overhead(s));
        Ok(RunOutcome::Completed(files.to_vec()))
    }

    /// Re-resolves stale nodes and stages input fingerprints.
    async fn refresh(&mut self) -> Result<(), RunError> {
        let stale: Vec<_> = self.stale.iter().copied().collect();

        let resolved = try_join_all(stale.iter().map(|&id| {
            let patterns: &[QueryPattern] = match self.pipeline.node(id) {
                Node::Query(query) => query.patterns.as_slice(),
                Node::Ignore(ignore) => ignore.patterns.as_slice(),
                _ => &[],
            };
            let root = &self.root;
            async move { Ok::<_, QueryError>((id, resolve(root, patterns).await?)) }
        }))
        .await?;

        for (id, files) in resolved {
            if let Some(state) = self.queries.get_mut(&id) {
                state.result = files;
            } else if let Some(ignored) = self.ignores.get_mut(&id) {
                *ignored = files;
            }
            self.stale.remove(&id);
        }

        if self.cache.is_some() {
            self.stage_fingerprints().await?;
        }

        Ok(())
    }

    /// On the first run, compares every input against the hashes saved by the
    /// previous session and records the differences as cache misses. Later
    /// runs only rehash the touched paths.
    async fn stage_fingerprints(&mut self) -> Result<(), RunError> {
        let Some(cache) = &mut self.cache else {
            return Ok(());
        };

        if self.fingerprinted {
            let touched: Vec<_> = self.touched.iter().cloned().collect();
            let hashes = tokio::task::spawn_blocking(move || fingerprint(touched)).await?;
            cache.stage_input_changes(&self.touched, &hashes);
            return Ok(());
        }

        let inputs: BTreeSet<_> = self
            .queries
            .values()
            .flat_map(|state| state.result.iter().map(|file| file.content.clone()))
            .collect();

        let hashes = tokio::task::spawn_blocking(move || fingerprint(inputs)).await?;

        let previous = cache.inputs();
        let changed: Vec<_> = previous
            .keys()
            .chain(hashes.keys())
            .filter(|path| previous.get(*path) != hashes.get(*path))
            .cloned()
            .collect();

        if !changed.is_empty() {
            tracing::debug!("{} inputs changed since the last session", changed.len());
        }

        for path in &changed {
            for id in self.pipeline.queried_by(&self.root, path) {
                if let Some(state) = self.queries.get_mut(&id) {
                    state.misses.insert(path.clone());
                }
            }
        }

        cache.stage_inputs(hashes);
        Ok(())
    }
}
