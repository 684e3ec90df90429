//! Watch mode.
//!
//! The controller owns at most one run at a time. The run is spawned onto the
//! runtime together with the [`Runtime`] it operates on, and hands the
//! runtime back when it ends. When a change arrives:
//!
//! 1. Changes that can't alter the output wait until the run in flight, if
//!    any, is over.
//! 2. Otherwise the run in flight is cancelled and awaited. Cancelling resets
//!    the cache draft, so the committed cache only ever holds results of
//!    complete runs.
//! 3. Script changes rebuild the pipeline from its source. Any other change
//!    is recorded in the runtime, which marks the affected queries.
//! 4. A new run is started.
//!
//! A run task that panics takes its runtime with it. The runtime is rebuilt
//! from the source and the controller waits for the next change.

use std::collections::HashSet;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::{JoinError, JoinHandle};

use crate::blueprint::Pipeline;
use crate::error::{RunError, WatchError};
use crate::output::save_to_dist;
use crate::utils::{collapse_paths, parent_dir};
use crate::{CancelToken, ChangeKind, PipelineSource, RunOutcome, Runtime, Settings, prepare};

type Finished = (Runtime, Result<RunOutcome, RunError>);
type Watcher = Debouncer<RecommendedWatcher, RecommendedCache>;
type Change = (Utf8PathBuf, ChangeKind);

struct Running {
    token: CancelToken,
    handle: JoinHandle<Finished>,
}

impl Running {
    fn start(mut runtime: Runtime) -> Self {
        let token = CancelToken::new();

        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                let result = runtime.execute(&token).await;
                (runtime, result)
            }
        });

        Self { token, handle }
    }

    async fn stop(self) -> Result<Finished, JoinError> {
        self.token.cancel();
        self.handle.await
    }
}

/// Resolves once the run in flight ends, never if there is none.
async fn join(running: &mut Option<Running>) -> Result<Finished, JoinError> {
    match running {
        Some(running) => (&mut running.handle).await,
        None => std::future::pending().await,
    }
}

/// The patterns of the current pipeline, readable while a run owns the
/// runtime.
struct Patterns {
    root: Utf8PathBuf,
    pipeline: Arc<Pipeline>,
}

impl Patterns {
    fn of(runtime: &Runtime) -> Self {
        Self {
            root: runtime.root().to_path_buf(),
            pipeline: runtime.shared_pipeline(),
        }
    }

    /// Whether a change to `path` can alter the output of a run.
    fn affects(&self, path: &Utf8Path) -> bool {
        self.pipeline.ignored_by(&self.root, path).next().is_none()
            && self.pipeline.queried_by(&self.root, path).next().is_some()
    }

    /// Whether `path` is matched by any query or ignore pattern.
    fn matches(&self, path: &Utf8Path) -> bool {
        self.pipeline.queried_by(&self.root, path).next().is_some()
            || self.pipeline.ignored_by(&self.root, path).next().is_some()
    }
}

pub(crate) async fn watch<S>(source: &S, settings: &Settings) -> Result<(), WatchError>
where
    S: PipelineSource + ?Sized,
{
    let (tx, mut rx) = unbounded_channel();

    let (runtime, mut scripts) = prepare(source, settings)?;
    let mut patterns = Patterns::of(&runtime);
    let mut _watcher = subscribe(&runtime, &scripts, settings, tx.clone())?;

    tracing::info!("running initial build...");
    let mut idle = None;
    let mut running = Some(Running::start(runtime));
    // changes held back while a run they can't affect is in flight
    let mut pending: Vec<Change> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let Some(running) = running.take() {
                    let _ = running.stop().await;
                }
                tracing::info!("stopped watching");
                return Ok(());
            }
            finished = join(&mut running) => {
                running = None;
                let Some((mut runtime, _)) = settle(finished, source, settings) else {
                    continue;
                };

                let mut restart = false;
                for (path, kind) in pending.drain(..) {
                    restart |= runtime.record_change(&path, kind);
                }

                match restart {
                    true => running = Some(Running::start(runtime)),
                    false => idle = Some(runtime),
                }
            }
            Some(events) = rx.recv() => {
                let Some((reload, mut changes)) = classify(events, &scripts) else {
                    continue;
                };

                changes.retain(|(path, _)| patterns.matches(path));
                if !reload && changes.is_empty() {
                    continue;
                }

                if running.is_some() && !reload && !changes.iter().any(|(path, _)| patterns.affects(path)) {
                    pending.extend(changes);
                    continue;
                }

                // the previous run must hand back the runtime before changes
                // can be applied
                let mut restart = false;
                if let Some(previous) = running.take()
                    && let Some((runtime, cancelled)) = settle(previous.stop().await, source, settings)
                {
                    restart = cancelled;
                    idle = Some(runtime);
                }

                if reload {
                    tracing::info!("pipeline scripts changed, reloading...");
                    match prepare(source, settings) {
                        Ok((runtime, new_scripts)) => {
                            drop(_watcher);
                            _watcher = subscribe(&runtime, &new_scripts, settings, tx.clone())?;
                            scripts = new_scripts;
                            patterns = Patterns::of(&runtime);
                            pending.clear();
                            idle = Some(runtime);
                            restart = true;
                        }
                        Err(e) => tracing::error!("failed to reload the pipeline:\n{e}"),
                    }
                }

                let Some(mut runtime) = idle.take().or_else(|| recover(source, settings)) else {
                    continue;
                };

                for (path, kind) in pending.drain(..).chain(changes) {
                    restart |= runtime.record_change(&path, kind);
                }

                if restart {
                    tracing::info!("change detected, rerunning...");
                    running = Some(Running::start(runtime));
                } else {
                    idle = Some(runtime);
                }
            }
        }
    }
}

/// Takes back the runtime of a finished run, reporting its outcome. Also
/// returns whether the run was cancelled.
///
/// A run task that failed to complete lost its runtime, so a fresh one is
/// prepared from the source.
fn settle<S>(
    finished: Result<Finished, JoinError>,
    source: &S,
    settings: &Settings,
) -> Option<(Runtime, bool)>
where
    S: PipelineSource + ?Sized,
{
    match finished {
        Ok((runtime, result)) => {
            let cancelled = matches!(result, Ok(RunOutcome::Cancelled));
            report(result, settings);
            Some((runtime, cancelled))
        }
        Err(e) => {
            tracing::error!("run failed, waiting for changes...\n{e}");
            recover(source, settings).map(|runtime| (runtime, false))
        }
    }
}

fn recover<S>(source: &S, settings: &Settings) -> Option<Runtime>
where
    S: PipelineSource + ?Sized,
{
    match prepare(source, settings) {
        Ok((runtime, _)) => Some(runtime),
        Err(e) => {
            tracing::error!("failed to reload the pipeline:\n{e}");
            None
        }
    }
}

/// Logs the outcome of a run, writing the files of a completed one.
fn report(result: Result<RunOutcome, RunError>, settings: &Settings) {
    match result {
        Ok(RunOutcome::Completed(files)) => {
            if let Some(out_dir) = &settings.out_dir
                && let Err(e) = save_to_dist(&files, &settings.resolve(out_dir))
            {
                tracing::error!("{e}");
                return;
            }
            tracing::info!("run complete, watching for changes...");
        }
        Ok(RunOutcome::Cancelled) => {}
        Err(e) => tracing::error!("run failed, waiting for changes...\n{e}"),
    }
}

/// Splits a batch of events into a reload flag and input changes. Returns
/// `None` when there is nothing to act on.
fn classify(result: DebounceEventResult, scripts: &[Utf8PathBuf]) -> Option<(bool, Vec<Change>)> {
    let events = match result {
        Ok(events) => events,
        Err(errors) => {
            for e in errors {
                tracing::error!("watch error: {e:?}");
            }
            return None;
        }
    };

    let mut reload = false;
    let mut seen = HashSet::new();
    let mut changes = Vec::new();

    for de in events {
        let Some(kind) = change_kind(&de.event.kind) else {
            continue;
        };

        for path in &de.event.paths {
            let Some(path) = Utf8Path::from_path(path) else {
                continue;
            };

            if scripts.iter().any(|script| script == path) {
                reload = true;
            } else if seen.insert((path.to_path_buf(), kind)) {
                changes.push((path.to_path_buf(), kind));
            }
        }
    }

    match reload || !changes.is_empty() {
        true => Some((reload, changes)),
        false => None,
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Remove(_) => Some(ChangeKind::Delete),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeKind::Modify),
        EventKind::Access(_) => None,
    }
}

/// Starts watching the script directories and the base directory of every
/// query and ignore pattern.
fn subscribe(
    runtime: &Runtime,
    scripts: &[Utf8PathBuf],
    settings: &Settings,
    tx: UnboundedSender<DebounceEventResult>,
) -> Result<Watcher, WatchError> {
    let mut debouncer = new_debouncer(settings.debounce, None, move |result: DebounceEventResult| {
        // the receiver is only gone once the session is over
        let _ = tx.send(result);
    })?;

    for path in watch_roots(runtime, scripts) {
        tracing::info!("watching {path}");
        debouncer.watch(&path, RecursiveMode::Recursive)?;
    }

    Ok(debouncer)
}

fn watch_roots(runtime: &Runtime, scripts: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let root = runtime.root();

    let patterns = runtime
        .pipeline()
        .query_nodes()
        .flat_map(|(_, query)| query.patterns.iter())
        .chain(runtime.pipeline().ignore_nodes().flat_map(|(_, ignore)| ignore.patterns.iter()));

    let bases = patterns.map(|pattern| root.join(&pattern.base));
    let dirs = scripts.iter().map(|script| parent_dir(script)).chain(bases);

    collapse_paths(dirs.filter_map(|path| nearest_dir(&path)))
}

/// The closest ancestor of `path` that exists as a directory, itself included.
fn nearest_dir(path: &Utf8Path) -> Option<Utf8PathBuf> {
    path.ancestors().find(|p| p.is_dir()).map(Utf8Path::to_path_buf)
}
