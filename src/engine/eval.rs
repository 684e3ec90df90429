use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::{BoxFuture, try_join_all};
use tokio::sync::OnceCell;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::File;
use crate::blueprint::Pipeline;
use crate::cache::{Cache, CacheKey};
use crate::engine::CancelToken;
use crate::error::{EvalError, TransformerError};
use crate::node::{Command, Node, NodeId, QueryNode, Transformer};
use crate::query::QueryState;

type Output = Result<Arc<[File]>, EvalError>;

/// Cache verdict of a node for the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Mark {
    pub cache_hit: bool,
    /// Start of the earliest pull batch with a target that isn't clean.
    pub first_dirty_pull: Option<usize>,
}

impl Mark {
    pub fn clean(self) -> bool {
        self.cache_hit && self.first_dirty_pull.is_none()
    }
}

/// Computes marks for every node. Nodes are visited children and pull
/// targets first.
pub(crate) fn marks(pipeline: &Pipeline, queries: &BTreeMap<NodeId, QueryState>) -> Vec<Mark> {
    let mut marks = vec![None; pipeline.nodes.len()];

    for i in 0..pipeline.nodes.len() {
        mark(pipeline, queries, &mut marks, NodeId(i as u32));
    }

    marks.into_iter().map(Option::unwrap_or_default).collect()
}

fn mark(
    pipeline: &Pipeline,
    queries: &BTreeMap<NodeId, QueryState>,
    marks: &mut Vec<Option<Mark>>,
    id: NodeId,
) -> Mark {
    if let Some(mark) = marks[id.index()] {
        return mark;
    }

    let node = pipeline.node(id);

    let cache_hit = match node {
        Node::Query(_) => queries.get(&id).is_none_or(|state| state.misses.is_empty()),
        Node::Group(_) | Node::Context(_) => node
            .children()
            .iter()
            .filter(|child| pipeline.node(**child).is_interactive())
            .fold(true, |acc, &child| mark(pipeline, queries, marks, child).clean() && acc),
        Node::Files(_) | Node::Ignore(_) => true,
    };

    let mut first_dirty_pull = None;
    let mut batch = None;
    for (i, command) in node.commands().iter().enumerate() {
        match command {
            Command::Pull(target) => {
                let start = *batch.get_or_insert(i);
                if !mark(pipeline, queries, marks, *target).clean() && first_dirty_pull.is_none() {
                    first_dirty_pull = Some(start);
                }
            }
            _ => batch = None,
        }
    }

    let mark = Mark {
        cache_hit,
        first_dirty_pull,
    };
    marks[id.index()] = Some(mark);
    mark
}

/// State of a single evaluation of the pipeline.
pub(crate) struct Run<'a> {
    pipeline: &'a Pipeline,
    queries: &'a BTreeMap<NodeId, QueryState>,
    cache: Option<&'a Cache>,
    cancel: &'a CancelToken,
    marks: Vec<Mark>,
    cells: Vec<OnceCell<Output>>,
    span: tracing::Span,
}

impl<'a> Run<'a> {
    pub fn new(
        pipeline: &'a Pipeline,
        queries: &'a BTreeMap<NodeId, QueryState>,
        cache: Option<&'a Cache>,
        cancel: &'a CancelToken,
        span: tracing::Span,
    ) -> Self {
        let marks = match cache {
            Some(_) => marks(pipeline, queries),
            None => vec![Mark::default(); pipeline.nodes.len()],
        };

        Self {
            pipeline,
            queries,
            cache,
            cancel,
            marks,
            cells: (0..pipeline.nodes.len()).map(|_| OnceCell::new()).collect(),
            span,
        }
    }

    /// Result of a node, computed at most once per run.
    pub fn compute(&self, id: NodeId) -> BoxFuture<'_, Output> {
        Box::pin(async move {
            self.cells[id.index()]
                .get_or_init(|| self.evaluate(id))
                .await
                .clone()
        })
    }

    fn evaluate(&self, id: NodeId) -> BoxFuture<'_, Output> {
        Box::pin(async move {
            let node = self.pipeline.node(id);
            let mark = self.marks[id.index()];

            if let Some(cache) = self.cache
                && mark.cache_hit
                && let Some(files) = self.resume(cache, id, node, mark).await?
            {
                self.span.pb_inc(1);
                return Ok(files.into());
            }

            self.cancel.check()?;

            if let Some(cache) = self.cache {
                cache.evaluating(id);
            }

            let output = match node {
                Node::Files(fixed) => {
                    self.run_commands(id, &fixed.commands, 0, fixed.files.clone(), false)
                        .await?
                }
                Node::Query(query) => self.evaluate_query(id, query, mark).await?,
                Node::Ignore(_) => Vec::new(),
                Node::Group(_) | Node::Context(_) => {
                    let children = node
                        .children()
                        .iter()
                        .filter(|child| self.pipeline.node(**child).is_interactive())
                        .map(|child| self.compute(*child));

                    let input = try_join_all(children)
                        .await?
                        .iter()
                        .flat_map(|files| files.iter().cloned())
                        .collect();

                    let output = self.run_commands(id, node.commands(), 0, input, true).await?;
                    self.write(CacheKey::Pipeline(id), &output);
                    output
                }
            };

            self.span.pb_inc(1);
            Ok(output.into())
        })
    }

    /// Tries to answer a cache hit from the draft, resuming at the first dirty
    /// pull batch if there is one.
    async fn resume(
        &self,
        cache: &Cache,
        id: NodeId,
        node: &Node,
        mark: Mark,
    ) -> Result<Option<Vec<File>>, EvalError> {
        match mark.first_dirty_pull {
            None => {
                let files = cache.read(&CacheKey::Pipeline(id));
                if files.is_some() {
                    tracing::debug!("cache hit for node {id}");
                }
                Ok(files)
            }
            Some(index) => {
                let Some(snapshot) = cache.read(&CacheKey::BeforePull(id, index)) else {
                    return Ok(None);
                };

                tracing::debug!("resuming node {id} at command {index}");
                let output = self.run_commands(id, node.commands(), index, snapshot, true).await?;
                cache.write(&CacheKey::Pipeline(id), &output);
                Ok(Some(output))
            }
        }
    }

    async fn evaluate_query(&self, id: NodeId, query: &QueryNode, mark: Mark) -> Result<Vec<File>, EvalError> {
        let empty = QueryState::default();
        let state = self.queries.get(&id).unwrap_or(&empty);
        let reusable = self.cache.is_some() && mark.first_dirty_pull.is_none();

        if query.bulk {
            let output = self.run_commands(id, &query.commands, 0, state.filtered.clone(), true).await?;
            self.write(CacheKey::Pipeline(id), &output);
            return Ok(output);
        }

        if let Some(group_by) = &query.group_by {
            let mut index = HashMap::new();
            let mut groups: Vec<(String, Vec<File>)> = Vec::new();

            for file in &state.filtered {
                let tag = group_by.tag(file);
                let i = *index.entry(tag.clone()).or_insert_with(|| {
                    groups.push((tag, Vec::new()));
                    groups.len() - 1
                });
                groups[i].1.push(file.clone());
            }

            let outputs = groups.into_iter().map(|(tag, files)| async move {
                let key = CacheKey::QueryGroup(id, tag);
                let missed = files.iter().any(|file| state.misses.contains(&file.content));

                if reusable && !missed && let Some(cached) = self.read(&key) {
                    return Ok(cached);
                }

                let output = self.run_commands(id, &query.commands, 0, files, false).await?;
                self.write(key, &output);
                Ok::<_, EvalError>(output)
            });

            return Ok(try_join_all(outputs).await?.into_iter().flatten().collect());
        }

        let outputs = state.filtered.iter().map(|file| async move {
            let key = CacheKey::QueryFile(id, file.content.clone());

            if reusable
                && !state.misses.contains(&file.content)
                && let Some(cached) = self.read(&key)
            {
                return Ok(cached);
            }

            let output = self.run_commands(id, &query.commands, 0, vec![file.clone()], false).await?;
            self.write(key, &output);
            Ok::<_, EvalError>(output)
        });

        Ok(try_join_all(outputs).await?.into_iter().flatten().collect())
    }

    /// Runs `commands` from `start` over `output`. Nodes that run their
    /// commands once checkpoint the running output before each pull batch.
    async fn run_commands(
        &self,
        id: NodeId,
        commands: &[Command],
        start: usize,
        mut output: Vec<File>,
        checkpoint: bool,
    ) -> Result<Vec<File>, EvalError> {
        let mut i = start;

        while i < commands.len() {
            self.cancel.check()?;

            match &commands[i] {
                Command::Pipe(transformer) => {
                    output = call(id, transformer, output).await?;
                    i += 1;
                }
                Command::Branch(transformers) => {
                    let branches = transformers.iter().map(|t| call(id, t, output.clone()));
                    output = try_join_all(branches).await?.into_iter().flatten().collect();
                    i += 1;
                }
                Command::Pull(_) => {
                    if checkpoint {
                        self.write(CacheKey::BeforePull(id, i), &output);
                    }

                    let end = commands[i..]
                        .iter()
                        .position(|command| !matches!(command, Command::Pull(_)))
                        .map_or(commands.len(), |n| i + n);

                    let targets = commands[i..end].iter().filter_map(|command| match command {
                        Command::Pull(target) => Some(self.compute(*target)),
                        _ => None,
                    });

                    for files in try_join_all(targets).await? {
                        output.extend(files.iter().cloned());
                    }

                    i = end;
                }
            }
        }

        Ok(output)
    }

    fn read(&self, key: &CacheKey) -> Option<Vec<File>> {
        self.cache.and_then(|cache| cache.read(key))
    }

    fn write(&self, key: CacheKey, files: &[File]) {
        if let Some(cache) = self.cache {
            cache.write(&key, files);
        }
    }
}

async fn call(id: NodeId, transformer: &Transformer, files: Vec<File>) -> Result<Vec<File>, EvalError> {
    transformer
        .call(files)
        .await
        .map_err(|e| EvalError::Transformer(id, TransformerError::from(e)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::Blueprint;

    fn missing(paths: &[&str]) -> QueryState {
        QueryState {
            misses: paths.iter().map(Utf8PathBuf::from).collect::<HashSet<_>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_marks() {
        let mut bp = Blueprint::new();
        let clean = bp.select(["clean/*"]).register().unwrap();
        let dirty = bp.select(["dirty/*"]).register().unwrap();
        let other = bp.select(["other/*"]).register().unwrap();
        let root = bp
            .group([clean])
            .pipe(Transformer::identity())
            .pull(other)
            .pipe(Transformer::identity())
            .pull(clean)
            .pull(dirty)
            .register()
            .unwrap();

        let pipeline = bp.finish(root).unwrap();
        let id = |h| pipeline.id_of(h).unwrap();

        let mut queries = BTreeMap::new();
        queries.insert(id(clean), QueryState::default());
        queries.insert(id(other), QueryState::default());
        queries.insert(id(dirty), missing(&["/dirty/a"]));

        let marks = marks(&pipeline, &queries);

        assert!(marks[id(clean).index()].clean());
        assert!(!marks[id(dirty).index()].cache_hit);
        assert_eq!(
            marks[id(root).index()],
            Mark {
                cache_hit: true,
                first_dirty_pull: Some(3),
            }
        );
    }

    #[test]
    fn test_marks_dirty_child() {
        let mut bp = Blueprint::new();
        let dirty = bp.select(["dirty/*"]).register().unwrap();
        let inner = bp.group([dirty]).register().unwrap();
        let root = bp.group([inner]).register().unwrap();

        let pipeline = bp.finish(root).unwrap();
        let id = |h| pipeline.id_of(h).unwrap();

        let mut queries = BTreeMap::new();
        queries.insert(id(dirty), missing(&["/dirty/a"]));

        let marks = marks(&pipeline, &queries);

        assert!(!marks[id(inner).index()].cache_hit);
        assert!(!marks[id(root).index()].cache_hit);
    }
}
