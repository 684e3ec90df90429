//! The node model of a pipeline.
//!
//! A pipeline is a tree (more precisely a DAG, since sub-pipelines can be
//! shared) of [`Node`]s. Nodes are immutable once a [`Blueprint`] is
//! finished; everything that changes between runs lives in the
//! [`Runtime`](crate::Runtime).
//!
//! [`Blueprint`]: crate::Blueprint

use std::future::Future;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::future::BoxFuture;

use crate::File;
use crate::query::QueryPattern;

/// Stable identifier of a node inside a finished [`Pipeline`](crate::Pipeline).
///
/// Ids are assigned in preorder starting from the root, so they double as the
/// deterministic ordering used to settle contested claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type TransformerFn = dyn Fn(Vec<File>) -> BoxFuture<'static, anyhow::Result<Vec<File>>> + Send + Sync;

/// A user-supplied processing step, `Vec<File> -> Vec<File>`.
///
/// Transformers must be deterministic for caching to be sound: the engine
/// assumes the same input files always produce the same output files.
#[derive(Clone)]
pub struct Transformer(Arc<TransformerFn>);

impl Transformer {
    /// Wraps an asynchronous closure.
    ///
    /// # Example
    ///
    /// ```rust
    /// use assetpipe::Transformer;
    ///
    /// let reverse = Transformer::new(|mut files| async move {
    ///     files.reverse();
    ///     anyhow::Ok(files)
    /// });
    /// ```
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Vec<File>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<File>>> + Send + 'static,
    {
        Self(Arc::new(move |files| Box::pin(callback(files))))
    }

    /// Wraps a synchronous closure.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(Vec<File>) -> anyhow::Result<Vec<File>> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        Self(Arc::new(move |files| {
            let callback = callback.clone();
            Box::pin(async move { callback(files) })
        }))
    }

    /// The identity transformer.
    pub fn identity() -> Self {
        Self::sync(Ok)
    }

    pub(crate) fn call(&self, files: Vec<File>) -> BoxFuture<'static, anyhow::Result<Vec<File>>> {
        (self.0)(files)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transformer(*)")
    }
}

/// Tagging function used to partition the matches of a query.
#[derive(Clone)]
pub struct GroupBy(Arc<dyn Fn(&File) -> String + Send + Sync>);

impl GroupBy {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&File) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    /// Groups files by their extension; files without one share the `""` tag.
    pub fn extension() -> Self {
        Self::new(|file| file.extension().unwrap_or_default().to_string())
    }

    pub(crate) fn tag(&self, file: &File) -> String {
        (self.0)(file)
    }
}

impl std::fmt::Debug for GroupBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupBy(*)")
    }
}

/// A single step in the command sequence of an interactive node.
#[derive(Debug, Clone)]
pub enum Command<R = NodeId> {
    /// Replace the running output with the transformer's output.
    Pipe(Transformer),
    /// Run every transformer over the same output and concatenate results.
    Branch(Vec<Transformer>),
    /// Append the result of another node to the running output.
    Pull(R),
}

impl<R> Command<R> {
    pub(crate) fn map<S>(self, f: &mut impl FnMut(R) -> S) -> Command<S> {
        match self {
            Command::Pipe(t) => Command::Pipe(t),
            Command::Branch(ts) => Command::Branch(ts),
            Command::Pull(r) => Command::Pull(f(r)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilesNode<R = NodeId> {
    pub files: Vec<File>,
    pub commands: Vec<Command<R>>,
}

#[derive(Debug, Clone)]
pub struct QueryNode<R = NodeId> {
    pub query: Vec<String>,
    /// Effective context, set when the blueprint is finished.
    pub context: Utf8PathBuf,
    pub claim: bool,
    pub bulk: bool,
    pub group_by: Option<GroupBy>,
    pub commands: Vec<Command<R>>,
    pub(crate) patterns: Vec<QueryPattern>,
}

#[derive(Debug, Clone)]
pub struct IgnoreNode {
    pub query: Vec<String>,
    /// Effective context, set when the blueprint is finished.
    pub context: Utf8PathBuf,
    pub(crate) patterns: Vec<QueryPattern>,
}

#[derive(Debug, Clone)]
pub struct GroupNode<R = NodeId> {
    pub children: Vec<R>,
    pub commands: Vec<Command<R>>,
}

#[derive(Debug, Clone)]
pub struct ContextNode<R = NodeId> {
    /// Path prefixed onto every descendant query.
    pub context: Utf8PathBuf,
    pub children: Vec<R>,
    pub commands: Vec<Command<R>>,
}

/// One stage of the pipeline.
#[derive(Debug, Clone)]
pub enum Node<R = NodeId> {
    Files(FilesNode<R>),
    Query(QueryNode<R>),
    Ignore(IgnoreNode),
    Group(GroupNode<R>),
    Context(ContextNode<R>),
}

impl<R> Node<R> {
    /// Short name of the variant, used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Files(_) => "files",
            Node::Query(_) => "query",
            Node::Ignore(_) => "ignore",
            Node::Group(_) => "group",
            Node::Context(_) => "context",
        }
    }

    /// Every node except [`Node::Ignore`] carries commands and produces output.
    pub fn is_interactive(&self) -> bool {
        !matches!(self, Node::Ignore(_))
    }

    pub fn commands(&self) -> &[Command<R>] {
        match self {
            Node::Files(node) => &node.commands,
            Node::Query(node) => &node.commands,
            Node::Ignore(_) => &[],
            Node::Group(node) => &node.commands,
            Node::Context(node) => &node.commands,
        }
    }

    pub fn children(&self) -> &[R] {
        match self {
            Node::Group(node) => &node.children,
            Node::Context(node) => &node.children,
            _ => &[],
        }
    }

    /// Targets of every `Pull` command, in command order.
    pub fn pulls(&self) -> impl Iterator<Item = &R> {
        self.commands().iter().filter_map(|command| match command {
            Command::Pull(target) => Some(target),
            _ => None,
        })
    }

    /// Rewrites every node reference, keeping everything else intact.
    pub(crate) fn map<S>(self, mut f: impl FnMut(R) -> S) -> Node<S> {
        let mut commands = |commands: Vec<Command<R>>| -> Vec<Command<S>> {
            commands.into_iter().map(|c| c.map(&mut f)).collect()
        };

        match self {
            Node::Files(node) => Node::Files(FilesNode {
                files: node.files,
                commands: commands(node.commands),
            }),
            Node::Query(node) => Node::Query(QueryNode {
                query: node.query,
                context: node.context,
                claim: node.claim,
                bulk: node.bulk,
                group_by: node.group_by,
                commands: commands(node.commands),
                patterns: node.patterns,
            }),
            Node::Ignore(node) => Node::Ignore(node),
            Node::Group(node) => {
                let commands = commands(node.commands);
                Node::Group(GroupNode {
                    children: node.children.into_iter().map(&mut f).collect(),
                    commands,
                })
            }
            Node::Context(node) => {
                let commands = commands(node.commands);
                Node::Context(ContextNode {
                    context: node.context,
                    children: node.children.into_iter().map(&mut f).collect(),
                    commands,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_accessors() {
        let node: Node<u32> = Node::Group(GroupNode {
            children: vec![1, 2],
            commands: vec![
                Command::Pipe(Transformer::identity()),
                Command::Pull(3),
                Command::Pull(4),
            ],
        });

        assert!(node.is_interactive());
        assert_eq!(node.kind(), "group");
        assert_eq!(node.children(), &[1, 2]);
        assert_eq!(node.pulls().copied().collect::<Vec<_>>(), vec![3, 4]);

        let mapped = node.map(|r| r * 10);
        assert_eq!(mapped.children(), &[10, 20]);
        assert_eq!(mapped.pulls().copied().collect::<Vec<_>>(), vec![30, 40]);
    }

    #[test]
    fn test_ignore_has_no_commands() {
        let node: Node<u32> = Node::Ignore(IgnoreNode {
            query: vec!["*.tmp".into()],
            context: Utf8PathBuf::new(),
            patterns: vec![],
        });

        assert!(!node.is_interactive());
        assert!(node.commands().is_empty());
        assert!(node.children().is_empty());
    }

    #[tokio::test]
    async fn test_transformers() {
        let files = vec![File::new("", "a.txt", "/a.txt"), File::new("", "b.txt", "/b.txt")];

        let reverse = Transformer::new(|mut files: Vec<File>| async move {
            files.reverse();
            anyhow::Ok(files)
        });
        let out = reverse.call(files.clone()).await.unwrap();
        assert_eq!(out[0].basename, "b.txt");

        let out = Transformer::identity().call(files.clone()).await.unwrap();
        assert_eq!(out, files);

        let failing = Transformer::sync(|_| anyhow::bail!("boom"));
        assert!(failing.call(files).await.is_err());
    }

    #[test]
    fn test_group_by_extension() {
        let tag = GroupBy::extension();
        assert_eq!(tag.tag(&File::new("", "a.txt", "/a.txt")), "txt");
        assert_eq!(tag.tag(&File::new("", "Makefile", "/Makefile")), "");
    }
}
