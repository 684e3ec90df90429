use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::BlueprintError;
use crate::node::{
    Command, ContextNode, FilesNode, GroupBy, GroupNode, IgnoreNode, Node, NodeId, QueryNode,
    Transformer,
};
use crate::query::QueryPattern;
use crate::File;

static NEXT_BLUEPRINT: AtomicU64 = AtomicU64::new(0);

/// A reference to a node registered in a [`Blueprint`].
///
/// Handles are only meaningful for the blueprint that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    blueprint: u64,
    index: u32,
}

/// The blueprint of an asset pipeline.
///
/// Nodes are added through the constructor methods, which return builders.
/// Builders accumulate commands and are turned into [`Handle`]s by calling
/// `register`. Since a node can only refer to handles that already exist, the
/// resulting graph is always acyclic.
///
/// # Example
///
/// ```rust
/// use assetpipe::{Blueprint, Transformer};
///
/// let mut bp = Blueprint::new();
///
/// let drafts = bp.ignore(["posts/drafts/**"]).unwrap();
/// let posts = bp
///     .select(["posts/**/*.md"])
///     .pipe(Transformer::identity())
///     .register()
///     .unwrap();
/// let root = bp.group([drafts, posts]).register().unwrap();
///
/// let pipeline = bp.finish(root).unwrap();
/// ```
#[derive(Debug)]
pub struct Blueprint {
    id: u64,
    nodes: Vec<Node<Handle>>,
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self {
            id: NEXT_BLUEPRINT.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
        }
    }

    /// Selects files matching the query patterns.
    pub fn select<I, S>(&mut self, query: I) -> QueryDef<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryDef {
            blueprint: self,
            node: QueryNode {
                query: query.into_iter().map(Into::into).collect(),
                context: Utf8PathBuf::new(),
                claim: false,
                bulk: false,
                group_by: None,
                commands: Vec::new(),
                patterns: Vec::new(),
            },
        }
    }

    /// Selects files and claims them, hiding them from every query with a
    /// higher id.
    pub fn claim<I, S>(&mut self, query: I) -> QueryDef<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select(query).claim()
    }

    /// Removes matching files from every query in the pipeline.
    pub fn ignore<I, S>(&mut self, query: I) -> Result<Handle, BlueprintError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = Node::Ignore(IgnoreNode {
            query: query.into_iter().map(Into::into).collect(),
            context: Utf8PathBuf::new(),
            patterns: Vec::new(),
        });

        self.add(node)
    }

    /// A fixed set of files, never cached.
    pub fn files(&mut self, files: Vec<File>) -> StageDef<'_> {
        StageDef {
            blueprint: self,
            node: Node::Files(FilesNode {
                files,
                commands: Vec::new(),
            }),
        }
    }

    /// Concatenates the outputs of `children`.
    pub fn group(&mut self, children: impl IntoIterator<Item = Handle>) -> StageDef<'_> {
        StageDef {
            blueprint: self,
            node: Node::Group(GroupNode {
                children: children.into_iter().collect(),
                commands: Vec::new(),
            }),
        }
    }

    /// Like [`group`](Self::group), with `path` prefixed onto the queries of
    /// every descendant.
    pub fn context(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        children: impl IntoIterator<Item = Handle>,
    ) -> StageDef<'_> {
        StageDef {
            blueprint: self,
            node: Node::Context(ContextNode {
                context: path.into(),
                children: children.into_iter().collect(),
                commands: Vec::new(),
            }),
        }
    }

    fn get(&self, handle: Handle) -> Option<&Node<Handle>> {
        match handle.blueprint == self.id {
            true => self.nodes.get(handle.index as usize),
            false => None,
        }
    }

    fn add(&mut self, node: Node<Handle>) -> Result<Handle, BlueprintError> {
        for &child in node.children() {
            if self.get(child).is_none() {
                return Err(BlueprintError::InvalidPipelineReference(format!("{child:?}")));
            }
        }

        for &target in node.pulls() {
            match self.get(target) {
                Some(found) if found.is_interactive() => {}
                Some(found) => {
                    return Err(BlueprintError::InvalidPipelineReference(format!(
                        "{target:?} is an {} node",
                        found.kind()
                    )));
                }
                None => {
                    return Err(BlueprintError::InvalidPipelineReference(format!("{target:?}")));
                }
            }
        }

        let handle = Handle {
            blueprint: self.id,
            index: self.nodes.len() as u32,
        };
        self.nodes.push(node);

        Ok(handle)
    }

    /// Finalizes the pipeline rooted at `root`.
    ///
    /// Ids are assigned in preorder, effective contexts are propagated and all
    /// query patterns are compiled. Nodes unreachable from `root` are dropped.
    pub fn finish(self, root: Handle) -> Result<Pipeline, BlueprintError> {
        match self.get(root) {
            Some(node) if node.is_interactive() => {}
            Some(node) => {
                return Err(BlueprintError::NotAPipeline(format!("{root:?} is an {} node", node.kind())));
            }
            None => return Err(BlueprintError::NotAPipeline(format!("{root:?}"))),
        }

        let mut order = Vec::new();
        let mut contexts = HashMap::new();
        self.visit(root, Utf8Path::new(""), &mut order, &mut contexts);

        let ids: HashMap<Handle, NodeId> = order
            .iter()
            .enumerate()
            .map(|(i, &handle)| (handle, NodeId(i as u32)))
            .collect();

        let mut slots: Vec<_> = self.nodes.into_iter().map(Some).collect();
        let mut nodes = Vec::with_capacity(order.len());

        for handle in &order {
            let Some(node) = slots[handle.index as usize].take() else {
                continue;
            };

            let context = contexts.remove(handle).unwrap_or_default();
            let node = match node {
                Node::Query(mut query) => {
                    query.patterns = compile(&context, &query.query)?;
                    query.context = context;
                    Node::Query(query)
                }
                Node::Ignore(mut ignore) => {
                    ignore.patterns = compile(&context, &ignore.query)?;
                    ignore.context = context;
                    Node::Ignore(ignore)
                }
                other => other,
            };

            // every reference was validated at registration and is reachable
            nodes.push(node.map(|handle| ids[&handle]));
        }

        Ok(Pipeline {
            root: ids[&root],
            nodes,
            ids,
        })
    }

    fn visit(
        &self,
        handle: Handle,
        context: &Utf8Path,
        order: &mut Vec<Handle>,
        contexts: &mut HashMap<Handle, Utf8PathBuf>,
    ) {
        if contexts.contains_key(&handle) {
            return;
        }

        let node = &self.nodes[handle.index as usize];
        contexts.insert(handle, context.to_path_buf());
        order.push(handle);

        let inner = match node {
            Node::Context(ctx) => context.join(&ctx.context),
            _ => context.to_path_buf(),
        };

        for &child in node.children() {
            self.visit(child, &inner, order, contexts);
        }

        for &target in node.pulls() {
            self.visit(target, Utf8Path::new(""), order, contexts);
        }
    }
}

fn compile(context: &Utf8Path, query: &[String]) -> Result<Vec<QueryPattern>, BlueprintError> {
    query
        .iter()
        .map(|pattern| QueryPattern::compile(context, pattern).map_err(BlueprintError::from))
        .collect()
}

macro_rules! impl_commands {
    ($def:ident) => {
        impl $def<'_> {
            /// Replaces the running output with the output of `transformer`.
            pub fn pipe(mut self, transformer: Transformer) -> Self {
                self.commands().push(Command::Pipe(transformer));
                self
            }

            /// Runs every transformer over the same output and concatenates
            /// the results in declaration order.
            pub fn branch(mut self, transformers: impl IntoIterator<Item = Transformer>) -> Self {
                let transformers = transformers.into_iter().collect();
                self.commands().push(Command::Branch(transformers));
                self
            }

            /// Appends the output of another node to the running output.
            pub fn pull(mut self, target: Handle) -> Self {
                self.commands().push(Command::Pull(target));
                self
            }
        }
    };
}

/// Builder for query nodes.
pub struct QueryDef<'a> {
    blueprint: &'a mut Blueprint,
    node: QueryNode<Handle>,
}

impl QueryDef<'_> {
    /// Runs the commands once over all matched files instead of once per file.
    pub fn bulk(mut self) -> Self {
        self.node.bulk = true;
        self
    }

    /// Runs the commands once per group of files sharing a tag.
    pub fn group_by(mut self, group_by: GroupBy) -> Self {
        self.node.group_by = Some(group_by);
        self
    }

    pub fn claim(mut self) -> Self {
        self.node.claim = true;
        self
    }

    pub fn register(self) -> Result<Handle, BlueprintError> {
        self.blueprint.add(Node::Query(self.node))
    }

    fn commands(&mut self) -> &mut Vec<Command<Handle>> {
        &mut self.node.commands
    }
}

/// Builder for files, group and context nodes.
pub struct StageDef<'a> {
    blueprint: &'a mut Blueprint,
    node: Node<Handle>,
}

impl StageDef<'_> {
    pub fn register(self) -> Result<Handle, BlueprintError> {
        self.blueprint.add(self.node)
    }

    fn commands(&mut self) -> &mut Vec<Command<Handle>> {
        match &mut self.node {
            Node::Files(node) => &mut node.commands,
            Node::Group(node) => &mut node.commands,
            Node::Context(node) => &mut node.commands,
            Node::Query(node) => &mut node.commands,
            Node::Ignore(_) => unreachable!("stage builders never hold ignore nodes"),
        }
    }
}

impl_commands!(QueryDef);
impl_commands!(StageDef);

/// A finished, immutable pipeline.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
    ids: HashMap<Handle, NodeId>,
}

impl Pipeline {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Maps a builder handle to its finished id. `None` for nodes that were
    /// not reachable from the root.
    pub fn id_of(&self, handle: Handle) -> Option<NodeId> {
        self.ids.get(&handle).copied()
    }

    pub(crate) fn query_nodes(&self) -> impl Iterator<Item = (NodeId, &QueryNode)> {
        self.nodes.iter().enumerate().filter_map(|(i, node)| match node {
            Node::Query(query) => Some((NodeId(i as u32), query)),
            _ => None,
        })
    }

    pub(crate) fn ignore_nodes(&self) -> impl Iterator<Item = (NodeId, &IgnoreNode)> {
        self.nodes.iter().enumerate().filter_map(|(i, node)| match node {
            Node::Ignore(ignore) => Some((NodeId(i as u32), ignore)),
            _ => None,
        })
    }

    /// Query nodes with a pattern matching the absolute `path`.
    pub(crate) fn queried_by<'a>(
        &'a self,
        root: &'a Utf8Path,
        path: &'a Utf8Path,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.query_nodes()
            .filter(move |(_, query)| query.patterns.iter().any(|p| p.matches(root, path)))
            .map(|(id, _)| id)
    }

    /// Ignore nodes with a pattern matching the absolute `path`.
    pub(crate) fn ignored_by<'a>(
        &'a self,
        root: &'a Utf8Path,
        path: &'a Utf8Path,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.ignore_nodes()
            .filter(move |(_, ignore)| ignore.patterns.iter().any(|p| p.matches(root, path)))
            .map(|(id, _)| id)
    }
}
