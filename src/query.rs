//! Query resolution and the claim/ignore overlay.

use std::collections::{BTreeMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::File;
use crate::error::QueryError;
use crate::node::NodeId;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// A query pattern split into a static base directory and a glob matched
/// against paths relative to that base.
#[derive(Debug, Clone)]
pub(crate) struct QueryPattern {
    /// The pattern as written, joined onto its effective context.
    pub source: String,
    pub base: Utf8PathBuf,
    /// `None` for literal paths.
    pub glob: Option<Pattern>,
}

impl QueryPattern {
    pub fn compile(context: &Utf8Path, pattern: &str) -> Result<Self, glob::PatternError> {
        let joined = context.join(pattern);

        let components: Vec<_> = joined.components().collect();
        let split_idx = components
            .iter()
            .position(|c| c.as_str().contains(['*', '?', '[']))
            .unwrap_or(components.len());

        let base: Utf8PathBuf = components.iter().take(split_idx).collect();
        let rest: Vec<_> = components.iter().skip(split_idx).map(|c| c.as_str()).collect();

        let glob = match rest.is_empty() {
            true => None,
            false => Some(Pattern::new(&rest.join("/"))?),
        };

        Ok(Self {
            source: joined.into_string(),
            base,
            glob,
        })
    }

    pub fn is_literal(&self) -> bool {
        self.glob.is_none()
    }

    /// Checks whether an absolute path would be matched by this pattern.
    pub fn matches(&self, root: &Utf8Path, path: &Utf8Path) -> bool {
        let base = root.join(&self.base);

        match &self.glob {
            None => path == base,
            Some(glob) => match path.strip_prefix(&base) {
                Ok(rel) => glob.matches_with(rel.as_str(), MATCH_OPTIONS),
                Err(_) => false,
            },
        }
    }
}

/// Resolves patterns against the filesystem, concatenating matches in
/// pattern order.
pub(crate) async fn resolve(root: &Utf8Path, patterns: &[QueryPattern]) -> Result<Vec<File>, QueryError> {
    let mut files = Vec::new();

    for pattern in patterns {
        let base = root.join(&pattern.base);

        match &pattern.glob {
            None => {
                let is_file = tokio::fs::metadata(&base)
                    .await
                    .map(|meta| meta.is_file())
                    .unwrap_or(false);

                if !is_file {
                    return Err(QueryError::NotFound {
                        pattern: pattern.source.clone(),
                        path: base,
                    });
                }

                let basename = base.file_name().unwrap_or_default().to_string();
                files.push(File::new("", basename, base));
            }
            Some(glob) => {
                let glob = glob.clone();
                let found = tokio::task::spawn_blocking(move || walk(&base, &glob)).await??;
                files.extend(found);
            }
        }
    }

    Ok(files)
}

fn walk(base: &Utf8Path, glob: &Pattern) -> Result<Vec<File>, QueryError> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(base) {
        let entry = entry?;
        if entry.file_type().is_file() {
            paths.push(Utf8PathBuf::try_from(entry.into_path())?);
        }
    }

    paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let files = paths
        .into_iter()
        .filter_map(|path| {
            let rel = path.strip_prefix(base).ok()?;
            if !glob.matches_with(rel.as_str(), MATCH_OPTIONS) {
                return None;
            }

            let dirname = rel.parent().map(Utf8Path::to_path_buf).unwrap_or_default();
            let basename = rel.file_name()?.to_string();
            Some(File::new(dirname, basename, path))
        })
        .collect();

    Ok(files)
}

/// Session state of a query node.
#[derive(Debug, Default)]
pub(crate) struct QueryState {
    pub claim: bool,
    /// Everything matched by the node's patterns.
    pub result: Vec<File>,
    /// `result` minus ignored and previously claimed files.
    pub filtered: Vec<File>,
    /// Inputs changed since the last successful save.
    pub misses: HashSet<Utf8PathBuf>,
}

/// Subtracts ignored files from every query, then hands out claimed files in
/// node id order.
pub(crate) fn overlay<'a>(
    ignored: impl IntoIterator<Item = &'a File>,
    queries: &mut BTreeMap<NodeId, QueryState>,
) {
    let mut occupied: HashSet<Utf8PathBuf> = ignored.into_iter().map(|file| file.content.clone()).collect();

    for state in queries.values_mut() {
        state.filtered = state
            .result
            .iter()
            .filter(|file| !occupied.contains(&file.content))
            .cloned()
            .collect();

        if state.claim {
            occupied.extend(state.filtered.iter().map(|file| file.content.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        for path in ["a/x.txt", "a/b/y.txt", "a/b/z.md", "a/.hidden.txt", "top.txt"] {
            let path = root.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, path.as_str()).unwrap();
        }

        (dir, root)
    }

    #[test]
    fn test_compile_splits_base() {
        let pattern = QueryPattern::compile(Utf8Path::new("site"), "posts/**/*.md").unwrap();
        assert_eq!(pattern.base, "site/posts");
        assert_eq!(pattern.glob.unwrap().as_str(), "**/*.md");

        let pattern = QueryPattern::compile(Utf8Path::new(""), "README.md").unwrap();
        assert!(pattern.is_literal());
        assert_eq!(pattern.base, "README.md");

        let pattern = QueryPattern::compile(Utf8Path::new("a"), "*.txt").unwrap();
        assert_eq!(pattern.base, "a");
        assert_eq!(pattern.source, "a/*.txt");
    }

    #[test]
    fn test_compile_rejects_invalid_glob() {
        assert!(QueryPattern::compile(Utf8Path::new(""), "a/[*.txt").is_err());
    }

    #[test]
    fn test_matches() {
        let root = Utf8Path::new("/r");
        let star = QueryPattern::compile(Utf8Path::new("a"), "*.txt").unwrap();
        let deep = QueryPattern::compile(Utf8Path::new("a"), "**/*.txt").unwrap();
        let literal = QueryPattern::compile(Utf8Path::new(""), "top.txt").unwrap();

        assert!(star.matches(root, Utf8Path::new("/r/a/x.txt")));
        assert!(!star.matches(root, Utf8Path::new("/r/a/b/y.txt")));
        assert!(deep.matches(root, Utf8Path::new("/r/a/b/y.txt")));
        assert!(!deep.matches(root, Utf8Path::new("/r/other/y.txt")));
        assert!(!deep.matches(root, Utf8Path::new("/r/a/.hidden.txt")));
        assert!(!deep.matches(root, Utf8Path::new("/r/a/.git/y.txt")));
        assert!(literal.matches(root, Utf8Path::new("/r/top.txt")));
        assert!(!literal.matches(root, Utf8Path::new("/r/a/top.txt")));
    }

    #[tokio::test]
    async fn test_resolve_glob() {
        let (_dir, root) = fixture();
        let patterns = [QueryPattern::compile(Utf8Path::new(""), "a/**/*.txt").unwrap()];

        let files = resolve(&root, &patterns).await.unwrap();
        let rel: Vec<_> = files.iter().map(File::relative).collect();

        // wildcards never match a leading dot
        assert_eq!(rel, vec![Utf8PathBuf::from("b/y.txt"), "x.txt".into()]);
        assert_eq!(files[0].dirname, "b");
        assert_eq!(files[0].content, root.join("a/b/y.txt"));

        let patterns = [QueryPattern::compile(Utf8Path::new("a"), ".*.txt").unwrap()];
        let files = resolve(&root, &patterns).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].basename, ".hidden.txt");
    }

    #[tokio::test]
    async fn test_resolve_concatenates_in_pattern_order() {
        let (_dir, root) = fixture();
        let patterns = [
            QueryPattern::compile(Utf8Path::new(""), "top.txt").unwrap(),
            QueryPattern::compile(Utf8Path::new("a/b"), "*").unwrap(),
        ];

        let files = resolve(&root, &patterns).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.basename.as_str()).collect();

        assert_eq!(names, vec!["top.txt", "y.txt", "z.md"]);
        assert_eq!(files[0].dirname, "");
    }

    #[tokio::test]
    async fn test_resolve_missing() {
        let (_dir, root) = fixture();

        let missing_base = [QueryPattern::compile(Utf8Path::new(""), "nope/*.txt").unwrap()];
        assert!(resolve(&root, &missing_base).await.unwrap().is_empty());

        let missing_literal = [QueryPattern::compile(Utf8Path::new(""), "nope.txt").unwrap()];
        match resolve(&root, &missing_literal).await {
            Err(QueryError::NotFound { pattern, path }) => {
                assert_eq!(pattern, "nope.txt");
                assert_eq!(path, root.join("nope.txt"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_overlay_without_ignores_or_claims() {
        let files = vec![File::new("", "a", "/a"), File::new("", "b", "/b")];

        let mut queries = BTreeMap::new();
        for id in [NodeId(1), NodeId(2)] {
            queries.insert(
                id,
                QueryState {
                    result: files.clone(),
                    ..Default::default()
                },
            );
        }

        overlay([], &mut queries);

        for state in queries.values() {
            assert_eq!(state.filtered, state.result);
        }
    }

    #[test]
    fn test_overlay_claims_in_id_order() {
        let a = File::new("", "a", "/a");
        let b = File::new("", "b", "/b");
        let c = File::new("", "c", "/c");

        let mut queries = BTreeMap::new();
        queries.insert(
            NodeId(1),
            QueryState {
                claim: true,
                result: vec![a.clone(), b.clone()],
                ..Default::default()
            },
        );
        queries.insert(
            NodeId(2),
            QueryState {
                result: vec![a.clone(), b.clone(), c.clone()],
                ..Default::default()
            },
        );
        queries.insert(
            NodeId(3),
            QueryState {
                result: vec![c.clone(), a.clone()],
                ..Default::default()
            },
        );

        overlay([&b], &mut queries);

        assert_eq!(queries[&NodeId(1)].filtered, vec![a.clone()]);
        assert_eq!(queries[&NodeId(2)].filtered, vec![c.clone()]);
        assert_eq!(queries[&NodeId(3)].filtered, vec![c]);
    }
}
