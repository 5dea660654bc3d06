//! A small recursive container for argument and result structures whose shape is only known at
//! runtime. A `Tree` is either a leaf value, an ordered list of trees, or an ordered mapping of
//! string keys to trees. Leaves are addressed by a `TreePath`, the sequence of list indices and
//! map keys leading from the root to the leaf.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "[{i}]"),
            PathSegment::Key(k) => write!(f, "[{k:?}]"),
        }
    }
}

pub type TreePath = Vec<PathSegment>;

#[derive(Debug, Clone, PartialEq)]
pub enum Tree<L> {
    Leaf(L),
    List(Vec<Tree<L>>),
    Map(Vec<(String, Tree<L>)>),
}

impl<L> From<L> for Tree<L> {
    fn from(value: L) -> Self {
        Tree::Leaf(value)
    }
}

impl<L> Tree<L> {
    pub fn leaf(value: L) -> Self {
        Tree::Leaf(value)
    }

    /// Build a mapping node from key/value pairs, keeping their order.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Tree<L>)>) -> Self {
        Tree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list(items: impl IntoIterator<Item = Tree<L>>) -> Self {
        Tree::List(items.into_iter().collect())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Tree::Leaf(_))
    }

    /// Consume a tree which is a bare leaf and return its value.
    pub fn into_leaf(self) -> Option<L> {
        match self {
            Tree::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// The paths to every leaf, in depth-first order. A bare leaf has a single empty path.
    pub fn leaf_paths(&self) -> Vec<TreePath> {
        let mut paths = Vec::new();
        let mut prefix = Vec::new();
        self.collect_paths(&mut prefix, &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &mut TreePath, paths: &mut Vec<TreePath>) {
        match self {
            Tree::Leaf(_) => paths.push(prefix.clone()),
            Tree::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    prefix.push(PathSegment::Index(i));
                    item.collect_paths(prefix, paths);
                    prefix.pop();
                }
            }
            Tree::Map(entries) => {
                for (k, item) in entries {
                    prefix.push(PathSegment::Key(k.clone()));
                    item.collect_paths(prefix, paths);
                    prefix.pop();
                }
            }
        }
    }

    /// Get the subtree at `path`.
    pub fn get(&self, path: &[PathSegment]) -> Option<&Tree<L>> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self);
        };
        let child = match (self, head) {
            (Tree::List(items), PathSegment::Index(i)) => items.get(*i)?,
            (Tree::Map(entries), PathSegment::Key(k)) => {
                entries.iter().find(|(key, _)| key == k).map(|(_, v)| v)?
            }
            _ => return None,
        };
        child.get(rest)
    }

    /// Get the leaf value at `path`.
    pub fn get_leaf(&self, path: &[PathSegment]) -> Option<&L> {
        match self.get(path)? {
            Tree::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// References to every leaf value, in the same order as `leaf_paths`.
    pub fn leaves(&self) -> Vec<&L> {
        match self {
            Tree::Leaf(value) => vec![value],
            Tree::List(items) => items.iter().flat_map(|t| t.leaves()).collect(),
            Tree::Map(entries) => entries.iter().flat_map(|(_, t)| t.leaves()).collect(),
        }
    }

    /// Every leaf value, in the same order as `leaf_paths`.
    pub fn into_leaves(self) -> Vec<L> {
        match self {
            Tree::Leaf(value) => vec![value],
            Tree::List(items) => items.into_iter().flat_map(|t| t.into_leaves()).collect(),
            Tree::Map(entries) => entries
                .into_iter()
                .flat_map(|(_, t)| t.into_leaves())
                .collect(),
        }
    }

    /// Rebuild the tree with the same structure, transforming each leaf by value.
    pub fn try_map_leaves<M, E>(
        self,
        f: &mut impl FnMut(L) -> Result<M, E>,
    ) -> Result<Tree<M>, E> {
        Ok(match self {
            Tree::Leaf(value) => Tree::Leaf(f(value)?),
            Tree::List(items) => Tree::List(
                items
                    .into_iter()
                    .map(|t| t.try_map_leaves(f))
                    .collect::<Result<_, E>>()?,
            ),
            Tree::Map(entries) => Tree::Map(
                entries
                    .into_iter()
                    .map(|(k, t)| t.try_map_leaves(f).map(|v| (k, v)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    /// Rebuild the tree with the same structure from references to each leaf.
    pub fn try_map_ref<'a, M, E>(
        &'a self,
        f: &mut impl FnMut(&'a L) -> Result<M, E>,
    ) -> Result<Tree<M>, E> {
        Ok(match self {
            Tree::Leaf(value) => Tree::Leaf(f(value)?),
            Tree::List(items) => Tree::List(
                items
                    .iter()
                    .map(|t| t.try_map_ref(f))
                    .collect::<Result<_, E>>()?,
            ),
            Tree::Map(entries) => Tree::Map(
                entries
                    .iter()
                    .map(|(k, t)| t.try_map_ref(f).map(|v| (k.clone(), v)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    pub fn map_leaves<M>(self, mut f: impl FnMut(L) -> M) -> Tree<M> {
        let result: Result<Tree<M>, std::convert::Infallible> =
            self.try_map_leaves(&mut |v| Ok(f(v)));
        match result {
            Ok(tree) => tree,
            Err(never) => match never {},
        }
    }
}

/// The positional and keyword arguments of one call, each an arbitrary tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Args<T> {
    pub positional: Vec<Tree<T>>,
    pub keyword: Vec<(String, Tree<T>)>,
}

impl<T> Default for Args<T> {
    fn default() -> Self {
        Self {
            positional: Vec::new(),
            keyword: Vec::new(),
        }
    }
}

impl<T> Args<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Tree<T>>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Append a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Tree<T>>) -> Self {
        self.keyword.push((key.into(), value.into()));
        self
    }

    pub fn positional(&self, i: usize) -> Option<&Tree<T>> {
        self.positional.get(i)
    }

    pub fn keyword(&self, key: &str) -> Option<&Tree<T>> {
        self.keyword.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// References to every leaf of every argument, positional arguments first.
    pub fn leaves(&self) -> Vec<&T> {
        self.positional
            .iter()
            .chain(self.keyword.iter().map(|(_, v)| v))
            .flat_map(|t| t.leaves())
            .collect()
    }

    pub fn try_map_ref<'a, M, E>(
        &'a self,
        f: &mut impl FnMut(&'a T) -> Result<M, E>,
    ) -> Result<Args<M>, E> {
        Ok(Args {
            positional: self
                .positional
                .iter()
                .map(|t| t.try_map_ref(f))
                .collect::<Result<_, E>>()?,
            keyword: self
                .keyword
                .iter()
                .map(|(k, t)| t.try_map_ref(f).map(|v| (k.clone(), v)))
                .collect::<Result<_, E>>()?,
        })
    }
}
