use std::fmt;

/// A namespace entry returned by node discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Incomplete prefix with descendants.
    Branch { path: String },
    /// Fully resolved path naming exactly one series.
    ///
    /// `origin` lists the declaration indices of the templates that produced the leaf;
    /// fetches re-derive the series from the path using only those templates. An empty
    /// `origin` lets every template compete.
    Leaf { path: String, origin: Vec<usize> },
}

impl Node {
    pub fn branch(path: impl Into<String>) -> Self {
        Node::Branch { path: path.into() }
    }

    /// A leaf built from a bare path, e.g. one remembered from an earlier call.
    pub fn leaf(path: impl Into<String>) -> Self {
        Node::Leaf {
            path: path.into(),
            origin: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::Branch { path } | Node::Leaf { path, .. } => path,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Node::Branch { .. })
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        let path = self.path();
        path.rsplit('.').next().unwrap_or(path)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Branch { path } => write!(f, "branch {}", path),
            Node::Leaf { path, .. } => write!(f, "leaf {}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let b = Node::branch("a.b");
        let l = Node::leaf("a.b.cpu");
        assert!(b.is_branch() && !b.is_leaf());
        assert!(l.is_leaf());
        assert_eq!(l.path(), "a.b.cpu");
        assert_eq!(l.name(), "cpu");
        assert_eq!(Node::branch("root").name(), "root");
        assert_eq!(b.to_string(), "branch a.b");
        assert_eq!(l.to_string(), "leaf a.b.cpu");
    }
}
