//! The execution stack: which node is currently running plugin code.

use std::path::{Path, PathBuf};

use crate::error::{RuntimeError, RuntimeResult};
use crate::node::NodeKey;

/// One active plugin execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Node being executed.
    pub node: NodeKey,
    /// File being executed.
    pub file: PathBuf,
}

/// Stack of active executions. Nested `use_plugin` calls push frames.
#[derive(Debug, Default)]
pub struct ExecutionStack {
    frames: Vec<Frame>,
}

impl ExecutionStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node` as executing `file`.
    pub fn begin(&mut self, node: NodeKey, file: &Path) {
        self.frames.push(Frame {
            node,
            file: file.to_path_buf(),
        });
    }

    /// End the execution of `node`.
    ///
    /// Frames above `node` that were never ended are discarded with it.
    /// Returns `false` if `node` was not on the stack.
    pub fn end(&mut self, node: NodeKey) -> bool {
        match self.frames.iter().rposition(|f| f.node == node) {
            Some(pos) => {
                self.frames.truncate(pos);
                true
            },
            None => false,
        }
    }

    /// The node a declaration made by `function` belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] when nothing is executing.
    pub fn current(&self, function: &'static str) -> RuntimeResult<NodeKey> {
        self.frames
            .last()
            .map(|f| f.node)
            .ok_or(RuntimeError::NoActiveNode { function })
    }

    /// The innermost frame.
    #[must_use]
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Number of active frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is executing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stack_rejects_declarations() {
        let stack = ExecutionStack::new();
        assert!(matches!(
            stack.current("declare_context"),
            Err(RuntimeError::NoActiveNode { function: "declare_context" })
        ));
    }

    #[test]
    fn test_nested_frames() {
        let mut stack = ExecutionStack::new();
        let a = NodeKey::new(1);
        let b = NodeKey::new(2);
        stack.begin(a, Path::new("/p/a"));
        stack.begin(b, Path::new("/p/a/b"));
        assert_eq!(stack.current("x").unwrap(), b);
        assert_eq!(stack.top().unwrap().file, PathBuf::from("/p/a/b"));

        assert!(stack.end(b));
        assert_eq!(stack.current("x").unwrap(), a);
        assert!(stack.end(a));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_end_discards_abandoned_frames() {
        let mut stack = ExecutionStack::new();
        stack.begin(NodeKey::new(1), Path::new("/p/a"));
        stack.begin(NodeKey::new(2), Path::new("/p/b"));
        assert!(stack.end(NodeKey::new(1)));
        assert_eq!(stack.depth(), 0);
        assert!(!stack.end(NodeKey::new(3)));
    }
}
