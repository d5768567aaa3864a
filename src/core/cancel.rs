use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Node {
    cancelled: AtomicBool,
    parent: Option<Arc<Node>>,
}

/// Cooperative cancellation token. Tokens form a tree: cancelling a token
/// cancels everything derived from it, while a child cancelling itself never
/// affects its parent or siblings. Checks walk the parent chain, so they are
/// cheap enough for per-iteration polling in worker loops.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Derive a token that observes this token's cancellation in addition to
    /// its own.
    pub fn child(&self) -> Self {
        Self {
            node: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                parent: Some(self.node.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(&self.node);
        while let Some(node) = current {
            if node.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            current = node.parent.as_ref();
        }
        false
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
