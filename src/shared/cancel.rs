use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(self.own.clone()),
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.own.load(Ordering::SeqCst) {
            return true;
        }
        self.parent
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

pub fn sleep_with_cancel(token: &CancelToken, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if token.is_cancelled() {
            return false;
        }
        let step = remaining.min(Duration::from_millis(10));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !token.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_tokens_observe_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(parent.is_cancelled());
    }

    #[test]
    fn child_cancellation_does_not_propagate_upward() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn sleep_with_cancel_returns_false_once_tripped() {
        let token = CancelToken::new();
        token.cancel();
        assert!(!sleep_with_cancel(&token, Duration::from_millis(50)));
        let free = CancelToken::new();
        assert!(sleep_with_cancel(&free, Duration::from_millis(1)));
    }
}
