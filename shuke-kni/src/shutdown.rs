use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide stop signal for the bridge workers
///
/// Set once and never reset. Workers check it once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_shared() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_triggered());

        token.trigger();
        assert!(clone.is_triggered());

        token.trigger();
        assert!(token.is_triggered());
    }
}
