//! State limits and lifecycle options.

/// Configuration for a [`State`](crate::State).
///
/// # Example
///
/// ```
/// use hostbind_core::StateConfig;
///
/// let config = StateConfig::default().with_max_call_depth(64);
/// assert_eq!(config.max_call_depth, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConfig {
    /// Upper bound on stack slots across all frames.
    pub max_stack_slots: usize,
    /// Upper bound on nested native calls.
    pub max_call_depth: usize,
    /// Run `__gc` for every live userdata when the state is dropped.
    pub finalize_on_drop: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_stack_slots: 1_000_000,
            max_call_depth: 200,
            finalize_on_drop: true,
        }
    }
}

impl StateConfig {
    pub fn with_max_stack_slots(mut self, slots: usize) -> Self {
        self.max_stack_slots = slots;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_finalize_on_drop(mut self, enabled: bool) -> Self {
        self.finalize_on_drop = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StateConfig::default();
        assert_eq!(config.max_call_depth, 200);
        assert!(config.finalize_on_drop);
    }

    #[test]
    fn builder_setters() {
        let config = StateConfig::default()
            .with_max_stack_slots(10)
            .with_finalize_on_drop(false);
        assert_eq!(config.max_stack_slots, 10);
        assert!(!config.finalize_on_drop);
    }
}
