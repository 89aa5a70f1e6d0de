//! Execution policy: the host-configured bounds on execution.

/// Configuration for instantiation and execution.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Maximum call depth, counting wasm frames and host re-entries alike.
    /// Exceeding it traps as `call stack exhausted`.
    pub max_call_stack_depth: usize,
    /// Page cap across the instance's memories; 0 means unbounded.
    pub max_memory_pages: u32,
    /// Memoise the flat-body -> block-tree translation per function.
    pub translation_cache: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        ExecutionPolicy {
            max_call_stack_depth: 256,
            max_memory_pages: 0,
            translation_cache: false,
        }
    }
}

impl ExecutionPolicy {
    /// The configuration the conformance tests run under: a 0x1000-page
    /// memory cap.
    pub fn for_tests() -> Self {
        ExecutionPolicy {
            max_memory_pages: 0x1000,
            ..ExecutionPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.max_call_stack_depth, 256);
        assert_eq!(policy.max_memory_pages, 0);
        assert!(!policy.translation_cache);

        assert_eq!(ExecutionPolicy::for_tests().max_memory_pages, 0x1000);
    }
}
