//! Per-batch resource hygiene

use tracing::trace;

/// Hook run by the driver after every batch
pub trait ResourceHygiene: Send + Sync {
    fn after_batch(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHygiene;

impl ResourceHygiene for NoopHygiene {
    fn after_batch(&self) {}
}

/// Hand freed heap pages back to the OS. Only does something on glibc.
#[derive(Debug, Clone, Copy, Default)]
pub struct MallocTrim;

impl ResourceHygiene for MallocTrim {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn after_batch(&self) {
        // SAFETY: malloc_trim only inspects allocator state and has no preconditions
        let released = unsafe { libc::malloc_trim(0) };
        trace!(released = released != 0, "malloc_trim");
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn after_batch(&self) {
        trace!("malloc_trim unavailable on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_are_callable_repeatedly() {
        let hooks: Vec<Box<dyn ResourceHygiene>> = vec![Box::new(NoopHygiene), Box::new(MallocTrim)];
        for hook in &hooks {
            hook.after_batch();
            hook.after_batch();
        }
    }
}
