use std::time::Duration;

/// Settings a [`ThreadManager`](crate::vm::ThreadManager) is constructed with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Prefix of spawned threads' names: `"{prefix}@{info}"`
    pub thread_name_prefix: String,
    /// Name of the root thread
    pub root_thread_name: String,
    /// Native stack size for spawned threads; platform default when `None`
    pub stack_size: Option<usize>,
    /// How long teardown waits for killed threads before detaching them
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "Guest Thread".to_string(),
            root_thread_name: "main".to_string(),
            stack_size: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_root_thread_name(mut self, name: impl Into<String>) -> Self {
        self.root_thread_name = name.into();
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub(crate) fn thread_name(&self, info: &str) -> String {
        format!("{}@{}", self.thread_name_prefix, info)
    }
}
