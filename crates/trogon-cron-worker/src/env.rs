use std::env::VarError;

/// Source of environment variables. Config parsing takes this instead of
/// touching `std::env` so tests can supply their own values.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, VarError>;
}

/// Reads the real process environment.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, VarError> {
        std::env::var(key)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use in_memory::InMemoryEnv;

#[cfg(any(test, feature = "test-support"))]
mod in_memory {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::env::VarError;

    use super::ReadEnv;

    #[derive(Default)]
    pub struct InMemoryEnv {
        vars: RefCell<HashMap<String, String>>,
    }

    impl InMemoryEnv {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, key: &str, value: &str) {
            self.vars
                .borrow_mut()
                .insert(key.to_string(), value.to_string());
        }
    }

    impl ReadEnv for InMemoryEnv {
        fn var(&self, key: &str) -> Result<String, VarError> {
            self.vars
                .borrow()
                .get(key)
                .cloned()
                .ok_or(VarError::NotPresent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_env_returns_set_values() {
        let env = InMemoryEnv::new();
        env.set("CRON_WORKER_BUCKET", "jobs");
        assert_eq!(env.var("CRON_WORKER_BUCKET").unwrap(), "jobs");
        assert!(env.var("MISSING").is_err());
    }

    #[test]
    fn system_env_matches_std() {
        assert_eq!(SystemEnv.var("PATH").is_ok(), std::env::var("PATH").is_ok());
    }
}
