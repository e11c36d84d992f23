pub(crate) mod env {
    use parking_lot::{const_mutex, Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = const_mutex(());

    /// Holds the process-wide env lock and puts every touched key back on drop.
    pub(crate) struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        restore: Vec<(String, Option<String>)>,
    }

    pub(crate) fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock(),
            restore: Vec::new(),
        }
    }

    impl EnvGuard {
        fn snapshot(&mut self, key: &str) {
            if !self.restore.iter().any(|(seen, _)| seen == key) {
                self.restore.push((key.to_string(), std::env::var(key).ok()));
            }
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.snapshot(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.snapshot(key);
            std::env::remove_var(key);
        }

        pub(crate) fn clear_keys(&mut self, keys: &[&str]) {
            keys.iter().for_each(|key| self.remove(key));
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            while let Some((key, original)) = self.restore.pop() {
                match original {
                    Some(value) => std::env::set_var(&key, value),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

pub(crate) mod directory {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::identity::{DirectoryError, InstanceQuery, WorkloadDirectory, WorkloadRecord};

    /// In-memory directory that records how often it was queried.
    #[derive(Default)]
    pub(crate) struct StaticDirectory {
        pub records: Vec<WorkloadRecord>,
        pub fail: bool,
        calls: AtomicUsize,
    }

    impl StaticDirectory {
        pub(crate) fn with_owners(owners: &[Option<&str>]) -> Self {
            Self {
                records: owners
                    .iter()
                    .enumerate()
                    .map(|(i, owner)| WorkloadRecord {
                        name: format!("ws-pod-{i}"),
                        owner: owner.map(str::to_string),
                    })
                    .collect(),
                ..Self::default()
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkloadDirectory for StaticDirectory {
        async fn running_instances(
            &self,
            _query: &InstanceQuery,
        ) -> Result<Vec<WorkloadRecord>, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DirectoryError::Unavailable("static failure".into()));
            }
            Ok(self.records.clone())
        }
    }
}
