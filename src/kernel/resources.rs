//! Process-wide named resources.
//!
//! Registered as values or factories before start; factories run once while
//! the runtime starts, and every worker sees the same materialized values.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::{Error, Result};

pub type SharedResource = Arc<dyn Any + Send + Sync>;

type Factory = Box<dyn FnOnce() -> Result<SharedResource> + Send>;

/// Resource registration.
pub enum Resource {
    Value(SharedResource),
    Factory(Factory),
}

impl Resource {
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Resource::Value(Arc::new(value))
    }

    pub fn factory<T, F>(f: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Resource::Factory(Box::new(move || f().map(|v| Arc::new(v) as SharedResource)))
    }

    fn materialize(self) -> Result<SharedResource> {
        match self {
            Resource::Value(v) => Ok(v),
            Resource::Factory(f) => f(),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Value(_) => f.write_str("Resource::Value(..)"),
            Resource::Factory(_) => f.write_str("Resource::Factory(..)"),
        }
    }
}

/// Materialized resource table.
#[derive(Default)]
pub struct Resources {
    values: HashMap<String, SharedResource>,
}

impl Resources {
    /// Run factories and collect values. Duplicate names are rejected.
    pub fn materialize(entries: Vec<(String, Resource)>) -> Result<Self> {
        let mut values = HashMap::with_capacity(entries.len());
        for (name, resource) in entries {
            if values.contains_key(&name) {
                return Err(Error::config(format!("resource '{}' defined twice", name)));
            }
            let value = resource.materialize()?;
            tracing::debug!("resource_ready: name={}", name);
            values.insert(name, value);
        }
        Ok(Self { values })
    }

    /// Typed lookup; `None` when missing or of another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[test]
    fn test_values_and_factories() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let resources = Resources::materialize(vec![
            ("answer".to_string(), Resource::value(42u32)),
            (
                "greeting".to_string(),
                Resource::factory(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(String::from("hi"))
                }),
            ),
        ])
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*resources.get::<u32>("answer").unwrap(), 42);
        assert_eq!(resources.get::<String>("greeting").unwrap().as_str(), "hi");
        assert!(resources.get::<String>("answer").is_none());
        assert!(resources.get::<u32>("missing").is_none());
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn test_factory_failure_and_duplicates() {
        let failing = Resources::materialize(vec![(
            "db".to_string(),
            Resource::factory(|| Err::<u8, _>(Error::handler("no db"))),
        )]);
        assert!(matches!(failing, Err(Error::Handler(_))));

        let dup = Resources::materialize(vec![
            ("a".to_string(), Resource::value(1u8)),
            ("a".to_string(), Resource::value(2u8)),
        ]);
        assert!(matches!(dup, Err(Error::Config(_))));
    }

    #[test]
    #[traced_test]
    fn test_materialize_logs_each_resource() {
        Resources::materialize(vec![("db".to_string(), Resource::value(1u8))]).unwrap();
        assert!(logs_contain("resource_ready: name=db"));
    }
}
