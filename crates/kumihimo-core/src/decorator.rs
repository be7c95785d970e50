//! Named, typed extension values attached to workflow contexts.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-safe decorator name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoratorKey(String);

impl DecoratorKey {
    /// Creates a new DecoratorKey.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DecoratorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DecoratorKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DecoratorKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for DecoratorKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The decorators owned by a single context.
///
/// Values of any `Send + Sync` type are stored behind an `Arc` and
/// retrieved by downcasting. Lookups through ancestors are done by the
/// workflow graph; this set only knows about its own keys.
#[derive(Default, Clone)]
pub struct Decorators {
    data: HashMap<DecoratorKey, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Decorators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorators")
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Decorators {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, refusing keys that are already present.
    ///
    /// Returns `false` and leaves the set untouched on a duplicate key.
    pub fn try_insert<T: Any + Send + Sync>(&mut self, key: DecoratorKey, value: T) -> bool {
        if self.data.contains_key(&key) {
            return false;
        }
        self.data.insert(key, Arc::new(value));
        true
    }

    /// Returns the value for `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.data
            .get(key)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    /// Returns `true` if this set owns `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns an iterator over the locally owned keys.
    pub fn keys(&self) -> impl Iterator<Item = &DecoratorKey> {
        self.data.keys()
    }

    /// Returns the number of locally owned decorators.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if no decorator is owned locally.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heterogeneous_values() {
        let mut set = Decorators::new();
        assert!(set.try_insert("retries".into(), 3u32));
        assert!(set.try_insert("region".into(), "eu-west-1".to_string()));

        assert_eq!(set.get::<u32>("retries").as_deref(), Some(&3));
        assert_eq!(
            set.get::<String>("region").as_deref().map(String::as_str),
            Some("eu-west-1")
        );

        // Wrong type returns None
        assert!(set.get::<String>("retries").is_none());
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut set = Decorators::new();
        assert!(set.try_insert("mailer".into(), 1u8));
        assert!(!set.try_insert("mailer".into(), 2u8));
        assert_eq!(set.get::<u8>("mailer").as_deref(), Some(&1));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_decorator_key() {
        let key1 = DecoratorKey::new("db");
        let key2: DecoratorKey = "db".into();
        assert_eq!(key1, key2);
        assert_eq!(key1.to_string(), "db");
    }
}
