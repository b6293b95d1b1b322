//! # Object Register
//!
//! Per-class identity map: at most one live instance per `(class, key)`.
//! Every load path consults the register before the store and writes back
//! into it before returning.

use crate::entity::ObjectRef;
use std::collections::BTreeMap;

/// Map of one class: key to live instance.
pub type ClassRegister = BTreeMap<String, ObjectRef>;

#[derive(Debug, Default)]
pub struct ObjectRegister {
    classes: BTreeMap<String, ClassRegister>,
}

impl ObjectRegister {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The map of `class`, created on first use.
    pub fn get_register(&mut self, class: &str) -> &mut ClassRegister {
        self.classes.entry(class.to_string()).or_default()
    }

    #[must_use]
    pub fn get(&self, class: &str, key: &str) -> Option<&ObjectRef> {
        self.classes.get(class).and_then(|r| r.get(key))
    }

    #[must_use]
    pub fn contains(&self, class: &str, key: &str) -> bool {
        self.get(class, key).is_some()
    }

    /// Insert an instance under its own class and key.
    ///
    /// An entry that already holds the same instance is left as is.
    /// Returns the instance previously stored under that key, if different.
    pub fn insert(&mut self, object: ObjectRef) -> Option<ObjectRef> {
        let register = self.get_register(object.class_name());
        match register.get(object.key()) {
            Some(existing) if existing.ptr_eq(&object) => None,
            _ => register.insert(object.key().to_string(), object),
        }
    }

    pub fn evict(&mut self, class: &str, key: &str) -> Option<ObjectRef> {
        self.classes.get_mut(class).and_then(|r| r.remove(key))
    }

    pub fn clear(&mut self) {
        self.classes.clear();
    }

    /// Number of live instances across all classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class names with their maps, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassRegister)> {
        self.classes.iter().map(|(name, r)| (name.as_str(), r))
    }
}
