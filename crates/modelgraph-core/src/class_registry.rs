//! # Class Registry
//!
//! Capability table from class name to constructor and reduced factory.
//!
//! Built from a `SpecRegistry`: every concrete class gets a
//! `DynamicObject`-backed entry. Typed implementations replace those
//! entries through `register`.

use crate::entity::{DynamicObject, Fields, ModelClass, ObjectRef};
use crate::spec::SpecRegistry;
use crate::ModelError;
use std::collections::BTreeMap;
use std::fmt;

type Constructor = Box<dyn Fn(&str, Fields) -> Result<ObjectRef, ModelError>>;
type ReducedFactory = Box<dyn Fn(&str) -> ObjectRef>;

struct ClassEntry {
    constructor: Constructor,
    reduced: ReducedFactory,
    typed: bool,
}

/// Constructors and reduced factories of the loaded model classes.
#[derive(Default)]
pub struct ClassRegistry {
    entries: BTreeMap<String, ClassEntry>,
}

impl ClassRegistry {
    /// One dynamic entry per concrete class of the specification set.
    #[must_use]
    pub fn from_specs(specs: &SpecRegistry) -> Self {
        let mut entries = BTreeMap::new();
        for spec in specs.classes().filter(|c| !c.is_abstract) {
            let for_constructor = spec.clone();
            let for_reduced = spec.clone();
            entries.insert(
                spec.name.clone(),
                ClassEntry {
                    constructor: Box::new(move |key: &str, fields: Fields| {
                        DynamicObject::new(for_constructor.clone(), key, fields).map(ObjectRef::new)
                    }),
                    reduced: Box::new(move |key: &str| {
                        ObjectRef::new(DynamicObject::reduced(for_reduced.clone(), key))
                    }),
                    typed: false,
                },
            );
        }
        Self { entries }
    }

    /// Register (or replace) the entry for a typed class.
    pub fn register<T: ModelClass>(&mut self) {
        self.entries.insert(
            T::CLASS_NAME.to_string(),
            ClassEntry {
                constructor: Box::new(|key: &str, fields: Fields| {
                    T::construct(key, fields).map(ObjectRef::new)
                }),
                reduced: Box::new(|key: &str| ObjectRef::new(T::reduced(key))),
                typed: true,
            },
        );
    }

    /// Builder form of `register`.
    #[must_use]
    pub fn with<T: ModelClass>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Whether `class` is a known concrete model class.
    #[must_use]
    pub fn is_model_class(&self, class: &str) -> bool {
        self.entries.contains_key(class)
    }

    /// Whether `class` has a typed implementation.
    #[must_use]
    pub fn is_typed(&self, class: &str) -> bool {
        self.entries.get(class).is_some_and(|e| e.typed)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Full construction through the class's constructor.
    pub fn construct(&self, class: &str, key: &str, fields: Fields) -> Result<ObjectRef, ModelError> {
        (self.entry(class)?.constructor)(key, fields)
    }

    /// Reduced stub through the class's reduced factory.
    pub fn create_reduced(&self, class: &str, key: &str) -> Result<ObjectRef, ModelError> {
        Ok((self.entry(class)?.reduced)(key))
    }

    fn entry(&self, class: &str) -> Result<&ClassEntry, ModelError> {
        self.entries
            .get(class)
            .ok_or_else(|| ModelError::UnknownClass(class.to_string()))
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, FieldValue};
    use crate::spec::{AttributeSpec, AttributeType, ClassSpec};
    use crate::Value;
    use std::any::Any;

    #[derive(Debug)]
    struct Unit {
        name: String,
        symbol: Option<String>,
        mini_mode: bool,
    }

    impl Entity for Unit {
        fn class_name(&self) -> &str {
            Self::CLASS_NAME
        }
        fn key(&self) -> &str {
            &self.name
        }
        fn mini_mode(&self) -> bool {
            self.mini_mode
        }
        fn upgrade(&mut self, fields: Fields) -> Result<bool, ModelError> {
            if !self.mini_mode {
                return Ok(false);
            }
            if let Some(FieldValue::Value(Value::Text(s))) = fields.get("symbol") {
                self.symbol = Some(s.clone());
            }
            self.mini_mode = false;
            Ok(true)
        }
        fn field(&self, name: &str) -> Option<FieldValue> {
            match name {
                "symbol" => self.symbol.clone().map(FieldValue::from),
                _ => None,
            }
        }
        fn fields(&self) -> Fields {
            self.field("symbol")
                .map(|v| ("symbol".to_string(), v))
                .into_iter()
                .collect()
        }
        fn assign(&mut self, name: &str, value: Option<FieldValue>) -> Result<(), ModelError> {
            match (name, value) {
                ("symbol", Some(FieldValue::Value(Value::Text(s)))) => self.symbol = Some(s),
                ("symbol", None) => self.symbol = None,
                (other, _) => {
                    return Err(ModelError::UnknownMember {
                        class: Self::CLASS_NAME.to_string(),
                        member: other.to_string(),
                    });
                }
            }
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl ModelClass for Unit {
        const CLASS_NAME: &'static str = "Unit";

        fn construct(key: &str, fields: Fields) -> Result<Self, ModelError> {
            let mut unit = Self::reduced(key);
            unit.upgrade(fields)?;
            Ok(unit)
        }

        fn reduced(key: &str) -> Self {
            Self {
                name: key.to_string(),
                symbol: None,
                mini_mode: true,
            }
        }
    }

    fn specs() -> SpecRegistry {
        SpecRegistry::from_classes([
            ClassSpec::new_abstract("Base"),
            ClassSpec::new("Unit")
                .extending("Base")
                .with_attribute("name", AttributeSpec::key())
                .with_attribute("symbol", AttributeSpec::optional(AttributeType::Text)),
        ])
        .expect("valid spec")
    }

    #[test]
    fn dynamic_entries_for_concrete_classes() {
        let registry = ClassRegistry::from_specs(&specs());
        assert!(registry.is_model_class("Unit"));
        assert!(!registry.is_model_class("Base"));
        assert!(!registry.is_typed("Unit"));

        let stub = registry.create_reduced("Unit", "kg").expect("stub");
        assert!(stub.mini_mode().expect("borrow"));
        let full = registry
            .construct("Unit", "kg", Fields::new())
            .expect("construct");
        assert!(!full.mini_mode().expect("borrow"));
        assert!(matches!(
            registry.create_reduced("Base", "x"),
            Err(ModelError::UnknownClass(_))
        ));
    }

    #[test]
    fn typed_registration_replaces_dynamic_entry() {
        let registry = ClassRegistry::from_specs(&specs()).with::<Unit>();
        assert!(registry.is_typed("Unit"));

        let mut fields = Fields::new();
        fields.insert("symbol".to_string(), FieldValue::from("kg"));
        let obj = registry.construct("Unit", "kilogram", fields).expect("construct");
        let symbol = obj
            .with::<Unit, _>(|u| u.symbol.clone())
            .expect("borrow")
            .flatten();
        assert_eq!(symbol.as_deref(), Some("kg"));
    }
}
