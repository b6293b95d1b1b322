//! # Entity Runtime
//!
//! The contract every model class satisfies, and the handle through which
//! live instances are shared.
//!
//! An instance is either *reduced* (`mini_mode == true`, only the key is
//! known) or *full*. `upgrade` is the single transition from the first
//! state to the second and happens at most once.
//!
//! Instances live behind `ObjectRef`, a reference-counted cell. Two
//! `ObjectRef`s compare equal only when they point at the same instance.

use crate::spec::{ClassSpec, GENERIC_KEY};
use crate::{ModelError, Value};
use indexmap::IndexMap;
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

// =============================================================================
// FIELD VALUES
// =============================================================================

/// The value of one attribute or reference.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Attribute value.
    Value(Value),
    /// Mono-reference target.
    Mono(ObjectRef),
    /// Multi-reference targets, in order.
    Multi(Vec<ObjectRef>),
}

/// Member name to value, in argument order.
pub type Fields = IndexMap<String, FieldValue>;

impl FieldValue {
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_mono(&self) -> Option<&ObjectRef> {
        match self {
            Self::Mono(obj) => Some(obj),
            _ => None,
        }
    }

    /// Referenced objects, empty for attribute values.
    #[must_use]
    pub fn targets(&self) -> Vec<&ObjectRef> {
        match self {
            Self::Value(_) => Vec::new(),
            Self::Mono(obj) => vec![obj],
            Self::Multi(objs) => objs.iter().collect(),
        }
    }

    /// Description used in type mismatch messages.
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::Value(v) => v.type_name().to_string(),
            Self::Mono(obj) => obj.class_name().to_string(),
            Self::Multi(_) => "list".to_string(),
        }
    }

    /// Compare by content: attribute values by equality, references by `(class, key)`.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::Mono(a), Self::Mono(b)) => a.same_identity(b),
            (Self::Multi(a), Self::Multi(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_identity(y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Mono(obj) => write!(f, "{obj}"),
            Self::Multi(objs) => {
                write!(f, "[")?;
                for (i, obj) in objs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{obj}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Value(Value::from(s))
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Value(Value::from(s))
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Value(Value::from(i))
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        Self::Value(Value::from(x))
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Value(Value::from(b))
    }
}

impl From<chrono::NaiveDateTime> for FieldValue {
    fn from(dt: chrono::NaiveDateTime) -> Self {
        Self::Value(Value::from(dt))
    }
}

impl From<ObjectRef> for FieldValue {
    fn from(obj: ObjectRef) -> Self {
        Self::Mono(obj)
    }
}

impl From<Vec<ObjectRef>> for FieldValue {
    fn from(objs: Vec<ObjectRef>) -> Self {
        Self::Multi(objs)
    }
}

// =============================================================================
// ENTITY CONTRACT
// =============================================================================

/// Behaviour shared by every concrete model class.
pub trait Entity: fmt::Debug {
    fn class_name(&self) -> &str;

    /// Immutable identity within the class.
    fn key(&self) -> &str;

    /// `true` while only the key is known.
    fn mini_mode(&self) -> bool;

    /// Complete a reduced instance.
    ///
    /// Returns `Ok(false)` without touching anything if the instance is
    /// already full. Otherwise checks that every required member is
    /// supplied, assigns attributes and mono-references, appends to
    /// multi-references, leaves reduced mode and returns `Ok(true)`.
    fn upgrade(&mut self, fields: Fields) -> Result<bool, ModelError>;

    /// Current value of a non-key member.
    fn field(&self, name: &str) -> Option<FieldValue>;

    /// All populated non-key members.
    fn fields(&self) -> Fields;

    /// Replace (or with `None`, clear) one non-key member.
    fn assign(&mut self, name: &str, value: Option<FieldValue>) -> Result<(), ModelError>;

    fn as_any(&self) -> &dyn Any;
}

/// A statically typed model class that can be registered with a
/// [`ClassRegistry`](crate::ClassRegistry).
pub trait ModelClass: Entity + Sized + 'static {
    const CLASS_NAME: &'static str;

    /// Full constructor. Fails naming the first missing required member.
    fn construct(key: &str, fields: Fields) -> Result<Self, ModelError>;

    /// Reduced factory: only the key, no validation.
    fn reduced(key: &str) -> Self;
}

// =============================================================================
// OBJECT HANDLE
// =============================================================================

/// Shared handle to one live instance.
#[derive(Clone)]
pub struct ObjectRef {
    class_name: Rc<str>,
    key: Rc<str>,
    cell: Rc<RefCell<dyn Entity>>,
}

impl ObjectRef {
    pub fn new<E: Entity + 'static>(entity: E) -> Self {
        let class_name: Rc<str> = Rc::from(entity.class_name());
        let key: Rc<str> = Rc::from(entity.key());
        let cell: Rc<RefCell<dyn Entity>> = Rc::new(RefCell::new(entity));
        Self {
            class_name,
            key,
            cell,
        }
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn borrow(&self) -> Result<Ref<'_, dyn Entity + 'static>, ModelError> {
        self.cell.try_borrow().map_err(|_| self.busy())
    }

    pub fn borrow_mut(&self) -> Result<RefMut<'_, dyn Entity + 'static>, ModelError> {
        self.cell.try_borrow_mut().map_err(|_| self.busy())
    }

    pub fn mini_mode(&self) -> Result<bool, ModelError> {
        Ok(self.borrow()?.mini_mode())
    }

    pub fn field(&self, name: &str) -> Result<Option<FieldValue>, ModelError> {
        Ok(self.borrow()?.field(name))
    }

    pub fn fields(&self) -> Result<Fields, ModelError> {
        Ok(self.borrow()?.fields())
    }

    pub fn upgrade(&self, fields: Fields) -> Result<bool, ModelError> {
        self.borrow_mut()?.upgrade(fields)
    }

    pub fn assign(&self, name: &str, value: Option<FieldValue>) -> Result<(), ModelError> {
        self.borrow_mut()?.assign(name, value)
    }

    /// Run `f` on the instance if it is of type `E`.
    pub fn with<E: Entity + 'static, R>(&self, f: impl FnOnce(&E) -> R) -> Result<Option<R>, ModelError> {
        let entity = self.borrow()?;
        Ok(entity.as_any().downcast_ref::<E>().map(f))
    }

    /// Whether both handles point at the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// Whether both handles address the same `(class, key)`.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.class_name == other.class_name && self.key == other.key
    }

    fn busy(&self) -> ModelError {
        ModelError::Borrow(format!("{} {}", self.class_name, self.key))
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class_name, self.key)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.class_name, self.key)
    }
}

// =============================================================================
// DYNAMIC OBJECT
// =============================================================================

/// Generic instance of a class, driven entirely by its `ClassSpec`.
///
/// Used for every class that has no typed implementation registered.
#[derive(Debug, Clone)]
pub struct DynamicObject {
    spec: Arc<ClassSpec>,
    key: String,
    mini_mode: bool,
    fields: Fields,
}

impl DynamicObject {
    /// Full construction.
    pub fn new(spec: Arc<ClassSpec>, key: impl Into<String>, fields: Fields) -> Result<Self, ModelError> {
        if spec.is_abstract {
            return Err(ModelError::AbstractClass(spec.name.clone()));
        }
        let mut object = Self::reduced(spec, key);
        object.upgrade(fields)?;
        Ok(object)
    }

    /// Reduced construction: only the key.
    #[must_use]
    pub fn reduced(spec: Arc<ClassSpec>, key: impl Into<String>) -> Self {
        Self {
            spec,
            key: key.into(),
            mini_mode: true,
            fields: Fields::new(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &ClassSpec {
        &self.spec
    }

    /// Check one incoming member against the declaration. Returns `false`
    /// for a key entry carrying the current key.
    fn check_member(&self, name: &str, value: &FieldValue) -> Result<bool, ModelError> {
        if self.spec.is_key_name(name) {
            return match value {
                FieldValue::Value(Value::Text(k)) if *k == self.key => Ok(false),
                _ => Err(ModelError::KeyMutation(self.spec.name.clone())),
            };
        }
        let mismatch = |expected: String| ModelError::TypeMismatch {
            class: self.spec.name.clone(),
            field: name.to_string(),
            expected,
            found: value.type_name(),
        };
        if let Some(attr) = self.spec.attributes.get(name) {
            return match value {
                FieldValue::Value(v) if attr.attr_type.accepts(v) => Ok(true),
                _ => Err(mismatch(attr.attr_type.name().to_string())),
            };
        }
        if let Some(reference) = self.spec.references.get(name) {
            return match (reference.is_multi(), value) {
                (false, FieldValue::Mono(_)) | (true, FieldValue::Multi(_)) => Ok(true),
                (true, _) => Err(mismatch(format!("list of {}", reference.target))),
                (false, _) => Err(mismatch(reference.target.clone())),
            };
        }
        Err(ModelError::UnknownMember {
            class: self.spec.name.clone(),
            member: name.to_string(),
        })
    }
}

impl Entity for DynamicObject {
    fn class_name(&self) -> &str {
        &self.spec.name
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn mini_mode(&self) -> bool {
        self.mini_mode
    }

    fn upgrade(&mut self, fields: Fields) -> Result<bool, ModelError> {
        if !self.mini_mode {
            return Ok(false);
        }

        // Validate everything before touching any field.
        let mut accepted = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            if self.check_member(&name, &value)? {
                accepted.push((name, value));
            }
        }
        let supplied = |member: &str| {
            self.fields.contains_key(member) || accepted.iter().any(|(n, _)| n == member)
        };
        let missing = self
            .spec
            .non_key_attributes()
            .filter(|(_, attr)| attr.required)
            .map(|(name, _)| name)
            .chain(
                self.spec
                    .references
                    .iter()
                    .filter(|(_, r)| r.required)
                    .map(|(name, _)| name.as_str()),
            )
            .find(|name| !supplied(*name));
        if let Some(field) = missing {
            return Err(ModelError::MissingField {
                class: self.spec.name.clone(),
                field: field.to_string(),
            });
        }

        for (name, value) in accepted {
            match (self.fields.get_mut(&name), value) {
                (Some(FieldValue::Multi(existing)), FieldValue::Multi(more)) => existing.extend(more),
                (_, value) => {
                    self.fields.insert(name, value);
                }
            }
        }
        self.mini_mode = false;
        Ok(true)
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        if name == GENERIC_KEY || self.spec.key_attribute() == Some(name) {
            return Some(FieldValue::Value(Value::text(self.key.clone())));
        }
        self.fields.get(name).cloned()
    }

    fn fields(&self) -> Fields {
        self.fields.clone()
    }

    fn assign(&mut self, name: &str, value: Option<FieldValue>) -> Result<(), ModelError> {
        match value {
            Some(value) => {
                if self.check_member(name, &value)? {
                    self.fields.insert(name.to_string(), value);
                }
            }
            None => {
                if self.spec.is_key_name(name) {
                    return Err(ModelError::KeyMutation(self.spec.name.clone()));
                }
                self.fields.shift_remove(name);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================
