//! # Specification Registry
//!
//! The class model every other component consults: per-class key
//! attribute, typed attributes, references with multiplicity and optional
//! inverse, and the argument validation rules derived from them.
//!
//! A `SpecRegistry` is built all-or-nothing. Inheritance (`extends`) is
//! flattened at load time, so every lookup sees the effective members of a
//! class, parent members first.

mod xml;

use crate::entity::{FieldValue, Fields};
use crate::{ModelError, Value};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The generic key name every class accepts in place of its individual key attribute.
pub const GENERIC_KEY: &str = "key";

// =============================================================================
// MEMBER SPECIFICATIONS
// =============================================================================

/// Semantic type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Text,
    Int,
    Float,
    Boolean,
    DateTime,
    GeoPosition,
}

impl AttributeType {
    /// Parse a type name as used in specification sources.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "text" | "str" | "string" => Some(Self::Text),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "boolean" | "bool" => Some(Self::Boolean),
            "datetime" => Some(Self::DateTime),
            "pos_geo" => Some(Self::GeoPosition),
            _ => None,
        }
    }

    /// Canonical type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::GeoPosition => "pos_geo",
        }
    }

    /// Check whether a value is an instance of this type. No coercion.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Text, Value::Text(_))
                | (Self::Int, Value::Int(_))
                | (Self::Float, Value::Float(_))
                | (Self::Boolean, Value::Boolean(_))
                | (Self::DateTime, Value::DateTime(_))
                | (Self::GeoPosition, Value::Geo(_, _))
        )
    }
}

/// Reference multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Multiplicity {
    Mono,
    Multi,
}

impl Multiplicity {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mono" => Some(Self::Mono),
            "multi" => Some(Self::Multi),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mono => "mono",
            Self::Multi => "multi",
        }
    }
}

/// Declaration of one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub attr_type: AttributeType,
    pub required: bool,
    pub is_key: bool,
    pub indexed: bool,
}

impl AttributeSpec {
    /// An optional, non-indexed attribute.
    #[must_use]
    pub const fn optional(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            required: false,
            is_key: false,
            indexed: false,
        }
    }

    /// A required, non-indexed attribute.
    #[must_use]
    pub const fn required(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            required: true,
            is_key: false,
            indexed: false,
        }
    }

    /// The key attribute: text, required.
    #[must_use]
    pub const fn key() -> Self {
        Self {
            attr_type: AttributeType::Text,
            required: true,
            is_key: true,
            indexed: false,
        }
    }
}

/// Declaration of one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    /// Name of the target class.
    pub target: String,
    pub multiplicity: Multiplicity,
    pub required: bool,
    /// Name of the reference on the target class that mirrors this one.
    pub inverse: Option<String>,
}

impl ReferenceSpec {
    #[must_use]
    pub fn mono(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            multiplicity: Multiplicity::Mono,
            required: false,
            inverse: None,
        }
    }

    #[must_use]
    pub fn multi(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            multiplicity: Multiplicity::Multi,
            required: false,
            inverse: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    #[must_use]
    pub fn is_multi(&self) -> bool {
        self.multiplicity == Multiplicity::Multi
    }
}

/// Relationship type stored in the graph for a reference name.
#[must_use]
pub fn relationship_type(reference: &str) -> String {
    reference.to_uppercase()
}

// =============================================================================
// CLASS SPECIFICATION
// =============================================================================

/// Declaration of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSpec {
    pub name: String,
    pub is_abstract: bool,
    pub extends: Option<String>,
    pub attributes: IndexMap<String, AttributeSpec>,
    pub references: IndexMap<String, ReferenceSpec>,
}

impl ClassSpec {
    /// A concrete class without members.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_abstract: false,
            extends: None,
            attributes: IndexMap::new(),
            references: IndexMap::new(),
        }
    }

    /// An abstract class without members.
    #[must_use]
    pub fn new_abstract(name: impl Into<String>) -> Self {
        Self {
            is_abstract: true,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn extending(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, spec: AttributeSpec) -> Self {
        self.attributes.insert(name.into(), spec);
        self
    }

    #[must_use]
    pub fn with_reference(mut self, name: impl Into<String>, spec: ReferenceSpec) -> Self {
        self.references.insert(name.into(), spec);
        self
    }

    /// Name of the key attribute. `None` for abstract classes.
    #[must_use]
    pub fn key_attribute(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(_, spec)| spec.is_key)
            .map(|(name, _)| name.as_str())
    }

    /// Map the generic key name to the individual key attribute name.
    #[must_use]
    pub fn member_name<'a>(&'a self, name: &'a str) -> &'a str {
        if name == GENERIC_KEY {
            self.key_attribute().unwrap_or(name)
        } else {
            name
        }
    }

    /// Whether `name` (generic or individual) addresses the key attribute.
    #[must_use]
    pub fn is_key_name(&self, name: &str) -> bool {
        name == GENERIC_KEY || self.key_attribute() == Some(name)
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.get(self.member_name(name))
    }

    #[must_use]
    pub fn reference(&self, name: &str) -> Option<&ReferenceSpec> {
        self.references.get(name)
    }

    /// Find the reference stored under a relationship type (`CONDUITS_IN` → `conduits_in`).
    #[must_use]
    pub fn reference_for_relationship(&self, rel_type: &str) -> Option<(&str, &ReferenceSpec)> {
        self.references
            .iter()
            .find(|(name, _)| relationship_type(name) == rel_type)
            .map(|(name, spec)| (name.as_str(), spec))
    }

    /// Attribute names other than the key.
    pub fn non_key_attributes(&self) -> impl Iterator<Item = (&str, &AttributeSpec)> {
        self.attributes
            .iter()
            .filter(|(_, spec)| !spec.is_key)
            .map(|(name, spec)| (name.as_str(), spec))
    }
}

/// An indexed attribute collected from the specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub class: String,
    pub attribute: String,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The loaded, validated set of class specifications.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    classes: IndexMap<String, Arc<ClassSpec>>,
    indexes: Vec<IndexSpec>,
    source: Option<PathBuf>,
}

impl SpecRegistry {
    /// Build a registry from class declarations.
    ///
    /// Flattens inheritance and validates every structural rule. Nothing
    /// is returned unless the whole set is valid.
    pub fn from_classes(classes: impl IntoIterator<Item = ClassSpec>) -> Result<Self, ModelError> {
        let mut declared: IndexMap<String, ClassSpec> = IndexMap::new();
        for class in classes {
            if declared.contains_key(&class.name) {
                return Err(ModelError::Specification(format!(
                    "Class {} declared twice",
                    class.name
                )));
            }
            declared.insert(class.name.clone(), class);
        }

        let mut indexes = Vec::new();
        for class in declared.values() {
            for (name, attr) in &class.attributes {
                if attr.indexed {
                    indexes.push(IndexSpec {
                        class: class.name.clone(),
                        attribute: name.clone(),
                    });
                }
            }
        }

        let mut classes = IndexMap::new();
        for name in declared.keys() {
            let flattened = flatten(&declared, name)?;
            classes.insert(name.clone(), Arc::new(flattened));
        }

        let registry = Self {
            classes,
            indexes,
            source: None,
        };
        registry.semantic_validate()?;
        Ok(registry)
    }

    /// Parse and validate an XML specification document.
    pub fn from_xml_str(content: &str) -> Result<Self, ModelError> {
        Self::from_classes(xml::parse_classes(content)?)
    }

    /// Read, parse and validate an XML specification file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModelError::Io(format!("Cannot read specification {}: {}", path.display(), e))
        })?;
        let mut registry = Self::from_xml_str(&content)?;
        registry.source = Some(path.to_path_buf());
        Ok(registry)
    }

    /// Replace the active set with a new XML document.
    ///
    /// On failure the previous set stays active and the error is returned.
    pub fn reload_from_str(&mut self, content: &str) -> Result<(), ModelError> {
        let next = Self::from_xml_str(content).inspect_err(|e| {
            tracing::warn!("Specification reload rejected, keeping previous set: {}", e);
        })?;
        *self = next;
        Ok(())
    }

    /// Replace the active set with the content of a file.
    pub fn reload_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let next = Self::from_file(path).inspect_err(|e| {
            tracing::warn!("Specification reload rejected, keeping previous set: {}", e);
        })?;
        *self = next;
        Ok(())
    }

    /// The file this set was loaded from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassSpec>> {
        self.classes.values()
    }

    #[must_use]
    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Whether the class exists and is not abstract.
    #[must_use]
    pub fn is_concrete(&self, class: &str) -> bool {
        self.classes.get(class).is_some_and(|c| !c.is_abstract)
    }

    pub fn class(&self, class: &str) -> Result<&Arc<ClassSpec>, ModelError> {
        self.classes
            .get(class)
            .ok_or_else(|| ModelError::UnknownClass(class.to_string()))
    }

    /// Like `class`, but rejects abstract classes.
    pub fn concrete_class(&self, class: &str) -> Result<&Arc<ClassSpec>, ModelError> {
        let spec = self.class(class)?;
        if spec.is_abstract {
            return Err(ModelError::AbstractClass(class.to_string()));
        }
        Ok(spec)
    }

    pub fn get_key_attribute(&self, class: &str) -> Result<&str, ModelError> {
        self.concrete_class(class)?
            .key_attribute()
            .ok_or_else(|| ModelError::AbstractClass(class.to_string()))
    }

    /// Attribute names of a class, optionally with the key reported as `key`.
    pub fn get_attributes(
        &self,
        class: &str,
        use_generic_key: bool,
    ) -> Result<Vec<String>, ModelError> {
        let spec = self.class(class)?;
        Ok(spec
            .attributes
            .iter()
            .map(|(name, attr)| {
                if use_generic_key && attr.is_key {
                    GENERIC_KEY.to_string()
                } else {
                    name.clone()
                }
            })
            .collect())
    }

    pub fn get_references(
        &self,
        class: &str,
    ) -> Result<&IndexMap<String, ReferenceSpec>, ModelError> {
        Ok(&self.class(class)?.references)
    }

    /// Look up a reference. The name is matched case-insensitively.
    pub fn get_reference(&self, class: &str, reference: &str) -> Result<&ReferenceSpec, ModelError> {
        let spec = self.class(class)?;
        spec.reference(reference)
            .or_else(|| spec.reference(&reference.to_lowercase()))
            .ok_or_else(|| ModelError::UnknownMember {
                class: class.to_string(),
                member: reference.to_string(),
            })
    }

    pub fn get_reference_type(&self, class: &str, reference: &str) -> Result<&str, ModelError> {
        Ok(self.get_reference(class, reference)?.target.as_str())
    }

    pub fn has_any_reference(&self, class: &str) -> Result<bool, ModelError> {
        Ok(!self.class(class)?.references.is_empty())
    }

    pub fn is_multi_reference(&self, class: &str, reference: &str) -> Result<bool, ModelError> {
        Ok(self.get_reference(class, reference)?.is_multi())
    }

    pub fn is_attribute_required(&self, class: &str, attribute: &str) -> Result<bool, ModelError> {
        let spec = self.class(class)?;
        spec.attribute(attribute)
            .map(|a| a.required)
            .ok_or_else(|| ModelError::UnknownMember {
                class: class.to_string(),
                member: attribute.to_string(),
            })
    }

    pub fn is_reference_required(&self, class: &str, reference: &str) -> Result<bool, ModelError> {
        Ok(self.get_reference(class, reference)?.required)
    }

    /// Whether `class` is `ancestor` or extends it, directly or transitively.
    #[must_use]
    pub fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        let mut current = Some(class);
        let mut seen = BTreeSet::new();
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            if !seen.insert(name) {
                return false;
            }
            current = self.classes.get(name).and_then(|c| c.extends.as_deref());
        }
        false
    }

    /// Validate constructor or update arguments.
    ///
    /// `strict` requires every required attribute and reference to be
    /// present. Both modes type-check whatever is present.
    #[must_use]
    pub fn validate_arguments(&self, class: &str, args: &Fields, strict: bool) -> bool {
        self.check_arguments(class, args, strict).is_ok()
    }

    /// `validate_arguments` with the reason for rejection.
    pub fn check_arguments(&self, class: &str, args: &Fields, strict: bool) -> Result<(), ModelError> {
        let spec = self.class(class)?;

        for (name, value) in args {
            if let Some(attr) = spec.attribute(name) {
                self.check_attribute_value(spec, name, attr, value)?;
            } else if let Some(reference) = spec.reference(name) {
                self.check_reference_value(spec, name, reference, value)?;
            } else {
                return Err(ModelError::UnknownMember {
                    class: class.to_string(),
                    member: name.clone(),
                });
            }
        }

        if strict {
            let present: BTreeSet<&str> = args.keys().map(|k| spec.member_name(k)).collect();
            for (name, attr) in &spec.attributes {
                if attr.required && !present.contains(name.as_str()) {
                    return Err(ModelError::MissingField {
                        class: class.to_string(),
                        field: name.clone(),
                    });
                }
            }
            for (name, reference) in &spec.references {
                if reference.required && !present.contains(name.as_str()) {
                    return Err(ModelError::MissingField {
                        class: class.to_string(),
                        field: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_attribute_value(
        &self,
        spec: &ClassSpec,
        name: &str,
        attr: &AttributeSpec,
        value: &FieldValue,
    ) -> Result<(), ModelError> {
        match value {
            FieldValue::Value(v) if attr.attr_type.accepts(v) => Ok(()),
            other => Err(ModelError::TypeMismatch {
                class: spec.name.clone(),
                field: name.to_string(),
                expected: attr.attr_type.name().to_string(),
                found: other.type_name(),
            }),
        }
    }

    fn check_reference_value(
        &self,
        spec: &ClassSpec,
        name: &str,
        reference: &ReferenceSpec,
        value: &FieldValue,
    ) -> Result<(), ModelError> {
        let mismatch = |found: String| ModelError::TypeMismatch {
            class: spec.name.clone(),
            field: name.to_string(),
            expected: if reference.is_multi() {
                format!("list of {}", reference.target)
            } else {
                reference.target.clone()
            },
            found,
        };
        match (reference.multiplicity, value) {
            (Multiplicity::Mono, FieldValue::Mono(obj)) => {
                if self.is_subclass_of(obj.class_name(), &reference.target) {
                    Ok(())
                } else {
                    Err(mismatch(obj.class_name().to_string()))
                }
            }
            (Multiplicity::Multi, FieldValue::Multi(objs)) => {
                match objs
                    .iter()
                    .find(|obj| !self.is_subclass_of(obj.class_name(), &reference.target))
                {
                    Some(obj) => Err(mismatch(format!("list containing {}", obj.class_name()))),
                    None => Ok(()),
                }
            }
            (_, other) => Err(mismatch(other.type_name())),
        }
    }

    /// Partition a flat argument map into attributes and references.
    ///
    /// The key (under its individual or generic name) is returned among the
    /// attributes as `key`. Any other name fails with `UnknownMember`.
    pub fn separate_attrs_refs(&self, class: &str, args: &Fields) -> Result<(Fields, Fields), ModelError> {
        let spec = self.class(class)?;
        let mut attributes = Fields::new();
        let mut references = Fields::new();
        for (name, value) in args {
            if spec.is_key_name(name) && spec.key_attribute().is_some() {
                attributes.insert(GENERIC_KEY.to_string(), value.clone());
            } else if spec.attributes.contains_key(name) {
                attributes.insert(name.clone(), value.clone());
            } else if spec.references.contains_key(name) {
                references.insert(name.clone(), value.clone());
            } else {
                return Err(ModelError::UnknownMember {
                    class: class.to_string(),
                    member: name.clone(),
                });
            }
        }
        Ok((attributes, references))
    }

    /// One human-readable line per member of the class.
    pub fn variable_summary(&self, class: &str) -> Result<Vec<String>, ModelError> {
        let spec = self.class(class)?;
        let necessity = |required: bool| if required { "required" } else { "optional" };

        let mut lines: Vec<String> = spec
            .attributes
            .iter()
            .map(|(name, attr)| {
                format!(
                    "{}{} : {} ({})",
                    name,
                    if attr.is_key { " (key)" } else { "" },
                    attr.attr_type.name(),
                    necessity(attr.required)
                )
            })
            .collect();
        lines.extend(spec.references.iter().map(|(name, reference)| {
            let mut line = format!(
                "{} : {} ({}) ({})",
                name,
                reference.target,
                necessity(reference.required),
                reference.multiplicity.name()
            );
            if let Some(inverse) = &reference.inverse {
                line.push_str(&format!(" Inverse: {inverse}"));
            }
            line
        }));
        Ok(lines)
    }

    /// Attributes marked as indexed.
    #[must_use]
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    fn semantic_validate(&self) -> Result<(), ModelError> {
        for class in self.classes.values() {
            validate_identifier(&class.name)?;

            let key_count = class.attributes.values().filter(|a| a.is_key).count();
            if class.is_abstract {
                if key_count != 0 {
                    return Err(ModelError::Specification(format!(
                        "Abstract class {} must not declare a key attribute",
                        class.name
                    )));
                }
            } else {
                let key_is_text = class
                    .attributes
                    .values()
                    .find(|a| a.is_key)
                    .is_some_and(|a| a.attr_type == AttributeType::Text);
                if key_count != 1 || !key_is_text {
                    return Err(ModelError::Specification(format!(
                        "Class {} should have exactly one key attribute of type text",
                        class.name
                    )));
                }
            }

            for (name, attr) in &class.attributes {
                validate_identifier(name)?;
                if name == GENERIC_KEY && !attr.is_key {
                    return Err(ModelError::Specification(format!(
                        "Class {}: '{}' is reserved for the key attribute",
                        class.name, GENERIC_KEY
                    )));
                }
            }

            let mut relationship_types = BTreeSet::new();
            for (name, reference) in &class.references {
                validate_identifier(name)?;
                if class.attributes.contains_key(name) {
                    return Err(ModelError::Specification(format!(
                        "Class {}: {} is declared as attribute and reference",
                        class.name, name
                    )));
                }
                if !relationship_types.insert(relationship_type(name)) {
                    return Err(ModelError::Specification(format!(
                        "Class {}: reference {} collides with another reference",
                        class.name, name
                    )));
                }
                let Some(target) = self.classes.get(&reference.target) else {
                    return Err(ModelError::Specification(format!(
                        "Reference {}.{} points to unknown class {}",
                        class.name, name, reference.target
                    )));
                };
                if let Some(inverse) = &reference.inverse
                    && !target.references.contains_key(inverse)
                {
                    return Err(ModelError::Specification(format!(
                        "Inverse {} of {}.{} is not a reference of {}",
                        inverse, class.name, name, target.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Merge the members of the whole `extends` chain into one class, parents first.
fn flatten(declared: &IndexMap<String, ClassSpec>, name: &str) -> Result<ClassSpec, ModelError> {
    let mut chain = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = declared.get(name);
    while let Some(class) = current {
        if !seen.insert(class.name.as_str()) {
            return Err(ModelError::Specification(format!(
                "Inheritance cycle through class {}",
                class.name
            )));
        }
        chain.push(class);
        current = match &class.extends {
            Some(parent) => Some(declared.get(parent).ok_or_else(|| {
                ModelError::Specification(format!(
                    "Class {} extends unknown class {}",
                    class.name, parent
                ))
            })?),
            None => None,
        };
    }

    let Some(own) = chain.first() else {
        return Err(ModelError::UnknownClass(name.to_string()));
    };
    let mut flattened = ClassSpec {
        name: own.name.clone(),
        is_abstract: own.is_abstract,
        extends: own.extends.clone(),
        attributes: IndexMap::new(),
        references: IndexMap::new(),
    };
    for class in chain.iter().rev() {
        for (attr_name, attr) in &class.attributes {
            let mut attr = attr.clone();
            // A key is always required.
            attr.required |= attr.is_key;
            flattened.attributes.insert(attr_name.clone(), attr);
        }
        for (ref_name, reference) in &class.references {
            flattened
                .references
                .insert(ref_name.clone(), reference.clone());
        }
    }
    Ok(flattened)
}

/// Labels, relationship types and property names share one identifier grammar.
pub(crate) fn validate_identifier(name: &str) -> Result<(), ModelError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ModelError::InvalidIdentifier(name.to_string()))
    }
}

// =============================================================================
// TESTS
// =============================================================================
