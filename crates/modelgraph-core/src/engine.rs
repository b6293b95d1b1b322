//! # Persistence Engine
//!
//! `ModelDb` maps live objects to graph nodes and back.
//!
//! ## Retrieval
//!
//! | register entry | request | action                                    |
//! |----------------|---------|-------------------------------------------|
//! | full           | any     | return it                                 |
//! | reduced        | reduced | return it                                 |
//! | reduced        | full    | load node + outgoing edges, upgrade stub  |
//! | none           | any     | load node; absent means `Ok(None)`        |
//!
//! Related objects found while loading are only ever created as reduced
//! stubs, so one load reaches at most one hop into the graph.
//!
//! ## Units of work
//!
//! Every public operation runs in one store transaction. Reads answered
//! by the register open none, and reads that reach the store use a read
//! transaction. In-memory effects
//! (register inserts and evictions, upgrades, field assignments, inverse
//! links) are staged in the unit and applied only once the transaction has
//! committed. A failed operation rolls back and leaves memory untouched.

use crate::class_registry::ClassRegistry;
use crate::entity::{FieldValue, Fields, ObjectRef};
use crate::graph::{
    Counters, GraphDriver, GraphStats, GraphTransaction, Link, NodeRecord, Properties, QueryResult,
    RelatedRecord, RelationshipFilter, Statement,
};
use crate::register::ObjectRegister;
use crate::spec::{ClassSpec, GENERIC_KEY, SpecRegistry, relationship_type};
use crate::{ModelError, Value};
use std::collections::{BTreeMap, BTreeSet};

type Identity = (String, String);

fn identity(object: &ObjectRef) -> Identity {
    (object.class_name().to_string(), object.key().to_string())
}

// =============================================================================
// UNIT OF WORK
// =============================================================================

/// In-memory effect applied after commit.
#[derive(Debug)]
enum StagedChange {
    Insert(ObjectRef),
    Evict(Identity),
    Upgrade(ObjectRef),
    Assign {
        object: ObjectRef,
        member: String,
        value: Option<FieldValue>,
    },
    /// Add `object` to the inverse member of a loaded `target`.
    Link {
        target: ObjectRef,
        member: String,
        object: ObjectRef,
        multi: bool,
    },
    /// Remove `object` from the inverse member of a loaded `target`.
    Unlink {
        target: ObjectRef,
        member: String,
        object: ObjectRef,
    },
}

/// One store transaction plus the staged in-memory effects.
struct UnitOfWork<T> {
    tx: T,
    /// Instances inserted (`Some`) or evicted (`None`) within this unit.
    visible: BTreeMap<Identity, Option<ObjectRef>>,
    /// Upgrade fields of stubs, applied at commit.
    upgrades: BTreeMap<Identity, Fields>,
    changes: Vec<StagedChange>,
    counters: Counters,
}

impl<T: GraphTransaction> UnitOfWork<T> {
    fn new(tx: T) -> Self {
        Self {
            tx,
            visible: BTreeMap::new(),
            upgrades: BTreeMap::new(),
            changes: Vec::new(),
            counters: Counters::default(),
        }
    }

    fn run(&mut self, statement: &Statement) -> Result<QueryResult, ModelError> {
        let result = self.tx.run(statement)?;
        self.counters += result.counters;
        Ok(result)
    }

    /// Register lookup that sees this unit's own inserts and evictions.
    fn lookup(&self, register: &ObjectRegister, class: &str, key: &str) -> Option<ObjectRef> {
        match self.visible.get(&(class.to_string(), key.to_string())) {
            Some(staged) => staged.clone(),
            None => register.get(class, key).cloned(),
        }
    }

    /// Reduced, and not scheduled for an upgrade in this unit.
    fn is_reduced(&self, object: &ObjectRef) -> Result<bool, ModelError> {
        Ok(object.mini_mode()? && !self.upgrades.contains_key(&identity(object)))
    }

    /// Fields of an instance, including a pending upgrade.
    fn fields_of(&self, object: &ObjectRef) -> Result<Fields, ModelError> {
        let mut fields = object.fields()?;
        if let Some(pending) = self.upgrades.get(&identity(object)) {
            for (name, value) in pending {
                match (fields.get_mut(name), value) {
                    (Some(FieldValue::Multi(existing)), FieldValue::Multi(more)) => {
                        existing.extend(more.iter().cloned());
                    }
                    _ => {
                        fields.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Ok(fields)
    }

    fn stage_insert(&mut self, object: ObjectRef) {
        self.visible.insert(identity(&object), Some(object.clone()));
        self.changes.push(StagedChange::Insert(object));
    }

    fn stage_evict(&mut self, class: &str, key: &str) {
        let id = (class.to_string(), key.to_string());
        self.visible.insert(id.clone(), None);
        self.upgrades.remove(&id);
        self.changes.push(StagedChange::Evict(id));
    }

    fn stage_upgrade(&mut self, object: ObjectRef, fields: Fields) {
        self.upgrades.insert(identity(&object), fields);
        self.changes.push(StagedChange::Upgrade(object));
    }

    fn stage_assign(&mut self, object: ObjectRef, member: &str, value: Option<FieldValue>) {
        self.changes.push(StagedChange::Assign {
            object,
            member: member.to_string(),
            value,
        });
    }

    fn commit(self, register: &mut ObjectRegister) -> Result<Counters, ModelError> {
        let Self {
            tx,
            mut upgrades,
            changes,
            counters,
            ..
        } = self;
        tx.commit()?;

        let mut first_error = None;
        for change in changes {
            if let Err(e) = apply(change, &mut upgrades, register) {
                tracing::warn!("In-memory change after commit failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(counters),
        }
    }

    fn rollback(self) -> Result<(), ModelError> {
        self.tx.rollback()
    }
}

fn apply(
    change: StagedChange,
    upgrades: &mut BTreeMap<Identity, Fields>,
    register: &mut ObjectRegister,
) -> Result<(), ModelError> {
    match change {
        StagedChange::Insert(object) => {
            register.insert(object);
        }
        StagedChange::Evict((class, key)) => {
            register.evict(&class, &key);
        }
        StagedChange::Upgrade(object) => {
            if let Some(fields) = upgrades.remove(&identity(&object)) {
                object.upgrade(fields)?;
            }
            register.insert(object);
        }
        StagedChange::Assign {
            object,
            member,
            value,
        } => object.assign(&member, value)?,
        StagedChange::Link {
            target,
            member,
            object,
            multi,
        } => {
            if target.mini_mode()? {
                return Ok(());
            }
            if multi {
                let mut list = match target.field(&member)? {
                    Some(FieldValue::Multi(list)) => list,
                    _ => Vec::new(),
                };
                if !list.iter().any(|o| o.ptr_eq(&object)) {
                    list.push(object);
                    target.assign(&member, Some(FieldValue::Multi(list)))?;
                }
            } else {
                target.assign(&member, Some(FieldValue::Mono(object)))?;
            }
        }
        StagedChange::Unlink {
            target,
            member,
            object,
        } => {
            if target.mini_mode()? {
                return Ok(());
            }
            match target.field(&member)? {
                Some(FieldValue::Multi(list)) => {
                    let kept = list.into_iter().filter(|o| !o.ptr_eq(&object)).collect();
                    target.assign(&member, Some(FieldValue::Multi(kept)))?;
                }
                Some(FieldValue::Mono(current)) if current.ptr_eq(&object) => {
                    target.assign(&member, None)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn verify_created(counters: Counters, nodes: usize, relationships: usize) -> Result<(), ModelError> {
    if counters.nodes_created != nodes || counters.relationships_created != relationships {
        return Err(ModelError::CountMismatch {
            expected_nodes: nodes,
            expected_relationships: relationships,
            nodes: counters.nodes_created,
            relationships: counters.relationships_created,
        });
    }
    Ok(())
}

/// Edges a link list produces, mirrored ones included.
fn edge_count(links: &[Link]) -> usize {
    links.len() + links.iter().filter(|l| l.inverse.is_some()).count()
}

// =============================================================================
// ENGINE
// =============================================================================

/// The persistence engine: specification set, class registry, object
/// register and graph driver of one activation.
pub struct ModelDb<D: GraphDriver> {
    specs: SpecRegistry,
    classes: ClassRegistry,
    register: ObjectRegister,
    driver: D,
}

impl<D: GraphDriver + std::fmt::Debug> std::fmt::Debug for ModelDb<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDb")
            .field("classes", &self.classes)
            .field("objects", &self.register.len())
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl<D: GraphDriver> ModelDb<D> {
    /// Engine with dynamic classes for every concrete class of `specs`.
    pub fn new(specs: SpecRegistry, driver: D) -> Self {
        let classes = ClassRegistry::from_specs(&specs);
        Self::with_classes(specs, classes, driver)
    }

    pub fn with_classes(specs: SpecRegistry, classes: ClassRegistry, driver: D) -> Self {
        Self {
            specs,
            classes,
            register: ObjectRegister::new(),
            driver,
        }
    }

    /// Swap in a new specification set and class registry.
    ///
    /// Instances of the previous activation are dropped from the register.
    pub fn activate(&mut self, specs: SpecRegistry, classes: ClassRegistry) {
        tracing::info!(
            classes = specs.class_names().count(),
            dropped = self.register.len(),
            "Specification set activated"
        );
        self.specs = specs;
        self.classes = classes;
        self.register.clear();
    }

    #[must_use]
    pub fn specs(&self) -> &SpecRegistry {
        &self.specs
    }

    #[must_use]
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    #[must_use]
    pub fn register(&self) -> &ObjectRegister {
        &self.register
    }

    /// Forget every live instance. The store is unaffected.
    pub fn clear_register(&mut self) {
        self.register.clear();
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn stats(&self) -> Result<GraphStats, ModelError> {
        self.driver.stats()
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// Fetch one object. `Ok(None)` when no node exists for the key.
    pub fn get_object(&mut self, class: &str, key: &str, reduced: bool) -> Result<Option<ObjectRef>, ModelError> {
        self.specs.concrete_class(class)?;
        if let Some(object) = self.registered(class, key, reduced)? {
            return Ok(Some(object));
        }
        self.inspect(|db, unit| db.resolve(unit, class, key, reduced))
    }

    /// Fetch several `(class, key)` pairs in one read transaction.
    pub fn get_multiple_objects(
        &mut self,
        requests: &[(&str, &str)],
        reduced: bool,
    ) -> Result<Vec<Option<ObjectRef>>, ModelError> {
        let mut hits = Vec::with_capacity(requests.len());
        for (class, key) in requests {
            self.specs.concrete_class(class)?;
            hits.push(self.registered(class, key, reduced)?);
        }
        if hits.iter().all(Option::is_some) {
            return Ok(hits);
        }
        self.inspect(|db, unit| {
            requests
                .iter()
                .map(|(class, key)| db.resolve(unit, class, key, reduced))
                .collect()
        })
    }

    /// Objects whose attributes equal the given values and whose references
    /// point at the given targets.
    pub fn find_objects(&mut self, class: &str, filters: &Fields, reduced: bool) -> Result<Vec<ObjectRef>, ModelError> {
        self.inspect(|db, unit| db.find_in(unit, class, filters, reduced))
    }

    /// Create and persist an object. An existing key returns the existing object unchanged.
    pub fn create_object(&mut self, class: &str, args: Fields) -> Result<ObjectRef, ModelError> {
        let object = self.transact(|db, unit| db.create_in(unit, class, args))?;
        tracing::info!(class, key = object.key(), "Object created");
        Ok(object)
    }

    /// Create a batch of `(class, args)` pairs in order, all or nothing.
    ///
    /// A later entry may reference an earlier one of the same batch.
    pub fn create_multiple_objects(&mut self, batch: Vec<(&str, Fields)>) -> Result<Vec<ObjectRef>, ModelError> {
        let objects = self.transact(|db, unit| {
            batch
                .into_iter()
                .map(|(class, args)| db.create_in(unit, class, args))
                .collect::<Result<Vec<_>, _>>()
        })?;
        tracing::info!(count = objects.len(), "Objects created");
        Ok(objects)
    }

    /// Change attributes and replace references of an existing object.
    pub fn update_object(&mut self, class: &str, key: &str, args: Fields) -> Result<ObjectRef, ModelError> {
        let object = self.transact(|db, unit| db.update_in(unit, class, key, args))?;
        tracing::info!(class, key, "Object updated");
        Ok(object)
    }

    /// Detach-delete an object and evict it from the register.
    pub fn delete_object(&mut self, class: &str, key: &str) -> Result<(), ModelError> {
        self.transact(|db, unit| db.delete_in(unit, class, key))?;
        tracing::info!(class, key, "Object deleted");
        Ok(())
    }

    /// Delete several `(class, key)` pairs, all or nothing.
    pub fn delete_multiple_objects(&mut self, targets: &[(&str, &str)]) -> Result<(), ModelError> {
        self.transact(|db, unit| {
            targets
                .iter()
                .try_for_each(|(class, key)| db.delete_in(unit, class, key))
        })?;
        tracing::info!(count = targets.len(), "Objects deleted");
        Ok(())
    }

    /// Persist an in-memory object together with everything it references.
    ///
    /// Returns the registered instance for the object's key.
    pub fn add_object(&mut self, object: &ObjectRef) -> Result<ObjectRef, ModelError> {
        let mut added = self.add_multiple_objects(std::slice::from_ref(object))?;
        added
            .pop()
            .ok_or_else(|| ModelError::NotFound {
                class: object.class_name().to_string(),
                key: object.key().to_string(),
            })
    }

    /// `add_object` for several roots in one transaction.
    pub fn add_multiple_objects(&mut self, objects: &[ObjectRef]) -> Result<Vec<ObjectRef>, ModelError> {
        let (added, created) = self.transact(|db, unit| db.add_in(unit, objects))?;
        tracing::info!(roots = objects.len(), created, "Objects added");
        Ok(added)
    }

    /// Copy the attributes and references of an object under a new key.
    pub fn clone_object(&mut self, class: &str, key: &str, new_key: &str) -> Result<ObjectRef, ModelError> {
        let object = self.transact(|db, unit| {
            let source = db
                .resolve(unit, class, key, false)?
                .ok_or_else(|| ModelError::NotFound {
                    class: class.to_string(),
                    key: key.to_string(),
                })?;
            if db.resolve(unit, class, new_key, true)?.is_some() {
                return Err(ModelError::AlreadyExists {
                    class: class.to_string(),
                    key: new_key.to_string(),
                });
            }
            let mut args = unit.fields_of(&source)?;
            args.insert(GENERIC_KEY.to_string(), FieldValue::from(new_key));
            db.create_in(unit, class, args)
        })?;
        tracing::info!(class, key, new_key, "Object cloned");
        Ok(object)
    }

    /// Build a full in-memory instance without persisting or registering it.
    pub fn construct_object(&self, class: &str, args: Fields) -> Result<ObjectRef, ModelError> {
        let spec = self.specs.concrete_class(class)?;
        let key = key_from_args(spec, &args)?;
        self.specs.check_arguments(class, &args, true)?;
        let (mut attrs, refs) = self.specs.separate_attrs_refs(class, &args)?;
        attrs.shift_remove(GENERIC_KEY);
        attrs.extend(refs);
        self.classes.construct(class, &key, attrs)
    }

    // -------------------------------------------------------------------------
    // Transaction plumbing
    // -------------------------------------------------------------------------

    /// Register entry that satisfies the request without the store.
    fn registered(&self, class: &str, key: &str, reduced: bool) -> Result<Option<ObjectRef>, ModelError> {
        match self.register.get(class, key) {
            Some(object) if reduced || !object.mini_mode()? => Ok(Some(object.clone())),
            _ => Ok(None),
        }
    }

    fn transact<R>(
        &mut self,
        operation: impl FnOnce(&Self, &mut UnitOfWork<D::Transaction>) -> Result<R, ModelError>,
    ) -> Result<R, ModelError> {
        let tx = self.driver.begin()?;
        self.complete(UnitOfWork::new(tx), operation)
    }

    /// `transact` over a read transaction.
    fn inspect<R>(
        &mut self,
        operation: impl FnOnce(&Self, &mut UnitOfWork<D::ReadTransaction>) -> Result<R, ModelError>,
    ) -> Result<R, ModelError> {
        let tx = self.driver.begin_read()?;
        self.complete(UnitOfWork::new(tx), operation)
    }

    fn complete<T: GraphTransaction, R>(
        &mut self,
        mut unit: UnitOfWork<T>,
        operation: impl FnOnce(&Self, &mut UnitOfWork<T>) -> Result<R, ModelError>,
    ) -> Result<R, ModelError> {
        match operation(self, &mut unit) {
            Ok(value) => {
                let counters = unit.commit(&mut self.register)?;
                tracing::debug!(?counters, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = unit.rollback() {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                tracing::debug!("Transaction rolled back: {}", e);
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    fn resolve<T: GraphTransaction>(
        &self,
        unit: &mut UnitOfWork<T>,
        class: &str,
        key: &str,
        reduced: bool,
    ) -> Result<Option<ObjectRef>, ModelError> {
        let existing = unit.lookup(&self.register, class, key);
        if let Some(object) = &existing
            && (reduced || !unit.is_reduced(object)?)
        {
            return Ok(Some(object.clone()));
        }

        let Some((record, related)) = self.fetch(unit, class, key, !reduced)? else {
            if existing.is_some() {
                tracing::debug!(class, key, "Stale stub evicted");
                unit.stage_evict(class, key);
            }
            return Ok(None);
        };

        let stub = match existing {
            Some(stub) => stub,
            None => {
                let stub = self.classes.create_reduced(class, key)?;
                unit.stage_insert(stub.clone());
                stub
            }
        };
        if !reduced {
            let fields = self.hydrate(unit, class, &record, related)?;
            let mut check = fields.clone();
            check.insert(GENERIC_KEY.to_string(), FieldValue::from(key));
            self.specs.check_arguments(class, &check, true)?;
            unit.stage_upgrade(stub.clone(), fields);
        }
        Ok(Some(stub))
    }

    fn fetch<T: GraphTransaction>(
        &self,
        unit: &mut UnitOfWork<T>,
        class: &str,
        key: &str,
        with_relationships: bool,
    ) -> Result<Option<(NodeRecord, Vec<RelatedRecord>)>, ModelError> {
        let statement = Statement::load_node(class, key, with_relationships)?;
        let result = unit.run(&statement)?;
        Ok(result
            .records
            .into_iter()
            .next()
            .map(|record| (record, result.related)))
    }

    /// Fields of a loaded node: its attribute properties plus references
    /// grouped by member, each target a register instance or a fresh stub.
    fn hydrate<T: GraphTransaction>(
        &self,
        unit: &mut UnitOfWork<T>,
        class: &str,
        record: &NodeRecord,
        related: Vec<RelatedRecord>,
    ) -> Result<Fields, ModelError> {
        let spec = self.specs.class(class)?;
        let mut fields = Fields::new();
        for (name, _) in spec.non_key_attributes() {
            if let Some(value) = record.properties.get(name) {
                fields.insert(name.to_string(), FieldValue::Value(value.clone()));
            }
        }

        for rel in related {
            let Some((name, reference)) = spec.reference_for_relationship(&rel.rel_type) else {
                tracing::warn!(
                    class,
                    key = record.key.as_str(),
                    rel_type = rel.rel_type.as_str(),
                    "Skipping relationship without a matching reference"
                );
                continue;
            };
            if !self.specs.is_concrete(&rel.node.label) {
                tracing::warn!(
                    class,
                    key = record.key.as_str(),
                    label = rel.node.label.as_str(),
                    "Skipping relationship to a node of an unknown class"
                );
                continue;
            }
            let target = match unit.lookup(&self.register, &rel.node.label, &rel.node.key) {
                Some(target) => target,
                None => {
                    let stub = self.classes.create_reduced(&rel.node.label, &rel.node.key)?;
                    unit.stage_insert(stub.clone());
                    stub
                }
            };
            if reference.is_multi() {
                match fields.get_mut(name) {
                    Some(FieldValue::Multi(list)) => list.push(target),
                    _ => {
                        fields.insert(name.to_string(), FieldValue::Multi(vec![target]));
                    }
                }
            } else {
                if fields.contains_key(name) {
                    tracing::warn!(class, key = record.key.as_str(), reference = name, "Several edges for a mono reference");
                }
                fields.insert(name.to_string(), FieldValue::Mono(target));
            }
        }
        Ok(fields)
    }

    // -------------------------------------------------------------------------
    // Querying
    // -------------------------------------------------------------------------

    fn find_in<T: GraphTransaction>(
        &self,
        unit: &mut UnitOfWork<T>,
        class: &str,
        filters: &Fields,
        reduced: bool,
    ) -> Result<Vec<ObjectRef>, ModelError> {
        let spec = self.specs.concrete_class(class)?;
        let mut properties = Properties::new();
        let mut relationships = Vec::new();

        for (name, value) in filters {
            if let Some(attr) = spec.attribute(name) {
                let accepted = match value {
                    FieldValue::Value(v) if attr.attr_type.accepts(v) => v.clone(),
                    other => {
                        return Err(ModelError::TypeMismatch {
                            class: class.to_string(),
                            field: name.clone(),
                            expected: attr.attr_type.name().to_string(),
                            found: other.type_name(),
                        });
                    }
                };
                let property = if spec.is_key_name(name) {
                    GENERIC_KEY.to_string()
                } else {
                    name.clone()
                };
                properties.insert(property, accepted);
            } else if spec.reference(name).is_some() {
                let rel_type = relationship_type(name);
                match value {
                    FieldValue::Value(Value::Text(target_key)) => relationships.push(RelationshipFilter {
                        rel_type,
                        target_label: None,
                        target_key: target_key.clone(),
                    }),
                    FieldValue::Value(other) => {
                        return Err(ModelError::TypeMismatch {
                            class: class.to_string(),
                            field: name.clone(),
                            expected: "object or key".to_string(),
                            found: other.type_name().to_string(),
                        });
                    }
                    reference => {
                        for target in reference.targets() {
                            relationships.push(RelationshipFilter {
                                rel_type: rel_type.clone(),
                                target_label: Some(target.class_name().to_string()),
                                target_key: target.key().to_string(),
                            });
                        }
                    }
                }
            } else {
                return Err(ModelError::UnknownMember {
                    class: class.to_string(),
                    member: name.clone(),
                });
            }
        }

        let statement = Statement::find_nodes(class, &properties, &relationships)?;
        let records = unit.run(&statement)?.records;
        let mut objects = Vec::with_capacity(records.len());
        for record in records {
            if let Some(object) = self.resolve(unit, class, &record.key, reduced)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    fn create_in(
        &self,
        unit: &mut UnitOfWork<D::Transaction>,
        class: &str,
        args: Fields,
    ) -> Result<ObjectRef, ModelError> {
        let spec = self.specs.concrete_class(class)?;
        let key = key_from_args(spec, &args)?;

        if let Some(existing) = self.resolve(unit, class, &key, true)? {
            tracing::debug!(class, key = key.as_str(), "Object exists, creation skipped");
            return Ok(existing);
        }

        self.specs.check_arguments(class, &args, true)?;
        let (attrs, refs) = self.specs.separate_attrs_refs(class, &args)?;

        let mut links = Vec::new();
        let mut members = Fields::new();
        let mut properties = Properties::new();
        for (name, value) in attrs {
            if name == GENERIC_KEY {
                continue;
            }
            if let FieldValue::Value(v) = &value {
                properties.insert(name.clone(), v.clone());
            }
            members.insert(name, value);
        }
        for (name, value) in refs {
            let canonical = self.canonical_reference(unit, &value)?;
            links.extend(self.links_for(spec, &name, &canonical)?);
            members.insert(name, canonical);
        }

        let object = self.classes.construct(class, &key, members.clone())?;
        let statement = Statement::create_node(class, &key, &properties, &links)?;
        let result = unit.run(&statement)?;
        verify_created(result.counters, 1, edge_count(&links))?;

        unit.stage_insert(object.clone());
        self.stage_inverse_links(unit, spec, &object, &members)?;
        Ok(object)
    }

    /// Replace every target by the instance registered for its key.
    fn canonical_reference(
        &self,
        unit: &mut UnitOfWork<D::Transaction>,
        value: &FieldValue,
    ) -> Result<FieldValue, ModelError> {
        match value {
            FieldValue::Value(v) => Ok(FieldValue::Value(v.clone())),
            FieldValue::Mono(target) => Ok(FieldValue::Mono(self.canonical_target(unit, target)?)),
            FieldValue::Multi(targets) => targets
                .iter()
                .map(|t| self.canonical_target(unit, t))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::Multi),
        }
    }

    fn canonical_target(
        &self,
        unit: &mut UnitOfWork<D::Transaction>,
        target: &ObjectRef,
    ) -> Result<ObjectRef, ModelError> {
        self.resolve(unit, target.class_name(), target.key(), true)?
            .ok_or_else(|| ModelError::MissingReference {
                class: target.class_name().to_string(),
                key: target.key().to_string(),
            })
    }

    /// Relationships for one reference member, mirrored when an inverse is declared.
    fn links_for(&self, spec: &ClassSpec, member: &str, value: &FieldValue) -> Result<Vec<Link>, ModelError> {
        let reference = spec.reference(member).ok_or_else(|| ModelError::UnknownMember {
            class: spec.name.clone(),
            member: member.to_string(),
        })?;
        let rel_type = relationship_type(member);
        let inverse = reference.inverse.as_deref().map(relationship_type);
        Ok(value
            .targets()
            .into_iter()
            .map(|target| Link {
                rel_type: rel_type.clone(),
                target_label: target.class_name().to_string(),
                target_key: target.key().to_string(),
                inverse: inverse.clone(),
            })
            .collect())
    }

    /// Stage inverse-member updates on loaded targets of `object`'s references.
    fn stage_inverse_links(
        &self,
        unit: &mut UnitOfWork<D::Transaction>,
        spec: &ClassSpec,
        object: &ObjectRef,
        members: &Fields,
    ) -> Result<(), ModelError> {
        for (name, value) in members {
            let Some(inverse) = spec.reference(name).and_then(|r| r.inverse.as_deref()) else {
                continue;
            };
            for target in value.targets() {
                if unit.is_reduced(target)? {
                    continue;
                }
                let multi = self.specs.is_multi_reference(target.class_name(), inverse)?;
                unit.changes.push(StagedChange::Link {
                    target: target.clone(),
                    member: inverse.to_string(),
                    object: object.clone(),
                    multi,
                });
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Update and delete
    // -------------------------------------------------------------------------

    fn update_in(
        &self,
        unit: &mut UnitOfWork<D::Transaction>,
        class: &str,
        key: &str,
        args: Fields,
    ) -> Result<ObjectRef, ModelError> {
        let spec = self.specs.concrete_class(class)?;
        let object = self
            .resolve(unit, class, key, false)?
            .ok_or_else(|| ModelError::NotFound {
                class: class.to_string(),
                key: key.to_string(),
            })?;
        if args.keys().any(|name| spec.is_key_name(name)) {
            return Err(ModelError::KeyMutation(class.to_string()));
        }
        self.specs.check_arguments(class, &args, false)?;
        let (attrs, refs) = self.specs.separate_attrs_refs(class, &args)?;

        if !attrs.is_empty() {
            let properties: Properties = attrs
                .iter()
                .filter_map(|(name, value)| value.as_value().map(|v| (name.clone(), v.clone())))
                .collect();
            let statement = Statement::set_properties(class, key, &properties)?;
            if unit.run(&statement)?.counters.properties_set != properties.len() {
                return Err(ModelError::NotFound {
                    class: class.to_string(),
                    key: key.to_string(),
                });
            }
        }

        let current = unit.fields_of(&object)?;
        let mut new_members = Fields::new();
        for (name, value) in refs {
            let reference = spec.reference(&name).ok_or_else(|| ModelError::UnknownMember {
                class: class.to_string(),
                member: name.clone(),
            })?;
            let inverse = reference.inverse.as_deref().map(relationship_type);
            let statement = Statement::delete_relationships(class, key, &relationship_type(&name), inverse.as_deref())?;
            unit.run(&statement)?;

            let canonical = dedup_targets(self.canonical_reference(unit, &value)?);
            let links = self.links_for(spec, &name, &canonical)?;
            if !links.is_empty() {
                let statement = Statement::merge_relationships(class, key, &links)?;
                verify_created(unit.run(&statement)?.counters, 0, edge_count(&links))?;
            }

            if let (Some(inverse), Some(previous)) = (reference.inverse.as_deref(), current.get(&name)) {
                for target in previous.targets() {
                    unit.changes.push(StagedChange::Unlink {
                        target: target.clone(),
                        member: inverse.to_string(),
                        object: object.clone(),
                    });
                }
            }
            new_members.insert(name, canonical);
        }

        for (name, value) in attrs {
            unit.stage_assign(object.clone(), &name, Some(value));
        }
        for (name, value) in &new_members {
            unit.stage_assign(object.clone(), name, Some(value.clone()));
        }
        self.stage_inverse_links(unit, spec, &object, &new_members)?;
        Ok(object)
    }

    fn delete_in(&self, unit: &mut UnitOfWork<D::Transaction>, class: &str, key: &str) -> Result<(), ModelError> {
        self.specs.concrete_class(class)?;
        let not_found = || ModelError::NotFound {
            class: class.to_string(),
            key: key.to_string(),
        };
        self.resolve(unit, class, key, true)?.ok_or_else(not_found)?;

        let statement = Statement::detach_delete(class, key)?;
        let counters = unit.run(&statement)?.counters;
        match counters.nodes_deleted {
            1 => {}
            0 => return Err(not_found()),
            nodes => {
                return Err(ModelError::CountMismatch {
                    expected_nodes: 1,
                    expected_relationships: counters.relationships_deleted,
                    nodes,
                    relationships: counters.relationships_deleted,
                });
            }
        }
        unit.stage_evict(class, key);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Synchronization
    // -------------------------------------------------------------------------

    /// Persist object graphs rooted at `roots`.
    ///
    /// 1. Collect: walk references depth-first with a visited set, classify
    ///    every object as existing (must match) or new (must validate).
    /// 2. Create one node per new object.
    /// 3. Create the relationships of new objects, each edge once.
    fn add_in(
        &self,
        unit: &mut UnitOfWork<D::Transaction>,
        roots: &[ObjectRef],
    ) -> Result<(Vec<ObjectRef>, usize), ModelError> {
        let mut visited = BTreeSet::new();
        let mut canonical: BTreeMap<Identity, ObjectRef> = BTreeMap::new();
        let mut planned: Vec<ObjectRef> = Vec::new();

        let mut stack: Vec<ObjectRef> = roots.iter().rev().cloned().collect();
        while let Some(object) = stack.pop() {
            if !visited.insert(identity(&object)) {
                continue;
            }
            let class = object.class_name();
            let key = object.key();
            self.specs.concrete_class(class)?;

            let reduced = object.mini_mode()?;
            if let Some(existing) = self.resolve(unit, class, key, reduced)? {
                if !reduced && !existing.ptr_eq(&object) {
                    let stored = unit.fields_of(&existing)?;
                    if !same_fields(&object.fields()?, &stored) {
                        return Err(ModelError::Conflict {
                            class: class.to_string(),
                            key: key.to_string(),
                        });
                    }
                }
                canonical.insert(identity(&object), existing);
                continue;
            }

            let fields = object.fields()?;
            let mut check = fields.clone();
            check.insert(GENERIC_KEY.to_string(), FieldValue::from(key));
            self.specs.check_arguments(class, &check, true)?;

            for value in fields.values().rev() {
                for target in value.targets().into_iter().rev() {
                    if !visited.contains(&identity(target)) {
                        stack.push(target.clone());
                    }
                }
            }
            canonical.insert(identity(&object), object.clone());
            planned.push(object);
        }

        // Nodes
        for object in &planned {
            let fields = object.fields()?;
            let properties: Properties = fields
                .iter()
                .filter_map(|(name, value)| value.as_value().map(|v| (name.clone(), v.clone())))
                .collect();
            let statement = Statement::create_node(object.class_name(), object.key(), &properties, &[])?;
            verify_created(unit.run(&statement)?.counters, 1, 0)?;
        }

        // Relationships, grouped by anchor node
        let mut edges: BTreeSet<(Identity, String, Identity)> = BTreeSet::new();
        let mut outgoing: BTreeMap<Identity, Vec<Link>> = BTreeMap::new();
        let mut plan_edge = |from: Identity, rel_type: String, to: Identity| {
            if edges.insert((from.clone(), rel_type.clone(), to.clone())) {
                outgoing.entry(from).or_default().push(Link {
                    rel_type,
                    target_label: to.0,
                    target_key: to.1,
                    inverse: None,
                });
            }
        };
        for object in &planned {
            let spec = self.specs.class(object.class_name())?;
            for (name, value) in object.fields()? {
                let Some(reference) = spec.reference(&name) else {
                    continue;
                };
                for target in value.targets() {
                    plan_edge(identity(object), relationship_type(&name), identity(target));
                    if let Some(inverse) = &reference.inverse {
                        plan_edge(identity(target), relationship_type(inverse), identity(object));
                    }
                }
            }
        }
        for ((class, key), links) in &outgoing {
            let statement = Statement::create_relationships(class, key, links)?;
            verify_created(unit.run(&statement)?.counters, 0, links.len())?;
        }

        // In-memory: register new objects, rewire their references to canonical instances
        for object in &planned {
            let spec = self.specs.class(object.class_name())?;
            let members = object.fields()?;
            let mut rewired = Fields::new();
            for (name, value) in &members {
                if spec.reference(name).is_none() {
                    continue;
                }
                let mapped = match value {
                    FieldValue::Mono(t) => {
                        FieldValue::Mono(canonical.get(&identity(t)).cloned().unwrap_or_else(|| t.clone()))
                    }
                    FieldValue::Multi(ts) => FieldValue::Multi(
                        ts.iter()
                            .map(|t| canonical.get(&identity(t)).cloned().unwrap_or_else(|| t.clone()))
                            .collect(),
                    ),
                    FieldValue::Value(v) => FieldValue::Value(v.clone()),
                };
                if !same_instances(value, &mapped) {
                    unit.stage_assign(object.clone(), name, Some(mapped.clone()));
                }
                rewired.insert(name.clone(), mapped);
            }
            unit.stage_insert(object.clone());
            self.stage_inverse_links(unit, spec, object, &rewired)?;
        }

        let added = roots
            .iter()
            .map(|root| canonical.get(&identity(root)).cloned().unwrap_or_else(|| root.clone()))
            .collect();
        Ok((added, planned.len()))
    }
}

/// The key value passed under the generic or the individual key name.
fn key_from_args(spec: &ClassSpec, args: &Fields) -> Result<String, ModelError> {
    let key_name = spec.key_attribute().unwrap_or(GENERIC_KEY);
    match args.get(GENERIC_KEY).or_else(|| args.get(key_name)) {
        Some(FieldValue::Value(Value::Text(key))) => Ok(key.clone()),
        Some(other) => Err(ModelError::TypeMismatch {
            class: spec.name.clone(),
            field: key_name.to_string(),
            expected: "text".to_string(),
            found: other.type_name(),
        }),
        None => Err(ModelError::MissingKey {
            class: spec.name.clone(),
            key_name: key_name.to_string(),
        }),
    }
}

/// Field-for-field comparison. Empty multi-references equal absent ones.
fn same_fields(a: &Fields, b: &Fields) -> bool {
    let significant = |fields: &Fields| -> BTreeMap<String, FieldValue> {
        fields
            .iter()
            .filter(|(_, v)| !matches!(v, FieldValue::Multi(list) if list.is_empty()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    let (a, b) = (significant(a), significant(b));
    a.len() == b.len()
        && a.iter()
            .all(|(name, value)| b.get(name).is_some_and(|other| value.same_content(other)))
}

fn same_instances(a: &FieldValue, b: &FieldValue) -> bool {
    let (a, b) = (a.targets(), b.targets());
    a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| x.ptr_eq(y))
}

/// Drop repeated targets of a multi-reference, keeping the first occurrence.
fn dedup_targets(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Multi(targets) => {
            let mut seen = BTreeSet::new();
            FieldValue::Multi(
                targets
                    .into_iter()
                    .filter(|t| seen.insert(identity(t)))
                    .collect(),
            )
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::spec::{AttributeSpec, AttributeType, ReferenceSpec};

    fn specs() -> SpecRegistry {
        SpecRegistry::from_classes([
            ClassSpec::new("Unit")
                .with_attribute("name", AttributeSpec::key())
                .with_reference("resources", ReferenceSpec::multi("Resource")),
            ClassSpec::new("Resource")
                .with_attribute("name", AttributeSpec::key())
                .with_attribute("density", AttributeSpec::optional(AttributeType::Float))
                .with_reference(
                    "unit_default",
                    ReferenceSpec::mono("Unit").required().with_inverse("resources"),
                ),
        ])
        .expect("valid spec")
    }

    fn fields(pairs: Vec<(&str, FieldValue)>) -> Fields {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn missing_key_is_a_hard_error() {
        let mut db = ModelDb::new(specs(), MemoryGraph::new());
        assert!(matches!(
            db.create_object("Unit", Fields::new()),
            Err(ModelError::MissingKey { .. })
        ));
    }

    #[test]
    fn missing_reference_rolls_back() {
        let graph = MemoryGraph::new();
        let mut db = ModelDb::new(specs(), graph.clone());
        let ghost = db.classes().create_reduced("Unit", "ghost").expect("stub");
        let err = db
            .create_object(
                "Resource",
                fields(vec![("name", FieldValue::from("Iron")), ("unit_default", FieldValue::Mono(ghost))]),
            )
            .expect_err("target missing");
        assert!(matches!(err, ModelError::MissingReference { .. }));
        assert_eq!(graph.stats().expect("stats").node_count, 0);
        assert!(db.register().is_empty());
    }

    #[test]
    fn inverse_member_is_maintained_in_memory() {
        let mut db = ModelDb::new(specs(), MemoryGraph::new());
        let kg = db
            .create_object("Unit", fields(vec![("name", FieldValue::from("kg"))]))
            .expect("unit");
        let iron = db
            .create_object(
                "Resource",
                fields(vec![("name", FieldValue::from("Iron")), ("unit_default", FieldValue::Mono(kg.clone()))]),
            )
            .expect("resource");
        assert_eq!(
            kg.field("resources").expect("borrow"),
            Some(FieldValue::Multi(vec![iron.clone()]))
        );

        let t = db
            .create_object("Unit", fields(vec![("name", FieldValue::from("t"))]))
            .expect("unit");
        db.update_object("Resource", "Iron", fields(vec![("unit_default", FieldValue::Mono(t.clone()))]))
            .expect("update");
        assert_eq!(kg.field("resources").expect("borrow"), Some(FieldValue::Multi(vec![])));
        assert_eq!(
            t.field("resources").expect("borrow"),
            Some(FieldValue::Multi(vec![iron]))
        );
    }

    #[test]
    fn key_mutation_is_rejected() {
        let mut db = ModelDb::new(specs(), MemoryGraph::new());
        db.create_object("Unit", fields(vec![("name", FieldValue::from("kg"))]))
            .expect("unit");
        assert!(matches!(
            db.update_object("Unit", "kg", fields(vec![("name", FieldValue::from("g"))])),
            Err(ModelError::KeyMutation(_))
        ));
        assert!(matches!(
            db.update_object("Unit", "missing", Fields::new()),
            Err(ModelError::NotFound { .. })
        ));
    }

    #[test]
    fn same_fields_ignores_empty_multi() {
        let a = fields(vec![("resources", FieldValue::Multi(vec![]))]);
        assert!(same_fields(&a, &Fields::new()));
        let b = fields(vec![("density", FieldValue::from(1.0))]);
        assert!(!same_fields(&b, &Fields::new()));
    }
}
