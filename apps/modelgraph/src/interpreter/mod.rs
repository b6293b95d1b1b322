//! # Command Interpreter
//!
//! Line-oriented façade over [`ModelDb`]. Each line is one command; an
//! optional leading `>` is ignored.
//!
//! | Command | Effect |
//! |---------|--------|
//! | `get <Class> [member=value ...] [as <name>]` | Find objects, bind them in scope |
//! | `create <Class> member=value ...` | Persist a new object |
//! | `new <Class> member=value ... as <name>` | Build an object in memory only |
//! | `add <name>` | Persist a scope object or list |
//! | `update <Class> <key> member=value ...` | Change members of a stored object |
//! | `delete <Class> <key> ...` | Remove stored objects |
//! | `clone <Class> <key> <new_key>` | Copy an object under a new key |
//! | `show <name>\|@Class.key` | Render an object |
//!
//! Values are `@Class.key`, `$name`, `[a, b]`, quoted text, or scalars
//! parsed by the declared attribute type. A bare value for a reference is
//! the key of an object of the reference's target class.

pub mod response;
mod syntax;

pub use response::{ObjectEntry, Response, ScopeEntry, ScopeKind, Snapshot, render};

use crate::interpreter::response::describe;
use crate::interpreter::syntax::{Expr, parse_expr, parse_scalar, split_assignment, tokenize};
use modelgraph_core::{ClassSpec, FieldValue, Fields, GraphDriver, ModelDb, ModelError, ObjectRef, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Synopsis and description of every command, in help order.
const COMMANDS: [(&str, &str, &str); 9] = [
    ("help", "help [command]", "Show the command list or the usage of one command."),
    (
        "get",
        "get <Class> [member=value ...] [as <name>] | get <Class> -help",
        "Find objects by attribute, reference or key and bind the result in scope. \
         One match binds the object, several bind a list. Unnamed results are \
         bound as result1, result2, ...",
    ),
    (
        "create",
        "create <Class> member=value ... | create <Class> -help",
        "Create and persist an object. An existing key returns the stored object unchanged.",
    ),
    (
        "new",
        "new <Class> member=value ... as <name>",
        "Build an object in memory without persisting it. Use add to persist.",
    ),
    (
        "add",
        "add <name>",
        "Persist the object or list bound to a scope name, with everything it references.",
    ),
    (
        "update",
        "update <Class> <key> member=value ...",
        "Change attributes and references of a stored object. The key cannot change.",
    ),
    ("delete", "delete <Class> <key> [<key> ...]", "Delete objects and their relationships."),
    (
        "clone",
        "clone <Class> <key> <new_key>",
        "Copy all members of an object to a new object with another key.",
    ),
    ("show", "show <name> | show @Class.key", "Render a scope value or a stored object."),
];

/// A value bound to a scope name.
#[derive(Debug, Clone)]
pub enum ScopeValue {
    Object(ObjectRef),
    List(Vec<ObjectRef>),
}

impl ScopeValue {
    #[must_use]
    pub fn objects(&self) -> Vec<&ObjectRef> {
        match self {
            Self::Object(object) => vec![object],
            Self::List(objects) => objects.iter().collect(),
        }
    }
}

/// Stateful command session over one engine.
pub struct Interpreter<D: GraphDriver> {
    db: ModelDb<D>,
    scope: BTreeMap<String, ScopeValue>,
    generated: usize,
}

impl<D: GraphDriver> std::fmt::Debug for Interpreter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("scope", &self.scope.keys().collect::<Vec<_>>())
            .field("registered", &self.db.register().len())
            .finish()
    }
}

fn invalid(message: impl Into<String>) -> ModelError {
    ModelError::InvalidCommand(message.into())
}

impl<D: GraphDriver> Interpreter<D> {
    #[must_use]
    pub fn new(db: ModelDb<D>) -> Self {
        Self {
            db,
            scope: BTreeMap::new(),
            generated: 0,
        }
    }

    pub fn db(&self) -> &ModelDb<D> {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut ModelDb<D> {
        &mut self.db
    }

    pub fn scope(&self) -> &BTreeMap<String, ScopeValue> {
        &self.scope
    }

    pub fn lookup(&self, name: &str) -> Option<&ScopeValue> {
        self.scope.get(name.strip_prefix('$').unwrap_or(name))
    }

    /// Run one command. Failures become a response with `ok == false`.
    pub fn process(&mut self, line: &str) -> Response {
        let (ok, result) = match self.execute(line) {
            Ok(message) => (true, message),
            Err(e) => {
                tracing::warn!(command = line.trim(), error = %e, "Command failed");
                (false, e.to_string())
            }
        };
        Response {
            ok,
            result,
            objects: self.snapshot(),
        }
    }

    /// Run one command and return its message.
    pub fn execute(&mut self, line: &str) -> Result<String, ModelError> {
        let line = line.trim();
        let line = line.strip_prefix('>').unwrap_or(line).trim();
        let tokens = tokenize(line)?;
        let Some((command, args)) = tokens.split_first() else {
            return Err(invalid("Empty command"));
        };
        tracing::debug!(command = %command, args = args.len(), "Executing command");

        match command.as_str() {
            "help" => help(args),
            "get" => self.get(args),
            "create" => self.create(args),
            "new" => self.new_object(args),
            "add" => self.add(args),
            "update" => self.update(args),
            "delete" => self.delete(args),
            "clone" => self.clone_object(args),
            "show" => self.show(args),
            other => Err(invalid(format!(
                "Unknown command '{other}'. Type 'help' for a list of commands."
            ))),
        }
    }

    /// Current register and scope contents.
    pub fn snapshot(&self) -> Snapshot {
        let model_objects = self
            .db
            .register()
            .iter()
            .filter(|(_, register)| !register.is_empty())
            .map(|(class, register)| {
                let entries = register
                    .iter()
                    .map(|(key, object)| ObjectEntry {
                        name: key.clone(),
                        content: describe(object),
                    })
                    .collect();
                (class.to_string(), entries)
            })
            .collect();
        let scope = self
            .scope
            .iter()
            .map(|(name, value)| ScopeEntry {
                name: name.clone(),
                kind: match value {
                    ScopeValue::Object(_) => ScopeKind::Object,
                    ScopeValue::List(_) => ScopeKind::List,
                },
                content: value.objects().into_iter().map(describe).collect(),
            })
            .collect();
        Snapshot { model_objects, scope }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn get(&mut self, args: &[String]) -> Result<String, ModelError> {
        let (class, rest) = class_and_rest(args, "get")?;
        if is_help(rest) {
            return self.class_help(class);
        }
        let (filters, alias) = split_alias(rest)?;
        let filters = self.assignments(class, filters, true)?;
        let found = self.db.find_objects(class, &filters, false)?;
        if found.is_empty() {
            return Ok(format!("No objects of type {class} found matching the criteria."));
        }

        let name = match alias {
            Some(name) => name.to_string(),
            None => self.generated_name(),
        };
        let (value, message) = match <[ObjectRef; 1]>::try_from(found) {
            Ok([object]) => (
                ScopeValue::Object(object),
                format!("Object of type {class} added as {name}."),
            ),
            Err(found) => {
                let message = format!("{} objects of type {class} added to {name}.", found.len());
                (ScopeValue::List(found), message)
            }
        };
        self.scope.insert(name, value);
        Ok(message)
    }

    fn create(&mut self, args: &[String]) -> Result<String, ModelError> {
        let (class, rest) = class_and_rest(args, "create")?;
        if rest.is_empty() || is_help(rest) {
            return self.class_help(class);
        }
        let fields = self.assignments(class, rest, false)?;
        let object = self.db.create_object(class, fields)?;
        render(&object)
    }

    fn new_object(&mut self, args: &[String]) -> Result<String, ModelError> {
        let (class, rest) = class_and_rest(args, "new")?;
        let (assignments, Some(name)) = split_alias(rest)? else {
            return Err(invalid("new requires a name: new <Class> member=value ... as <name>"));
        };
        let fields = self.assignments(class, assignments, false)?;
        let object = self.db.construct_object(class, fields)?;
        let message = format!("Object {object} stored as {name}.");
        self.scope.insert(name.to_string(), ScopeValue::Object(object));
        Ok(message)
    }

    fn add(&mut self, args: &[String]) -> Result<String, ModelError> {
        let [name] = args else {
            return Err(invalid("Usage: add <name>"));
        };
        let name = name.strip_prefix('$').unwrap_or(name);
        let value = self.scope_value(name)?;
        match value {
            ScopeValue::Object(object) => {
                let added = self.db.add_object(&object)?;
                let message = format!("Object {added} added successfully.");
                self.scope.insert(name.to_string(), ScopeValue::Object(added));
                Ok(message)
            }
            ScopeValue::List(objects) => {
                let added = self.db.add_multiple_objects(&objects)?;
                let message = format!("All {} objects added successfully.", added.len());
                self.scope.insert(name.to_string(), ScopeValue::List(added));
                Ok(message)
            }
        }
    }

    fn update(&mut self, args: &[String]) -> Result<String, ModelError> {
        let [class, key, rest @ ..] = args else {
            return Err(invalid("Usage: update <Class> <key> member=value ..."));
        };
        if rest.is_empty() {
            return Err(invalid(format!("Nothing to update for {class} {key}")));
        }
        let fields = self.assignments(class, rest, false)?;
        let object = self.db.update_object(class, key, fields)?;
        Ok(format!("Updated {}", render(&object)?))
    }

    fn delete(&mut self, args: &[String]) -> Result<String, ModelError> {
        let [class, keys @ ..] = args else {
            return Err(invalid("Usage: delete <Class> <key> [<key> ...]"));
        };
        match keys {
            [] => Err(invalid("Usage: delete <Class> <key> [<key> ...]")),
            [key] => {
                self.db.delete_object(class, key)?;
                Ok(format!("Object {class} {key} deleted."))
            }
            keys => {
                let targets: Vec<(&str, &str)> = keys.iter().map(|key| (class.as_str(), key.as_str())).collect();
                self.db.delete_multiple_objects(&targets)?;
                Ok(format!("{} objects of type {class} deleted.", targets.len()))
            }
        }
    }

    fn clone_object(&mut self, args: &[String]) -> Result<String, ModelError> {
        let [class, key, new_key] = args else {
            return Err(invalid("Usage: clone <Class> <key> <new_key>"));
        };
        let object = self.db.clone_object(class, key, new_key)?;
        Ok(format!("Cloned {class} {key} as {}", render(&object)?))
    }

    fn show(&mut self, args: &[String]) -> Result<String, ModelError> {
        let [target] = args else {
            return Err(invalid("Usage: show <name> | show @Class.key"));
        };
        if target.starts_with('@') {
            let Expr::Object { class, key } = parse_expr(target)? else {
                return Err(invalid(format!("Expected @Class.key, got '{target}'")));
            };
            let object = self.load(&class, &key, false)?;
            return render(&object);
        }
        let value = self.scope_value(target.strip_prefix('$').unwrap_or(target))?;
        let lines = value
            .objects()
            .into_iter()
            .map(render)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines.join("\n"))
    }

    fn class_help(&self, class: &str) -> Result<String, ModelError> {
        let lines = self.db.specs().variable_summary(class)?;
        Ok(format!("{class}:\n  {}", lines.join("\n  ")))
    }

    // =========================================================================
    // VALUES
    // =========================================================================

    /// Bind `member=value` tokens against the members of `class`.
    ///
    /// In filter mode a bare reference value stays a key, so no lookup of
    /// the target happens.
    fn assignments(&mut self, class: &str, tokens: &[String], filter: bool) -> Result<Fields, ModelError> {
        let spec = Arc::clone(self.db.specs().class(class)?);
        let mut fields = Fields::new();
        for token in tokens {
            let (member, raw) = split_assignment(token)?;
            let value = self.member_value(&spec, member, raw, filter)?;
            if fields.insert(member.to_string(), value).is_some() {
                return Err(invalid(format!("Member '{member}' given more than once")));
            }
        }
        Ok(fields)
    }

    fn member_value(
        &mut self,
        spec: &ClassSpec,
        member: &str,
        raw: &str,
        filter: bool,
    ) -> Result<FieldValue, ModelError> {
        let expr = parse_expr(raw)?;
        if let Some(attribute) = spec.attribute(member) {
            let (Expr::Bare(text) | Expr::Quoted(text)) = expr else {
                return Err(invalid(format!(
                    "{}.{member} expects a {} value, got '{raw}'",
                    spec.name,
                    attribute.attr_type.name()
                )));
            };
            return parse_scalar(attribute.attr_type, &text).map(FieldValue::Value);
        }

        let Some(reference) = spec.reference(member) else {
            return Err(ModelError::UnknownMember {
                class: spec.name.clone(),
                member: member.to_string(),
            });
        };
        if filter && let Expr::Bare(key) | Expr::Quoted(key) = &expr {
            return Ok(FieldValue::Value(Value::Text(key.clone())));
        }

        let mut targets = Vec::new();
        self.collect_targets(&reference.target, expr, &mut targets)?;
        if reference.is_multi() {
            return Ok(FieldValue::Multi(targets));
        }
        match <[ObjectRef; 1]>::try_from(targets) {
            Ok([target]) => Ok(FieldValue::Mono(target)),
            Err(targets) => Err(invalid(format!(
                "{}.{member} takes one object, got {}",
                spec.name,
                targets.len()
            ))),
        }
    }

    fn collect_targets(&mut self, target: &str, expr: Expr, out: &mut Vec<ObjectRef>) -> Result<(), ModelError> {
        match expr {
            Expr::Object { class, key } => out.push(self.load(&class, &key, true)?),
            Expr::Variable(name) => match self.scope_value(&name)? {
                ScopeValue::Object(object) => out.push(object),
                ScopeValue::List(objects) => out.extend(objects),
            },
            Expr::List(items) => {
                for item in items {
                    self.collect_targets(target, item, out)?;
                }
            }
            Expr::Bare(key) | Expr::Quoted(key) => out.push(self.load(target, &key, true)?),
        }
        Ok(())
    }

    fn load(&mut self, class: &str, key: &str, reduced: bool) -> Result<ObjectRef, ModelError> {
        self.db
            .get_object(class, key, reduced)?
            .ok_or_else(|| ModelError::NotFound {
                class: class.to_string(),
                key: key.to_string(),
            })
    }

    fn scope_value(&self, name: &str) -> Result<ScopeValue, ModelError> {
        self.scope
            .get(name)
            .cloned()
            .ok_or_else(|| invalid(format!("No object or list named '{name}' in scope")))
    }

    fn generated_name(&mut self) -> String {
        loop {
            self.generated += 1;
            let name = format!("result{}", self.generated);
            if !self.scope.contains_key(&name) {
                return name;
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn help(args: &[String]) -> Result<String, ModelError> {
    match args {
        [] => {
            let mut text = String::from("Available commands:\n");
            for (_, synopsis, _) in COMMANDS {
                text.push_str("  ");
                text.push_str(synopsis);
                text.push('\n');
            }
            text.push_str(
                "Values: @Class.key, $name, [a, b], \"quoted text\", or plain scalars.",
            );
            Ok(text)
        }
        [topic] => COMMANDS
            .iter()
            .find(|(name, _, _)| name == topic)
            .map(|(_, synopsis, description)| format!("{synopsis}\n  {description}"))
            .ok_or_else(|| {
                invalid(format!(
                    "Unknown command '{topic}'. Type 'help' for a list of commands."
                ))
            }),
        _ => Err(invalid("Usage: help [command]")),
    }
}

fn class_and_rest<'a>(args: &'a [String], command: &str) -> Result<(&'a str, &'a [String]), ModelError> {
    match args.split_first() {
        Some((class, rest)) => Ok((class.as_str(), rest)),
        None => Err(invalid(format!(
            "Please specify the class name. Type 'help {command}' for usage."
        ))),
    }
}

fn is_help(rest: &[String]) -> bool {
    rest.first().is_some_and(|t| t == "-help")
}

/// Split off a trailing `as <name>`.
fn split_alias(args: &[String]) -> Result<(&[String], Option<&str>), ModelError> {
    let Some(position) = args.iter().position(|t| t == "as") else {
        return Ok((args, None));
    };
    match &args[position + 1..] {
        [name] if is_identifier(name) => Ok((&args[..position], Some(name.as_str()))),
        [name] => Err(invalid(format!("'{name}' is not a valid name"))),
        [] => Err(invalid("Expected a name after 'as'")),
        _ => Err(invalid("Unexpected input after the name")),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
