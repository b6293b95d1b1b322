//! XML loader for class specifications.
//!
//! ```xml
//! <Entities>
//!   <ModelObject name="Resource" is_abstract="false" extends="Base">
//!     <Attribute type="text" is_key="true">name</Attribute>
//!     <Attribute type="float" required="false" indexed="true">density</Attribute>
//!     <Reference type="Unit" multiplicity="mono" required="true">unit_default</Reference>
//!   </ModelObject>
//! </Entities>
//! ```
//!
//! The element text is the member name. Booleans are `true`/`false`.
//! `<Composite>` types and `<Collection>` members are refused by name.

use super::{AttributeSpec, AttributeType, ClassSpec, Multiplicity, ReferenceSpec};
use crate::ModelError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// A member element whose name (the element text) has not been read yet.
enum PendingMember {
    Attribute(AttributeSpec, String),
    Reference(ReferenceSpec, String),
}

impl PendingMember {
    fn name_mut(&mut self) -> &mut String {
        match self {
            Self::Attribute(_, name) | Self::Reference(_, name) => name,
        }
    }
}

pub(super) fn parse_classes(content: &str) -> Result<Vec<ClassSpec>, ModelError> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut classes = Vec::new();
    let mut saw_root = false;
    let mut current: Option<ClassSpec> = None;
    let mut member: Option<PendingMember> = None;

    loop {
        let position = reader.buffer_position();
        let event = reader
            .read_event()
            .map_err(|e| xml_error(position, &e.to_string()))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"Entities" if !saw_root => saw_root = true,
                b"ModelObject" if saw_root && current.is_none() => {
                    current = Some(class_from(&e)?);
                }
                b"Attribute" if current.is_some() && member.is_none() => {
                    member = Some(PendingMember::Attribute(attribute_from(&e)?, String::new()));
                }
                b"Reference" if current.is_some() && member.is_none() => {
                    member = Some(PendingMember::Reference(reference_from(&e)?, String::new()));
                }
                other => return Err(unexpected(position, other, &e)),
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"Entities" if !saw_root => saw_root = true,
                b"ModelObject" if saw_root && current.is_none() => {
                    classes.push(class_from(&e)?);
                }
                b"Attribute" | b"Reference" => {
                    return Err(xml_error(position, "member element without a name"));
                }
                other => return Err(unexpected(position, other, &e)),
            },
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| xml_error(position, &e.to_string()))?;
                match member.as_mut() {
                    Some(pending) => pending.name_mut().push_str(text.trim()),
                    None => return Err(xml_error(position, "unexpected text content")),
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"Attribute" | b"Reference" => {
                    let (Some(class), Some(pending)) = (current.as_mut(), member.take()) else {
                        return Err(xml_error(position, "unbalanced member element"));
                    };
                    add_member(class, pending)?;
                }
                b"ModelObject" => {
                    let class = current
                        .take()
                        .ok_or_else(|| xml_error(position, "unbalanced ModelObject element"))?;
                    classes.push(class);
                }
                _ => {}
            },
            Event::Eof => break,
            // Declarations, comments, processing instructions.
            _ => {}
        }
    }

    if !saw_root {
        return Err(ModelError::Specification(
            "Missing <Entities> root element".to_string(),
        ));
    }
    if current.is_some() || member.is_some() {
        return Err(ModelError::Specification(
            "Unterminated element at end of document".to_string(),
        ));
    }
    Ok(classes)
}

fn add_member(class: &mut ClassSpec, pending: PendingMember) -> Result<(), ModelError> {
    let (name, duplicate) = match pending {
        PendingMember::Attribute(spec, name) => {
            let duplicate = class.references.contains_key(&name)
                || class.attributes.insert(name.clone(), spec).is_some();
            (name, duplicate)
        }
        PendingMember::Reference(spec, name) => {
            let duplicate = class.attributes.contains_key(&name)
                || class.references.insert(name.clone(), spec).is_some();
            (name, duplicate)
        }
    };
    if name.is_empty() {
        return Err(ModelError::Specification(format!(
            "Class {} has a member without a name",
            class.name
        )));
    }
    if duplicate {
        return Err(ModelError::Specification(format!(
            "Class {} declares member {} twice",
            class.name, name
        )));
    }
    Ok(())
}

fn class_from(element: &BytesStart<'_>) -> Result<ClassSpec, ModelError> {
    let mut name = None;
    let mut is_abstract = false;
    let mut extends = None;
    for (key, value) in attributes(element)? {
        match key.as_str() {
            "name" => name = Some(value),
            "is_abstract" => is_abstract = parse_bool(&key, &value)?,
            "extends" => extends = Some(value),
            _ => return Err(unknown_attribute("ModelObject", &key)),
        }
    }
    let name = name.ok_or_else(|| {
        ModelError::Specification("ModelObject element without a name".to_string())
    })?;
    Ok(ClassSpec {
        is_abstract,
        extends,
        ..ClassSpec::new(name)
    })
}

fn attribute_from(element: &BytesStart<'_>) -> Result<AttributeSpec, ModelError> {
    let mut attr_type = None;
    let mut required = None;
    let mut is_key = false;
    let mut indexed = false;
    for (key, value) in attributes(element)? {
        match key.as_str() {
            "type" => {
                attr_type = Some(AttributeType::parse(&value).ok_or_else(|| {
                    ModelError::Specification(format!("Unknown attribute type {value}"))
                })?);
            }
            "required" => required = Some(parse_bool(&key, &value)?),
            "is_key" => is_key = parse_bool(&key, &value)?,
            "indexed" => indexed = parse_bool(&key, &value)?,
            _ => return Err(unknown_attribute("Attribute", &key)),
        }
    }
    let attr_type = attr_type
        .ok_or_else(|| ModelError::Specification("Attribute element without a type".to_string()))?;
    Ok(AttributeSpec {
        attr_type,
        required: required.unwrap_or(is_key),
        is_key,
        indexed,
    })
}

fn reference_from(element: &BytesStart<'_>) -> Result<ReferenceSpec, ModelError> {
    let mut target = None;
    let mut multiplicity = Multiplicity::Mono;
    let mut required = false;
    let mut inverse = None;
    for (key, value) in attributes(element)? {
        match key.as_str() {
            "type" => target = Some(value),
            "multiplicity" => {
                multiplicity = Multiplicity::parse(&value).ok_or_else(|| {
                    ModelError::Specification(format!("Unknown multiplicity {value}"))
                })?;
            }
            "required" => required = parse_bool(&key, &value)?,
            "inverse" => inverse = Some(value),
            _ => return Err(unknown_attribute("Reference", &key)),
        }
    }
    let target = target
        .ok_or_else(|| ModelError::Specification("Reference element without a type".to_string()))?;
    Ok(ReferenceSpec {
        target,
        multiplicity,
        required,
        inverse,
    })
}

fn attributes(element: &BytesStart<'_>) -> Result<Vec<(String, String)>, ModelError> {
    element
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| ModelError::Specification(format!("XML attribute: {e}")))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| ModelError::Specification(format!("XML attribute {key}: {e}")))?
                .into_owned();
            Ok((key, value))
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ModelError> {
    match value {
        "true" | "True" | "1" => Ok(true),
        "false" | "False" | "0" => Ok(false),
        _ => Err(ModelError::Specification(format!(
            "{key} must be true or false, got {value}"
        ))),
    }
}

fn unknown_attribute(element: &str, key: &str) -> ModelError {
    ModelError::Specification(format!("Unexpected attribute {key} on <{element}>"))
}

fn unexpected(position: usize, name: &[u8], element: &BytesStart<'_>) -> ModelError {
    let named = attributes(element)
        .ok()
        .and_then(|attrs| attrs.into_iter().find(|(key, _)| key == "name"))
        .map(|(_, value)| format!(" {value}"))
        .unwrap_or_default();
    let message = match name {
        b"Composite" => format!(
            "<Composite{named}> types are not supported, declare a ModelObject instead"
        ),
        b"Collection" => format!(
            "<Collection{named}> members are not supported, use a Reference with multiplicity=\"multi\""
        ),
        other => format!("unexpected element <{}>", String::from_utf8_lossy(other)),
    };
    xml_error(position, &message)
}

fn xml_error(position: usize, message: &str) -> ModelError {
    ModelError::Specification(format!("XML error at byte {position}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::super::SpecRegistry;
    use super::*;

    const TRANSMISSION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Entities>
  <!-- units and resources -->
  <ModelObject name="Named" is_abstract="true">
    <Attribute type="datetime">active_from</Attribute>
  </ModelObject>
  <ModelObject name="Unit" extends="Named">
    <Attribute type="text" is_key="true">name</Attribute>
  </ModelObject>
  <ModelObject name="Resource" extends="Named">
    <Attribute type="text" is_key="true">name</Attribute>
    <Attribute type="float" indexed="true">density</Attribute>
    <Reference type="Unit" multiplicity="mono" required="true">unit_default</Reference>
    <Reference type="Conduit" multiplicity="multi" inverse="resource">conduits</Reference>
  </ModelObject>
  <ModelObject name="Conduit">
    <Attribute type="text" is_key="true">code</Attribute>
    <Attribute type="pos_geo">location</Attribute>
    <Reference type="Resource" inverse="conduits">resource</Reference>
  </ModelObject>
</Entities>"#;

    #[test]
    fn parses_classes_and_members() {
        let classes = parse_classes(TRANSMISSION).expect("parse");
        let names: Vec<_> = classes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Named", "Unit", "Resource", "Conduit"]);

        let resource = &classes[2];
        assert_eq!(resource.extends.as_deref(), Some("Named"));
        assert_eq!(resource.key_attribute(), Some("name"));
        let density = &resource.attributes["density"];
        assert_eq!(density.attr_type, AttributeType::Float);
        assert!(density.indexed);
        assert!(!density.required);
        assert!(resource.attributes["name"].required);
        let conduits = &resource.references["conduits"];
        assert!(conduits.is_multi());
        assert_eq!(conduits.inverse.as_deref(), Some("resource"));
    }

    #[test]
    fn registry_from_xml() {
        let registry = SpecRegistry::from_xml_str(TRANSMISSION).expect("registry");
        assert_eq!(
            registry.get_attributes("Resource", true).expect("attrs"),
            vec!["active_from", "key", "density"]
        );
        assert_eq!(registry.indexes().len(), 1);
        assert_eq!(registry.indexes()[0].attribute, "density");
        assert!(!registry.is_concrete("Named"));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(parse_classes("<Entities><ModelObject name=\"A\">").is_err());
        assert!(parse_classes("<Other/>").is_err());
        assert!(parse_classes("").is_err());
        assert!(parse_classes(
            "<Entities><ModelObject name=\"A\"><Attribute type=\"blob\">x</Attribute></ModelObject></Entities>"
        )
        .is_err());
        assert!(parse_classes(
            "<Entities><ModelObject name=\"A\" colour=\"red\"/></Entities>"
        )
        .is_err());
        assert!(parse_classes(
            "<Entities><ModelObject name=\"A\"><Attribute type=\"text\" is_key=\"true\">n</Attribute><Attribute type=\"int\">n</Attribute></ModelObject></Entities>"
        )
        .is_err());
    }

    #[test]
    fn composites_and_collections_are_named_in_the_error() {
        let composite = r#"<Entities>
            <ModelObject name="Unit"><Attribute type="text" is_key="true">name</Attribute></ModelObject>
            <Composite name="Address"><Attribute type="text">street</Attribute></Composite>
        </Entities>"#;
        let Err(ModelError::Specification(message)) = parse_classes(composite) else {
            unreachable!("composite must be refused");
        };
        assert!(message.contains("<Composite Address> types are not supported"), "{message}");

        let collection = r#"<Entities><ModelObject name="Unit">
            <Attribute type="text" is_key="true">name</Attribute>
            <Collection type="Address">addresses</Collection>
        </ModelObject></Entities>"#;
        let Err(ModelError::Specification(message)) = parse_classes(collection) else {
            unreachable!("collection must be refused");
        };
        assert!(message.contains("<Collection> members are not supported"), "{message}");

        let empty = r#"<Entities><Composite name="Point"/></Entities>"#;
        assert!(matches!(
            parse_classes(empty),
            Err(ModelError::Specification(message)) if message.contains("<Composite Point>")
        ));
        assert!(matches!(
            parse_classes("<Entities><Widget/></Entities>"),
            Err(ModelError::Specification(message)) if message.contains("unexpected element <Widget>")
        ));
    }

    #[test]
    fn failed_reload_keeps_previous_set() {
        let mut registry = SpecRegistry::from_xml_str(TRANSMISSION).expect("registry");
        let broken = r#"<Entities><ModelObject name="Orphan">
            <Attribute type="text" is_key="true">name</Attribute>
            <Reference type="Missing">other</Reference>
        </ModelObject></Entities>"#;
        assert!(registry.reload_from_str(broken).is_err());
        assert!(registry.contains("Resource"));
        assert!(!registry.contains("Orphan"));

        let replacement = r#"<Entities><ModelObject name="Unit">
            <Attribute type="text" is_key="true">symbol</Attribute>
        </ModelObject></Entities>"#;
        registry.reload_from_str(replacement).expect("reload");
        assert!(!registry.contains("Resource"));
        assert_eq!(registry.get_key_attribute("Unit").expect("key"), "symbol");
    }
}
