//! Typed document registry with schema migrations.
//!
//! A [`DocumentRegistry`] maps a *tag* stored in every document (under a reserved top-level
//! field, `$type` by default) to a Rust document type. Each tag names one schema version and
//! is permanent: tags are never reused or removed.
//!
//! Older schema versions are upgraded on read through a linear chain of migration functions.
//! Every tag has at most one outgoing edge, so decoding a document always follows a single,
//! deterministic path to the newest type.
//!
//! # Example
//!
//! ```ignore
//! use settee::registry::DocumentRegistry;
//!
//! let mut registry = DocumentRegistry::new();
//! registry.register::<AncientFoo>("Foo1")?;
//! registry.register::<OldFoo>("Foo2")?;
//! registry.register::<Foo>("Foo3")?;
//!
//! registry.register_migration(|old: AncientFoo| OldFoo { bar: old.bar.to_lowercase() })?;
//! registry.register_migration(|old: OldFoo| Foo { bar: title_case(&old.bar) })?;
//!
//! // A body tagged "Foo1" now decodes to a `Foo`.
//! ```
//!
//! The registry is built with `&mut self` and then shared immutably (typically behind an
//! `Arc`) by every session that reads or writes these documents.

use serde_json::{Map, Value};
use std::{
    any::{TypeId, type_name},
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
};
use tracing::trace;

use crate::{
    codec::{Loader, into_object},
    document::{AnyDocument, Document, DocumentExt, DocumentValue, TaggedDocument},
    error::{CouchError, CouchResult},
};

/// Field the type tag is stored under unless configured otherwise.
pub const DEFAULT_TAG_FIELD: &str = "$type";

type DecodeFn = fn(Value) -> CouchResult<Box<dyn AnyDocument>>;
type MigrateFn =
    Box<dyn Fn(Box<dyn AnyDocument>) -> CouchResult<Box<dyn AnyDocument>> + Send + Sync>;

fn decode_as<D: Document>(value: Value) -> CouchResult<Box<dyn AnyDocument>> {
    Ok(Box::new(D::from_json(value)?))
}

struct RegistryEntry {
    type_name: &'static str,
    decode: DecodeFn,
}

struct MigrationEdge {
    to: String,
    migrate: MigrateFn,
}

/// Maps stored type tags to document types and upgrades old documents on read.
pub struct DocumentRegistry {
    tag_field: String,
    entries: HashMap<String, RegistryEntry>,
    tags: HashMap<TypeId, String>,
    supertypes: HashMap<TypeId, Vec<TypeId>>,
    type_names: HashMap<TypeId, &'static str>,
    migrations: HashMap<String, MigrationEdge>,
}

impl DocumentRegistry {
    /// Creates an empty registry storing tags under [`DEFAULT_TAG_FIELD`].
    pub fn new() -> Self {
        Self {
            tag_field: DEFAULT_TAG_FIELD.to_string(),
            entries: HashMap::new(),
            tags: HashMap::new(),
            supertypes: HashMap::new(),
            type_names: HashMap::new(),
            migrations: HashMap::new(),
        }
    }

    /// Creates an empty registry storing tags under `field`.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::InvalidTag`] if the field name is malformed or starts with `_`,
    /// which CouchDB reserves for its own metadata.
    pub fn with_tag_field(field: &str) -> CouchResult<Self> {
        validate_tag(field)?;
        if field.starts_with('_') {
            return Err(CouchError::InvalidTag(format!(
                "tag field '{field}' collides with reserved storage fields"
            )));
        }

        Ok(Self {
            tag_field: field.to_string(),
            ..Self::new()
        })
    }

    /// Returns the name of the field tags are stored under.
    pub fn tag_field(&self) -> &str {
        &self.tag_field
    }

    /// Returns the number of registered tags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers `D` as the type stored under `tag`.
    ///
    /// # Errors
    ///
    /// - [`CouchError::InvalidTag`] if the tag is empty or malformed
    /// - [`CouchError::DuplicateTag`] if the tag is already registered
    /// - [`CouchError::AmbiguousType`] if `D` is already registered under another tag
    pub fn register<D: Document>(&mut self, tag: &str) -> CouchResult<()> {
        validate_tag(tag)?;

        if self.entries.contains_key(tag) {
            return Err(CouchError::DuplicateTag(tag.to_string()));
        }

        let type_id = TypeId::of::<D>();
        if let Some(existing) = self.tags.get(&type_id) {
            return Err(CouchError::AmbiguousType(
                type_name::<D>(),
                vec![existing.clone(), tag.to_string()],
            ));
        }

        self.entries.insert(
            tag.to_string(),
            RegistryEntry {
                type_name: type_name::<D>(),
                decode: decode_as::<D>,
            },
        );
        self.tags.insert(type_id, tag.to_string());
        self.type_names.insert(type_id, type_name::<D>());

        Ok(())
    }

    /// Registers a [`TaggedDocument`] under its compile-time tag.
    pub fn register_tagged<D: TaggedDocument>(&mut self) -> CouchResult<()> {
        self.register::<D>(D::TAG)
    }

    /// Declares that `S` *is a* `P`: an unregistered `S` is encoded under `P`'s tag.
    ///
    /// `P` must be registered or itself declared as a subtype. When a type reaches several
    /// registered ancestors the declaration is rejected.
    ///
    /// # Errors
    ///
    /// - [`CouchError::UnknownType`] if `P` is unknown
    /// - [`CouchError::AmbiguousType`] if the declaration makes any type resolve to more than
    ///   one tag
    pub fn register_subtype<S: Document, P: Document>(&mut self) -> CouchResult<()> {
        let sub = TypeId::of::<S>();
        let parent = TypeId::of::<P>();

        if !self.tags.contains_key(&parent) && !self.supertypes.contains_key(&parent) {
            return Err(CouchError::UnknownType(type_name::<P>()));
        }
        if sub == parent {
            return Ok(());
        }

        let parents = self.supertypes.entry(sub).or_default();
        if parents.contains(&parent) {
            return Ok(());
        }
        parents.push(parent);
        self.type_names.insert(sub, type_name::<S>());

        let subtypes = self
            .supertypes
            .keys()
            .filter(|type_id| !self.tags.contains_key(type_id))
            .copied()
            .collect::<Vec<_>>();

        for type_id in subtypes {
            if let Err(err) = self.resolve_tag(type_id).map(|_| ()) {
                if let Some(parents) = self.supertypes.get_mut(&sub) {
                    parents.retain(|p| *p != parent);
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Registers the upgrade from `A` to `B`.
    ///
    /// # Errors
    ///
    /// - [`CouchError::UnknownType`] if either type is not registered
    /// - [`CouchError::NonLinearMigration`] if `A`'s tag already migrates somewhere
    /// - [`CouchError::MigrationCycle`] if the edge would close a cycle
    pub fn register_migration<A, B, F>(&mut self, migrate: F) -> CouchResult<()>
    where
        A: Document,
        B: Document,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let from = self
            .tags
            .get(&TypeId::of::<A>())
            .cloned()
            .ok_or(CouchError::UnknownType(type_name::<A>()))?;
        let to = self
            .tags
            .get(&TypeId::of::<B>())
            .cloned()
            .ok_or(CouchError::UnknownType(type_name::<B>()))?;

        if let Some(existing) = self.migrations.get(&from) {
            return Err(CouchError::NonLinearMigration(from, existing.to.clone()));
        }

        let mut cursor = Some(to.as_str());
        while let Some(tag) = cursor {
            if tag == from {
                return Err(CouchError::MigrationCycle(from));
            }
            cursor = self.migrations.get(tag).map(|edge| edge.to.as_str());
        }

        self.migrations.insert(
            from,
            MigrationEdge {
                to,
                migrate: Box::new(move |doc: Box<dyn AnyDocument>| -> CouchResult<Box<dyn AnyDocument>> {
                    let old = A::from_any_document(doc)?;
                    Ok(Box::new(migrate(old)) as Box<dyn AnyDocument>)
                }),
            },
        );

        Ok(())
    }

    /// Returns the tag `D` is encoded under.
    pub fn tag_of<D: Document>(&self) -> CouchResult<&str> {
        self.type_names
            .get(&TypeId::of::<D>())
            .map_or(Err(CouchError::UnregisteredType(type_name::<D>())), |_| {
                self.resolve_tag(TypeId::of::<D>())
            })
    }

    /// Returns the tag a migration chain starting at `tag` ends on.
    pub fn latest_tag<'a>(&'a self, tag: &'a str) -> CouchResult<&'a str> {
        let mut current = tag;
        for _ in 0..=self.entries.len() {
            match self.migrations.get(current) {
                Some(edge) => current = &edge.to,
                None => return Ok(current),
            }
        }

        Err(CouchError::MigrationCycle(tag.to_string()))
    }

    fn resolve_tag(&self, type_id: TypeId) -> CouchResult<&str> {
        if let Some(tag) = self.tags.get(&type_id) {
            return Ok(tag);
        }

        let name = self
            .type_names
            .get(&type_id)
            .copied()
            .unwrap_or("<unknown>");

        let mut found = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut queue = self
            .supertypes
            .get(&type_id)
            .cloned()
            .map(VecDeque::from)
            .unwrap_or_default();

        while let Some(candidate) = queue.pop_front() {
            if !visited.insert(candidate) {
                continue;
            }
            match self.tags.get(&candidate) {
                Some(tag) => {
                    found.insert(tag.as_str());
                }
                None => queue.extend(
                    self.supertypes
                        .get(&candidate)
                        .into_iter()
                        .flatten()
                        .copied(),
                ),
            }
        }

        let mut found = found.into_iter();
        match (found.next(), found.next()) {
            (None, _) => Err(CouchError::UnregisteredType(name)),
            (Some(tag), None) => Ok(tag),
            (Some(first), Some(second)) => Err(CouchError::AmbiguousType(
                name,
                [first, second]
                    .into_iter()
                    .chain(found)
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }

    fn tag_for(&self, doc: &dyn AnyDocument) -> CouchResult<&str> {
        let type_id = doc.as_any().type_id();

        if !self.type_names.contains_key(&type_id) {
            return Err(CouchError::UnregisteredType(doc.type_name()));
        }

        self.resolve_tag(type_id)
    }

    /// Decodes content stored under `tag` and upgrades it to the newest type in its chain.
    ///
    /// # Errors
    ///
    /// - [`CouchError::UnknownTag`] if no type is registered for `tag`
    /// - [`CouchError::MigrationCycle`] if the chain does not end within as many steps as
    ///   there are registered tags
    /// - serialization errors if the content does not match the registered type
    pub fn decode(&self, tag: &str, body: Map<String, Value>) -> CouchResult<Box<dyn AnyDocument>> {
        let entry = self
            .entries
            .get(tag)
            .ok_or_else(|| CouchError::UnknownTag(tag.to_string()))?;

        let mut doc = (entry.decode)(Value::Object(body))?;
        let mut current = tag;

        for _ in 0..=self.entries.len() {
            let Some(edge) = self.migrations.get(current) else {
                return Ok(doc);
            };

            trace!(from = current, to = %edge.to, "migrating document");
            doc = (edge.migrate)(doc)?;
            current = self.tag_for(&*doc)?;
        }

        Err(CouchError::MigrationCycle(tag.to_string()))
    }

    /// Serializes a document and stamps its tag onto the result.
    ///
    /// # Errors
    ///
    /// - [`CouchError::UnregisteredType`] / [`CouchError::AmbiguousType`] if the document's
    ///   type does not resolve to exactly one tag
    /// - [`CouchError::InvalidDocument`] if the document is not an object or already uses the
    ///   tag field
    pub fn encode(&self, doc: &dyn AnyDocument) -> CouchResult<Map<String, Value>> {
        let tag = self.tag_for(doc)?;
        let mut body = into_object(doc.to_any_json()?)?;

        if body.contains_key(&self.tag_field) {
            return Err(CouchError::InvalidDocument(format!(
                "Field '{}' is reserved for the document tag",
                self.tag_field
            )));
        }
        body.insert(self.tag_field.clone(), Value::String(tag.to_string()));

        Ok(body)
    }
}

impl Loader for DocumentRegistry {
    fn load(&self, mut body: Map<String, Value>) -> CouchResult<Box<dyn AnyDocument>> {
        match body.remove(&self.tag_field) {
            Some(Value::String(tag)) => self.decode(&tag, body),
            _ => Err(CouchError::UntaggedDocument(self.tag_field.clone())),
        }
    }

    fn dump(&self, doc: &dyn AnyDocument) -> CouchResult<Map<String, Value>> {
        self.encode(doc)
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("tag_field", &self.tag_field)
            .field(
                "entries",
                &self
                    .entries
                    .iter()
                    .map(|(tag, entry)| (tag.as_str(), entry.type_name))
                    .collect::<HashMap<_, _>>(),
            )
            .field(
                "migrations",
                &self
                    .migrations
                    .iter()
                    .map(|(from, edge)| (from.as_str(), edge.to.as_str()))
                    .collect::<HashMap<_, _>>(),
            )
            .finish()
    }
}

fn validate_tag(tag: &str) -> CouchResult<()> {
    if tag.is_empty() || tag.trim() != tag || tag.chars().any(char::is_control) {
        return Err(CouchError::InvalidTag(format!("{tag:?}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AncientFoo {
        bar: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OldFoo {
        bar: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Foo {
        bar: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SpecialFoo {
        bar: String,
        extra: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: i64,
    }

    impl Document for AncientFoo {}
    impl Document for OldFoo {}
    impl Document for Foo {}
    impl Document for SpecialFoo {}
    impl Document for Counter {}

    impl TaggedDocument for Counter {
        const TAG: &'static str = "Counter";
    }

    fn title_case(s: &str) -> String {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    fn foo_registry() -> DocumentRegistry {
        let mut registry = DocumentRegistry::new();
        registry.register::<AncientFoo>("Foo1").unwrap();
        registry.register::<OldFoo>("Foo2").unwrap();
        registry.register::<Foo>("Foo3").unwrap();
        registry
            .register_migration(|old: AncientFoo| OldFoo {
                bar: old.bar.to_lowercase(),
            })
            .unwrap();
        registry
            .register_migration(|old: OldFoo| Foo {
                bar: title_case(&old.bar),
            })
            .unwrap();
        registry
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut registry = DocumentRegistry::new();
        registry.register::<Foo>("Foo").unwrap();

        assert!(matches!(
            registry.register::<OldFoo>("Foo"),
            Err(CouchError::DuplicateTag(tag)) if tag == "Foo"
        ));
    }

    #[test]
    fn same_type_under_two_tags_is_ambiguous() {
        let mut registry = DocumentRegistry::new();
        registry.register::<Foo>("Foo").unwrap();

        assert!(matches!(
            registry.register::<Foo>("Foo-again"),
            Err(CouchError::AmbiguousType(_, tags)) if tags == vec!["Foo", "Foo-again"]
        ));
    }

    #[test]
    fn malformed_tags_are_rejected() {
        let mut registry = DocumentRegistry::new();

        for tag in ["", " Foo", "Foo\n", "Fo\u{0}o"] {
            assert!(matches!(
                registry.register::<Foo>(tag),
                Err(CouchError::InvalidTag(_))
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn tag_field_may_not_be_reserved() {
        assert!(matches!(
            DocumentRegistry::with_tag_field("_type"),
            Err(CouchError::InvalidTag(_))
        ));
        assert_eq!(
            DocumentRegistry::with_tag_field("kind")
                .unwrap()
                .tag_field(),
            "kind"
        );
    }

    #[test]
    fn second_outgoing_edge_is_non_linear() {
        let mut registry = foo_registry();

        assert!(matches!(
            registry.register_migration(|old: AncientFoo| Foo { bar: old.bar }),
            Err(CouchError::NonLinearMigration(from, to)) if from == "Foo1" && to == "Foo2"
        ));
    }

    #[test]
    fn migration_between_unregistered_types_fails() {
        let mut registry = DocumentRegistry::new();
        registry.register::<Foo>("Foo3").unwrap();

        assert!(matches!(
            registry.register_migration(|old: OldFoo| Foo { bar: old.bar }),
            Err(CouchError::UnknownType(_))
        ));
        assert!(matches!(
            registry.register_migration(|old: Foo| OldFoo { bar: old.bar }),
            Err(CouchError::UnknownType(_))
        ));
    }

    #[test]
    fn closing_a_cycle_is_rejected() {
        let mut registry = foo_registry();

        assert!(matches!(
            registry.register_migration(|old: Foo| AncientFoo { bar: old.bar }),
            Err(CouchError::MigrationCycle(tag)) if tag == "Foo3"
        ));
    }

    #[test]
    fn decode_follows_the_whole_chain() {
        let registry = foo_registry();

        let doc = registry
            .decode("Foo1", object(json!({"bar": "SPAM"})))
            .unwrap();
        assert_eq!(doc.downcast_ref::<Foo>(), Some(&Foo { bar: "Spam".into() }));

        let doc = registry
            .decode("Foo2", object(json!({"bar": "spam"})))
            .unwrap();
        assert_eq!(doc.downcast_ref::<Foo>(), Some(&Foo { bar: "Spam".into() }));

        assert_eq!(registry.latest_tag("Foo1").unwrap(), "Foo3");
    }

    #[test]
    fn decode_of_latest_type_applies_nothing() {
        let registry = foo_registry();

        let doc = registry
            .decode("Foo3", object(json!({"bar": "sPaM"})))
            .unwrap();
        assert_eq!(doc.downcast_ref::<Foo>(), Some(&Foo { bar: "sPaM".into() }));
    }

    #[test]
    fn decode_of_unknown_tag_fails() {
        assert!(matches!(
            foo_registry().decode("Bar", Map::new()),
            Err(CouchError::UnknownTag(tag)) if tag == "Bar"
        ));
    }

    #[test]
    fn decode_is_bounded_when_edges_form_a_cycle() {
        let mut registry = DocumentRegistry::new();
        registry.register::<OldFoo>("Foo2").unwrap();
        registry.register::<Foo>("Foo3").unwrap();
        registry
            .register_migration(|old: OldFoo| Foo { bar: old.bar })
            .unwrap();
        // Bypasses the eager check to exercise the step bound.
        registry.migrations.insert(
            "Foo3".into(),
            MigrationEdge {
                to: "Foo2".into(),
                migrate: Box::new(|doc: Box<dyn AnyDocument>| -> CouchResult<Box<dyn AnyDocument>> {
                    let foo = Foo::from_any_document(doc)?;
                    Ok(Box::new(OldFoo { bar: foo.bar }) as Box<dyn AnyDocument>)
                }),
            },
        );

        assert!(matches!(
            registry.decode("Foo2", object(json!({"bar": "x"}))),
            Err(CouchError::MigrationCycle(_))
        ));
    }

    #[test]
    fn load_requires_the_tag_field() {
        let registry = foo_registry();

        assert!(matches!(
            registry.load(object(json!({"bar": "x"}))),
            Err(CouchError::UntaggedDocument(field)) if field == "$type"
        ));

        let doc = registry
            .load(object(json!({"$type": "Foo2", "bar": "eggs"})))
            .unwrap();
        assert!(doc.is::<Foo>());
    }

    #[test]
    fn encode_stamps_the_tag() {
        let registry = foo_registry();

        let body = registry.encode(&Foo { bar: "x".into() }).unwrap();
        assert_eq!(Value::Object(body), json!({"$type": "Foo3", "bar": "x"}));

        let body = registry.encode(&OldFoo { bar: "x".into() }).unwrap();
        assert_eq!(body["$type"], "Foo2");
    }

    #[test]
    fn encode_of_unregistered_type_fails() {
        assert!(matches!(
            foo_registry().encode(&Counter { count: 1 }),
            Err(CouchError::UnregisteredType(name)) if name.ends_with("Counter")
        ));
    }

    #[test]
    fn subtype_encodes_under_parent_tag() {
        let mut registry = foo_registry();
        registry.register_subtype::<SpecialFoo, Foo>().unwrap();

        let body = registry
            .encode(&SpecialFoo {
                bar: "x".into(),
                extra: 7,
            })
            .unwrap();
        assert_eq!(body["$type"], "Foo3");
        assert_eq!(registry.tag_of::<SpecialFoo>().unwrap(), "Foo3");

        let doc = registry.load(body).unwrap();
        assert_eq!(doc.downcast_ref::<Foo>(), Some(&Foo { bar: "x".into() }));
    }

    #[test]
    fn subtype_of_two_registered_types_is_ambiguous() {
        let mut registry = foo_registry();
        registry.register_subtype::<SpecialFoo, Foo>().unwrap();

        assert!(matches!(
            registry.register_subtype::<SpecialFoo, OldFoo>(),
            Err(CouchError::AmbiguousType(_, tags)) if tags == vec!["Foo2", "Foo3"]
        ));
        // The rejected declaration leaves the earlier one intact.
        assert_eq!(registry.tag_of::<SpecialFoo>().unwrap(), "Foo3");
    }

    #[test]
    fn subtype_of_unknown_parent_fails() {
        let mut registry = DocumentRegistry::new();

        assert!(matches!(
            registry.register_subtype::<SpecialFoo, Foo>(),
            Err(CouchError::UnknownType(_))
        ));
    }

    #[test]
    fn exact_registration_wins_over_supertype() {
        let mut registry = foo_registry();
        registry.register_subtype::<SpecialFoo, Foo>().unwrap();
        registry.register::<SpecialFoo>("SpecialFoo").unwrap();

        assert_eq!(registry.tag_of::<SpecialFoo>().unwrap(), "SpecialFoo");
    }

    #[test]
    fn tagged_documents_register_under_their_tag() {
        let mut registry = DocumentRegistry::new();
        registry.register_tagged::<Counter>().unwrap();

        assert_eq!(registry.tag_of::<Counter>().unwrap(), "Counter");
        assert!(matches!(
            registry.register_tagged::<Counter>(),
            Err(CouchError::DuplicateTag(_))
        ));
    }
}
