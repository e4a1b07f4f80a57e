//! Bean metadata supplied by the mapping/deployment collaborator.
//!
//! Descriptors are resolved once, outside this engine, and treated as
//! read-only input by the hydration tree builder: ordered scalar properties
//! with column names, id properties, association targets with join column
//! pairs, and inheritance discriminator info.

use crate::Result;
use crate::error::Error;
use std::collections::HashMap;
use std::sync::Arc;

/// The kind of association between two bean types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocKind {
    /// Many-to-one / one-to-one: the owning side carries the foreign key.
    BelongsTo,
    /// One-to-many: the target table carries a foreign key back to the owner.
    HasMany,
    /// Many-to-many: joined through a link table.
    ManyToMany,
}

impl AssocKind {
    /// True for associations that produce a collection on the owning bean.
    #[must_use]
    pub const fn is_to_many(self) -> bool {
        matches!(self, AssocKind::HasMany | AssocKind::ManyToMany)
    }
}

/// One scalar property with its column mapping.
#[derive(Debug, Clone)]
pub struct PropertyMeta {
    /// Property name on the bean.
    pub name: String,
    /// Database column name.
    pub column: String,
    /// SQL formula replacing the plain column reference, if derived.
    pub formula: Option<String>,
}

impl PropertyMeta {
    /// Create a plain column-backed property.
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            formula: None,
        }
    }

    /// Mark this property as formula/derived.
    #[must_use]
    pub fn formula(mut self, sql: impl Into<String>) -> Self {
        self.formula = Some(sql.into());
        self
    }
}

/// A local/remote join column pair.
#[derive(Debug, Clone)]
pub struct JoinPair {
    /// Column on the owning side.
    pub local: String,
    /// Column on the target side.
    pub remote: String,
}

impl JoinPair {
    /// Create a join column pair.
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Link table info for many-to-many associations.
#[derive(Debug, Clone)]
pub struct LinkTable {
    /// The link table name.
    pub table: String,
    /// Column pointing at the owning bean's id.
    pub local_column: String,
    /// Column pointing at the target bean's id.
    pub remote_column: String,
}

impl LinkTable {
    /// Create link table info.
    pub fn new(
        table: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            local_column: local_column.into(),
            remote_column: remote_column.into(),
        }
    }
}

/// One association property.
#[derive(Debug, Clone)]
pub struct AssocMeta {
    /// Property name on the owning bean.
    pub name: String,
    /// Association kind.
    pub kind: AssocKind,
    /// Target bean type name (resolvable through the [`MappingRegistry`]).
    pub target: String,
    /// Join column pair. For `BelongsTo` the local column is the FK on the
    /// owner; for `HasMany` the remote column is the FK on the target.
    pub join: JoinPair,
    /// Link table, required for `ManyToMany`.
    pub link: Option<LinkTable>,
}

impl AssocMeta {
    /// Create an association.
    pub fn new(
        name: impl Into<String>,
        kind: AssocKind,
        target: impl Into<String>,
        join: JoinPair,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            join,
            link: None,
        }
    }

    /// Attach link table info (many-to-many only).
    #[must_use]
    pub fn link_table(mut self, link: LinkTable) -> Self {
        self.link = Some(link);
        self
    }
}

/// Inheritance discriminator column and the value selecting this type.
#[derive(Debug, Clone)]
pub struct Discriminator {
    /// Discriminator column name.
    pub column: String,
    /// Value identifying this concrete type.
    pub value: String,
}

/// Externally-resolved metadata for one bean type.
#[derive(Debug, Clone)]
pub struct BeanDescriptor {
    /// Bean type name (registry key).
    pub bean_type: String,
    /// Base table name.
    pub base_table: String,
    /// Id property.
    pub id: PropertyMeta,
    /// Ordered scalar properties, excluding the id.
    pub properties: Vec<PropertyMeta>,
    /// Associations.
    pub assocs: Vec<AssocMeta>,
    /// Inheritance discriminator, when this type participates in a hierarchy.
    pub discriminator: Option<Discriminator>,
}

impl BeanDescriptor {
    /// Create a descriptor with no scalar properties or associations.
    pub fn new(
        bean_type: impl Into<String>,
        base_table: impl Into<String>,
        id: PropertyMeta,
    ) -> Self {
        Self {
            bean_type: bean_type.into(),
            base_table: base_table.into(),
            id,
            properties: Vec::new(),
            assocs: Vec::new(),
            discriminator: None,
        }
    }

    /// Append a scalar property.
    #[must_use]
    pub fn property(mut self, prop: PropertyMeta) -> Self {
        self.properties.push(prop);
        self
    }

    /// Append an association.
    #[must_use]
    pub fn assoc(mut self, assoc: AssocMeta) -> Self {
        self.assocs.push(assoc);
        self
    }

    /// Set the inheritance discriminator.
    #[must_use]
    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.discriminator = Some(Discriminator {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Find a scalar property by name (the id property included).
    pub fn find_property(&self, name: &str) -> Option<&PropertyMeta> {
        if self.id.name == name {
            return Some(&self.id);
        }
        self.properties.iter().find(|p| p.name == name)
    }

    /// Find an association by name.
    pub fn find_assoc(&self, name: &str) -> Option<&AssocMeta> {
        self.assocs.iter().find(|a| a.name == name)
    }
}

/// Registry of bean descriptors, keyed by bean type name.
///
/// Built once by whoever constructs the database context; read-only afterwards.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    descriptors: HashMap<String, Arc<BeanDescriptor>>,
}

impl MappingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous entry of the same type.
    pub fn register(&mut self, descriptor: BeanDescriptor) {
        self.descriptors
            .insert(descriptor.bean_type.clone(), Arc::new(descriptor));
    }

    /// Look up a descriptor, failing with a mapping error when unknown.
    pub fn descriptor(&self, bean_type: &str) -> Result<Arc<BeanDescriptor>> {
        self.descriptors.get(bean_type).cloned().ok_or_else(|| {
            Error::mapping(bean_type, "", "bean type is not registered")
        })
    }

    /// Number of registered bean types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_descriptor() -> BeanDescriptor {
        BeanDescriptor::new("Order", "orders", PropertyMeta::new("id", "id"))
            .property(PropertyMeta::new("status", "status"))
            .property(PropertyMeta::new("total", "order_total").formula("sub_total + tax"))
            .assoc(AssocMeta::new(
                "customer",
                AssocKind::BelongsTo,
                "Customer",
                JoinPair::new("customer_id", "id"),
            ))
            .assoc(AssocMeta::new(
                "details",
                AssocKind::HasMany,
                "OrderDetail",
                JoinPair::new("id", "order_id"),
            ))
    }

    #[test]
    fn test_find_property_includes_id() {
        let desc = order_descriptor();
        assert!(desc.find_property("id").is_some());
        assert!(desc.find_property("status").is_some());
        assert!(desc.find_property("nope").is_none());
    }

    #[test]
    fn test_formula_property() {
        let desc = order_descriptor();
        let total = desc.find_property("total").unwrap();
        assert_eq!(total.formula.as_deref(), Some("sub_total + tax"));
    }

    #[test]
    fn test_find_assoc_and_kinds() {
        let desc = order_descriptor();
        assert_eq!(
            desc.find_assoc("customer").unwrap().kind,
            AssocKind::BelongsTo
        );
        assert!(desc.find_assoc("details").unwrap().kind.is_to_many());
        assert!(!AssocKind::BelongsTo.is_to_many());
        assert!(AssocKind::ManyToMany.is_to_many());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = MappingRegistry::new();
        registry.register(order_descriptor());
        assert_eq!(registry.len(), 1);
        assert!(registry.descriptor("Order").is_ok());

        let err = registry.descriptor("Missing").unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }
}
