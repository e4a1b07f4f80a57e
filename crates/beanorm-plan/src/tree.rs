//! The compiled hydration tree.
//!
//! A [`SqlTree`] mirrors a query's object shape: one node per bean type in
//! the fetched graph, in join order. Building the tree resolves every fetch
//! path and property name against the mapping registry, assigns table
//! aliases, and fixes the column index of every selected column, so row
//! hydration reads by index and never consults column names.
//!
//! Join rules:
//! - a to-many association always joins outer, and every join below a
//!   to-many node is forced outer as well (a missing child row must not
//!   erase its parent row)
//! - to-one children are joined before to-many children, so parent columns
//!   stay contiguous in the select list
//! - at most one to-many association joins into the flat result (the many
//!   root); further to-many fetch paths are not joined, since a second
//!   fan-out would multiply rows into a cartesian product. Hydration
//!   leaves them as empty lazy placeholder collections
//! - many-to-many associations route through their link table under a
//!   dedicated alias

use crate::query::{FetchPath, Query};
use beanorm_core::{
    AssocKind, AssocMeta, BeanDescriptor, Error, MappingRegistry, PropertyMeta, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The kind of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A single bean per parent: the root, or a to-one association.
    Bean,
    /// The root of a to-many collection; rows fan out under this node.
    ManyRoot,
}

/// One node of the hydration tree.
#[derive(Debug)]
pub struct SqlTreeNode {
    /// Node kind.
    pub kind: NodeKind,
    /// Dot-separated association path from the root; empty at the root.
    pub path: String,
    /// Descriptor of the bean type at this node.
    pub descriptor: Arc<BeanDescriptor>,
    /// The association leading here from the parent; `None` at the root.
    pub assoc: Option<AssocMeta>,
    /// Table alias.
    pub alias: String,
    /// Link table alias, for many-to-many nodes.
    pub link_alias: Option<String>,
    /// Whether this node joins outer.
    pub outer_join: bool,
    /// Column index of this node's id.
    pub id_index: usize,
    /// Column index of the discriminator column, when the type has one.
    pub discriminator_index: Option<usize>,
    /// Selected scalar properties (id excluded) with their column indexes.
    pub properties: Vec<(PropertyMeta, usize)>,
    /// Child nodes, to-one before to-many.
    pub children: Vec<SqlTreeNode>,
}

impl SqlTreeNode {
    /// Whether a child node fetches the named association.
    pub fn fetches(&self, assoc_name: &str) -> bool {
        self.children
            .iter()
            .any(|c| c.assoc.as_ref().is_some_and(|a| a.name == assoc_name))
    }
}

/// A built hydration tree with its column layout.
#[derive(Debug)]
pub struct SqlTree {
    root: SqlTreeNode,
    column_count: usize,
    has_many: bool,
}

/// Fetch paths merged into a trie, so `details` and `details.product`
/// become one node with a child.
#[derive(Debug, Default)]
struct FetchTrie {
    properties: Option<Vec<String>>,
    children: BTreeMap<String, FetchTrie>,
}

impl FetchTrie {
    fn build(bean_type: &str, paths: &[FetchPath]) -> Result<Self> {
        let mut root = FetchTrie::default();
        for fetch in paths {
            if fetch.path.trim().is_empty() {
                return Err(Error::mapping(bean_type, &fetch.path, "empty fetch path"));
            }
            let mut node = &mut root;
            for segment in fetch.path.split('.') {
                if segment.is_empty() {
                    return Err(Error::mapping(
                        bean_type,
                        &fetch.path,
                        "fetch path has an empty segment",
                    ));
                }
                node = node.children.entry(segment.to_string()).or_default();
            }
            if let Some(props) = &fetch.properties {
                node.properties = Some(props.clone());
            }
        }
        Ok(root)
    }
}

struct BuildState {
    next_alias: usize,
    next_column: usize,
    has_many: bool,
}

impl SqlTree {
    /// Build the hydration tree for a query, resolving every path and
    /// property against the registry.
    pub fn build(registry: &MappingRegistry, query: &Query) -> Result<Self> {
        let descriptor = registry.descriptor(query.bean_type())?;
        let trie = FetchTrie::build(query.bean_type(), query.fetch_paths())?;
        let mut state = BuildState {
            next_alias: 0,
            next_column: 0,
            has_many: false,
        };
        let root = build_node(
            registry,
            query.bean_type(),
            descriptor,
            None,
            String::new(),
            query.selected(),
            &trie,
            false,
            &mut state,
        )?;
        Ok(Self {
            root,
            column_count: state.next_column,
            has_many: state.has_many,
        })
    }

    /// The root node.
    pub fn root(&self) -> &SqlTreeNode {
        &self.root
    }

    /// Total number of selected columns.
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Whether the tree contains any to-many node.
    pub fn has_many(&self) -> bool {
        self.has_many
    }

    /// Find a node by its association path; the empty path is the root.
    pub fn find_node(&self, path: &str) -> Option<&SqlTreeNode> {
        if path.is_empty() {
            return Some(&self.root);
        }
        let mut node = &self.root;
        for segment in path.split('.') {
            node = node
                .children
                .iter()
                .find(|c| c.assoc.as_ref().is_some_and(|a| a.name == segment))?;
        }
        Some(node)
    }

    /// The select list, in column index order.
    pub fn select_clause(&self) -> String {
        let mut columns = Vec::with_capacity(self.column_count);
        append_select(&self.root, &mut columns);
        columns.join(", ")
    }

    /// The from clause with all joins.
    pub fn from_clause(&self) -> String {
        let mut out = format!("{} {}", self.root.descriptor.base_table, self.root.alias);
        for child in &self.root.children {
            append_joins(child, &self.root, &mut out);
        }
        out
    }

    /// Root-level predicates the tree itself requires (the root's
    /// inheritance discriminator). Child discriminators live in their join
    /// conditions so outer joins stay outer.
    pub fn root_predicates(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(disc) = &self.root.descriptor.discriminator {
            out.push(format!(
                "{}.{} = '{}'",
                self.root.alias,
                disc.column,
                escape_literal(&disc.value)
            ));
        }
        out
    }

    /// Resolve a property path (`status`, `customer.name`) to its qualified
    /// column or formula.
    ///
    /// Only paths inside the fetched graph resolve; filtering or ordering by
    /// an unfetched association is a mapping error.
    pub fn resolve_column(&self, path: &str) -> Result<String> {
        let (node_path, property) = match path.rfind('.') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("", path),
        };
        let node = self.find_node(node_path).ok_or_else(|| {
            Error::mapping(
                &self.root.descriptor.bean_type,
                path,
                "path is not part of the fetched graph",
            )
        })?;
        let meta = node.descriptor.find_property(property).ok_or_else(|| {
            Error::mapping(&self.root.descriptor.bean_type, path, "unknown property")
        })?;
        Ok(match &meta.formula {
            Some(formula) => format!("({formula})"),
            None => format!("{}.{}", node.alias, meta.column),
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn build_node(
    registry: &MappingRegistry,
    root_type: &str,
    descriptor: Arc<BeanDescriptor>,
    assoc: Option<AssocMeta>,
    path: String,
    selected: Option<&[String]>,
    trie: &FetchTrie,
    parent_outer: bool,
    state: &mut BuildState,
) -> Result<SqlTreeNode> {
    let alias_no = state.next_alias;
    state.next_alias += 1;
    let alias = format!("t{alias_no}");

    let kind = if assoc.as_ref().is_some_and(|a| a.kind.is_to_many()) {
        NodeKind::ManyRoot
    } else {
        NodeKind::Bean
    };
    if kind == NodeKind::ManyRoot {
        state.has_many = true;
    }
    let outer_join = parent_outer || kind == NodeKind::ManyRoot;

    let link_alias = match &assoc {
        Some(a) if a.kind == AssocKind::ManyToMany => {
            if a.link.is_none() {
                return Err(Error::mapping(
                    root_type,
                    &path,
                    "many-to-many association has no link table",
                ));
            }
            Some(format!("l{alias_no}"))
        }
        _ => None,
    };

    // The id always loads first; the discriminator follows so inheritance
    // can be resolved before any property is read.
    let id_index = state.next_column;
    state.next_column += 1;
    let discriminator_index = descriptor.discriminator.as_ref().map(|_| {
        let index = state.next_column;
        state.next_column += 1;
        index
    });

    let selected_props: Vec<PropertyMeta> = match selected {
        None => descriptor.properties.clone(),
        Some(names) => {
            let mut props = Vec::with_capacity(names.len());
            for name in names {
                if *name == descriptor.id.name {
                    continue; // always loaded
                }
                let full = join_path(&path, name);
                let meta = descriptor.find_property(name).ok_or_else(|| {
                    Error::mapping(root_type, full, "unknown property in partial select")
                })?;
                props.push(meta.clone());
            }
            props
        }
    };
    let properties: Vec<(PropertyMeta, usize)> = selected_props
        .into_iter()
        .map(|p| {
            let index = state.next_column;
            state.next_column += 1;
            (p, index)
        })
        .collect();

    // Resolve child associations first so to-one nodes can be built (and
    // get their column indexes) ahead of to-many nodes.
    let mut to_one = Vec::new();
    let mut to_many = Vec::new();
    for (name, child_trie) in &trie.children {
        let child_path = join_path(&path, name);
        let assoc_meta = descriptor
            .find_assoc(name)
            .ok_or_else(|| Error::mapping(root_type, &child_path, "unknown association path"))?
            .clone();
        if assoc_meta.kind.is_to_many() {
            to_many.push((child_path, assoc_meta, child_trie));
        } else {
            to_one.push((child_path, assoc_meta, child_trie));
        }
    }

    let mut children = Vec::with_capacity(to_one.len() + to_many.len());
    for (child_path, assoc_meta, child_trie) in to_one.into_iter().chain(to_many) {
        // Only one collection can fan out into the flat result; further
        // to-many paths stay unfetched.
        if assoc_meta.kind.is_to_many() && state.has_many {
            continue;
        }
        let target = registry.descriptor(&assoc_meta.target)?;
        children.push(build_node(
            registry,
            root_type,
            target,
            Some(assoc_meta),
            child_path,
            child_trie.properties.as_deref(),
            child_trie,
            outer_join,
            state,
        )?);
    }

    Ok(SqlTreeNode {
        kind,
        path,
        descriptor,
        assoc,
        alias,
        link_alias,
        outer_join,
        id_index,
        discriminator_index,
        properties,
        children,
    })
}

fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}

fn append_select(node: &SqlTreeNode, out: &mut Vec<String>) {
    out.push(format!("{}.{}", node.alias, node.descriptor.id.column));
    if let Some(disc) = &node.descriptor.discriminator {
        out.push(format!("{}.{}", node.alias, disc.column));
    }
    for (prop, _) in &node.properties {
        out.push(match &prop.formula {
            Some(formula) => format!("({formula})"),
            None => format!("{}.{}", node.alias, prop.column),
        });
    }
    for child in &node.children {
        append_select(child, out);
    }
}

fn append_joins(node: &SqlTreeNode, parent: &SqlTreeNode, out: &mut String) {
    let assoc = node
        .assoc
        .as_ref()
        .expect("non-root node always has an association");
    let join_kw = if node.outer_join { "left join" } else { "join" };
    match (&assoc.kind, &assoc.link, &node.link_alias) {
        (AssocKind::ManyToMany, Some(link), Some(link_alias)) => {
            out.push_str(&format!(
                " {join_kw} {} {link_alias} on {link_alias}.{} = {}.{}",
                link.table, link.local_column, parent.alias, parent.descriptor.id.column
            ));
            out.push_str(&format!(
                " {join_kw} {} {} on {}.{} = {link_alias}.{}",
                node.descriptor.base_table,
                node.alias,
                node.alias,
                node.descriptor.id.column,
                link.remote_column
            ));
        }
        _ => {
            out.push_str(&format!(
                " {join_kw} {} {} on {}.{} = {}.{}",
                node.descriptor.base_table,
                node.alias,
                node.alias,
                assoc.join.remote,
                parent.alias,
                assoc.join.local
            ));
        }
    }
    // Child discriminators belong in the join condition: a where-clause
    // predicate would turn an outer join back into an inner one.
    if let Some(disc) = &node.descriptor.discriminator {
        out.push_str(&format!(
            " and {}.{} = '{}'",
            node.alias,
            disc.column,
            escape_literal(&disc.value)
        ));
    }
    for child in &node.children {
        append_joins(child, node, out);
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanorm_core::JoinPair;

    fn registry() -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry.register(
            BeanDescriptor::new("Customer", "customer", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("name", "name")),
        );
        registry.register(
            BeanDescriptor::new("Product", "product", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("sku", "sku"))
                .property(PropertyMeta::new("name", "name")),
        );
        registry.register(
            BeanDescriptor::new("OrderDetail", "o_order_detail", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("qty", "order_qty"))
                .property(PropertyMeta::new("unitPrice", "unit_price"))
                .assoc(AssocMeta::new(
                    "product",
                    AssocKind::BelongsTo,
                    "Product",
                    JoinPair::new("product_id", "id"),
                )),
        );
        registry.register(
            BeanDescriptor::new("Order", "o_order", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("status", "status"))
                .property(PropertyMeta::new("shipDate", "ship_date"))
                .assoc(AssocMeta::new(
                    "customer",
                    AssocKind::BelongsTo,
                    "Customer",
                    JoinPair::new("kcustomer_id", "id"),
                ))
                .assoc(AssocMeta::new(
                    "details",
                    AssocKind::HasMany,
                    "OrderDetail",
                    JoinPair::new("id", "order_id"),
                )),
        );
        registry
    }

    #[test]
    fn test_root_only_tree() {
        let registry = registry();
        let tree = SqlTree::build(&registry, &Query::new("Order")).unwrap();

        let root = tree.root();
        assert_eq!(root.kind, NodeKind::Bean);
        assert_eq!(root.alias, "t0");
        assert_eq!(root.id_index, 0);
        assert_eq!(root.properties.len(), 2);
        assert_eq!(tree.column_count(), 3);
        assert!(!tree.has_many());
        assert_eq!(tree.select_clause(), "t0.id, t0.status, t0.ship_date");
        assert_eq!(tree.from_clause(), "o_order t0");
    }

    #[test]
    fn test_nested_fetch_column_layout() {
        let registry = registry();
        let query = Query::new("Order")
            .fetch("details")
            .fetch("details.product");
        let tree = SqlTree::build(&registry, &query).unwrap();

        // Root columns first, then the many node, then its to-one child;
        // indexes are assigned in select order.
        let details = tree.find_node("details").unwrap();
        assert_eq!(details.kind, NodeKind::ManyRoot);
        assert!(details.outer_join);
        assert_eq!(details.id_index, 3);

        let product = tree.find_node("details.product").unwrap();
        assert_eq!(product.kind, NodeKind::Bean);
        // Below a many root the to-one join is forced outer.
        assert!(product.outer_join);
        assert_eq!(product.id_index, 6);
        assert_eq!(tree.column_count(), 9);
        assert!(tree.has_many());
    }

    #[test]
    fn test_to_one_joins_before_to_many() {
        let registry = registry();
        let query = Query::new("Order").fetch("details").fetch("customer");
        let tree = SqlTree::build(&registry, &query).unwrap();

        let root = tree.root();
        assert_eq!(root.children[0].path, "customer");
        assert_eq!(root.children[1].path, "details");
        // The to-one child is inner joined; the to-many is outer.
        assert!(!root.children[0].outer_join);
        assert!(root.children[1].outer_join);

        assert_eq!(
            tree.from_clause(),
            "o_order t0 \
             join customer t1 on t1.id = t0.kcustomer_id \
             left join o_order_detail t2 on t2.order_id = t0.id"
        );
    }

    #[test]
    fn test_second_to_many_path_is_not_joined() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Shipment", "shipment", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("carrier", "carrier")),
        );
        registry.register(
            BeanDescriptor::new("BigOrder", "o_order", PropertyMeta::new("id", "id"))
                .assoc(AssocMeta::new(
                    "details",
                    AssocKind::HasMany,
                    "OrderDetail",
                    JoinPair::new("id", "order_id"),
                ))
                .assoc(AssocMeta::new(
                    "shipments",
                    AssocKind::HasMany,
                    "Shipment",
                    JoinPair::new("id", "order_id"),
                )),
        );
        let query = Query::new("BigOrder").fetch("details").fetch("shipments");
        let tree = SqlTree::build(&registry, &query).unwrap();

        assert!(tree.find_node("details").is_some());
        assert!(tree.find_node("shipments").is_none());
        assert!(tree.root().fetches("details"));
        assert!(!tree.root().fetches("shipments"));
        assert_eq!(
            tree.from_clause(),
            "o_order t0 left join o_order_detail t1 on t1.order_id = t0.id"
        );
    }

    #[test]
    fn test_partial_select_keeps_id() {
        let registry = registry();
        let query = Query::new("Order")
            .select(&["status"])
            .fetch_partial("details", &["qty"]);
        let tree = SqlTree::build(&registry, &query).unwrap();

        assert_eq!(
            tree.select_clause(),
            "t0.id, t0.status, t1.id, t1.order_qty"
        );
    }

    #[test]
    fn test_unknown_paths_are_mapping_errors() {
        let registry = registry();

        let bad_fetch = SqlTree::build(&registry, &Query::new("Order").fetch("linez"));
        assert!(matches!(bad_fetch.unwrap_err(), Error::Mapping(_)));

        let bad_select = SqlTree::build(&registry, &Query::new("Order").select(&["bogus"]));
        assert!(matches!(bad_select.unwrap_err(), Error::Mapping(_)));

        let bad_nested = SqlTree::build(
            &registry,
            &Query::new("Order").fetch("details.warehouse"),
        );
        assert!(matches!(bad_nested.unwrap_err(), Error::Mapping(_)));
    }

    #[test]
    fn test_resolve_column() {
        let registry = registry();
        let query = Query::new("Order").fetch("customer");
        let tree = SqlTree::build(&registry, &query).unwrap();

        assert_eq!(tree.resolve_column("status").unwrap(), "t0.status");
        assert_eq!(tree.resolve_column("customer.name").unwrap(), "t1.name");
        assert_eq!(tree.resolve_column("id").unwrap(), "t0.id");
        // Not fetched: cannot be referenced.
        assert!(tree.resolve_column("details.qty").is_err());
    }

    #[test]
    fn test_formula_resolves_to_expression() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Invoice", "invoice", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("total", "total").formula("sub_total + tax")),
        );
        let tree = SqlTree::build(&registry, &Query::new("Invoice")).unwrap();
        assert_eq!(tree.resolve_column("total").unwrap(), "(sub_total + tax)");
        assert_eq!(tree.select_clause(), "t0.id, (sub_total + tax)");
    }

    #[test]
    fn test_discriminator_layout_and_predicates() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Vehicle", "vehicle", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("licence", "licence"))
                .discriminator("dtype", "CAR"),
        );
        let tree = SqlTree::build(&registry, &Query::new("Vehicle")).unwrap();

        let root = tree.root();
        assert_eq!(root.discriminator_index, Some(1));
        assert_eq!(root.properties[0].1, 2);
        assert_eq!(tree.select_clause(), "t0.id, t0.dtype, t0.licence");
        assert_eq!(tree.root_predicates(), vec!["t0.dtype = 'CAR'"]);
    }

    #[test]
    fn test_child_discriminator_in_join_condition() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Car", "vehicle", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("licence", "licence"))
                .discriminator("dtype", "CAR"),
        );
        registry.register(
            BeanDescriptor::new("Driver", "driver", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("name", "name"))
                .assoc(AssocMeta::new(
                    "cars",
                    AssocKind::HasMany,
                    "Car",
                    JoinPair::new("id", "driver_id"),
                )),
        );
        let tree = SqlTree::build(&registry, &Query::new("Driver").fetch("cars")).unwrap();
        assert_eq!(
            tree.from_clause(),
            "driver t0 \
             left join vehicle t1 on t1.driver_id = t0.id and t1.dtype = 'CAR'"
        );
        assert!(tree.root_predicates().is_empty());
    }

    #[test]
    fn test_many_to_many_joins_through_link_table() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Role", "role", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("code", "code")),
        );
        registry.register(
            BeanDescriptor::new("User", "app_user", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("name", "name"))
                .assoc(
                    AssocMeta::new(
                        "roles",
                        AssocKind::ManyToMany,
                        "Role",
                        JoinPair::new("id", "id"),
                    )
                    .link_table(beanorm_core::LinkTable::new("user_role", "user_id", "role_id")),
                ),
        );
        let tree = SqlTree::build(&registry, &Query::new("User").fetch("roles")).unwrap();
        assert_eq!(
            tree.from_clause(),
            "app_user t0 \
             left join user_role l1 on l1.user_id = t0.id \
             left join role t1 on t1.id = l1.role_id"
        );
    }

    #[test]
    fn test_many_to_many_without_link_table_is_mapping_error() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Tag", "tag", PropertyMeta::new("id", "id")),
        );
        registry.register(
            BeanDescriptor::new("Post", "post", PropertyMeta::new("id", "id")).assoc(
                AssocMeta::new(
                    "tags",
                    AssocKind::ManyToMany,
                    "Tag",
                    JoinPair::new("id", "id"),
                ),
            ),
        );
        let err = SqlTree::build(&registry, &Query::new("Post").fetch("tags")).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }
}
