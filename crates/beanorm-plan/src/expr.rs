//! Filter expressions.
//!
//! Expressions reference properties by path (`status`, `customer.name`);
//! column resolution happens at plan build time against the hydration tree.
//! The structural parts of an expression feed the shape hash; bind values do
//! not, except where they change the generated SQL (the length of an IN
//! list changes the placeholder count, so it is structural).

use crate::query::PlanHasher;
use beanorm_core::{Error, Result, Value};

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    const fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    const fn tag(self) -> u64 {
        match self {
            CompareOp::Eq => 1,
            CompareOp::Ne => 2,
            CompareOp::Gt => 3,
            CompareOp::Ge => 4,
            CompareOp::Lt => 5,
            CompareOp::Le => 6,
        }
    }
}

/// A filter expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// `path OP ?`
    Compare {
        /// Property path from the root.
        path: String,
        /// Comparison operator.
        op: CompareOp,
        /// Bind value.
        value: Value,
    },
    /// `path [NOT] IN (?, ...)`
    In {
        /// Property path from the root.
        path: String,
        /// Bind values; the count is structural.
        values: Vec<Value>,
        /// Negate the membership test.
        negated: bool,
    },
    /// `path BETWEEN ? AND ?`
    Between {
        /// Property path from the root.
        path: String,
        /// Lower bound bind value.
        low: Value,
        /// Upper bound bind value.
        high: Value,
    },
    /// `path IS [NOT] NULL`
    IsNull {
        /// Property path from the root.
        path: String,
        /// Negate the null test.
        negated: bool,
    },
    /// `path LIKE ?`, optionally case-insensitive through `lower()`.
    Like {
        /// Property path from the root.
        path: String,
        /// Pattern bind value.
        pattern: String,
        /// Fold both sides through `lower()`.
        case_insensitive: bool,
    },
    /// Raw SQL fragment with `?` markers for its bind values.
    Raw {
        /// The fragment; each `?` is rewritten to a numbered placeholder.
        sql: String,
        /// Bind values, one per `?` marker.
        binds: Vec<Value>,
    },
    /// All children must hold.
    And(Vec<Expr>),
    /// At least one child must hold.
    Or(Vec<Expr>),
    /// The child must not hold.
    Not(Box<Expr>),
}

impl Expr {
    /// `path = value`
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    /// `path <> value`
    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ne, value)
    }

    /// `path > value`
    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gt, value)
    }

    /// `path >= value`
    pub fn ge(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ge, value)
    }

    /// `path < value`
    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lt, value)
    }

    /// `path <= value`
    pub fn le(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Le, value)
    }

    fn compare(path: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Expr::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    /// `path IN (values...)`
    pub fn in_list(path: impl Into<String>, values: Vec<Value>) -> Self {
        Expr::In {
            path: path.into(),
            values,
            negated: false,
        }
    }

    /// `path NOT IN (values...)`
    pub fn not_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Expr::In {
            path: path.into(),
            values,
            negated: true,
        }
    }

    /// `path BETWEEN low AND high`
    pub fn between(
        path: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Expr::Between {
            path: path.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// `path IS NULL`
    pub fn is_null(path: impl Into<String>) -> Self {
        Expr::IsNull {
            path: path.into(),
            negated: false,
        }
    }

    /// `path IS NOT NULL`
    pub fn is_not_null(path: impl Into<String>) -> Self {
        Expr::IsNull {
            path: path.into(),
            negated: true,
        }
    }

    /// `path LIKE pattern`
    pub fn like(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Expr::Like {
            path: path.into(),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    /// `lower(path) LIKE lower(pattern)`
    pub fn ilike(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Expr::Like {
            path: path.into(),
            pattern: pattern.into(),
            case_insensitive: true,
        }
    }

    /// Raw SQL fragment with `?` markers, one per bind value.
    pub fn raw(sql: impl Into<String>, binds: Vec<Value>) -> Self {
        Expr::Raw {
            sql: sql.into(),
            binds,
        }
    }

    /// AND-combine with another expression, flattening nested ANDs.
    #[must_use]
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut children) => {
                children.push(other);
                Expr::And(children)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    /// OR-combine with another expression, flattening nested ORs.
    #[must_use]
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut children) => {
                children.push(other);
                Expr::Or(children)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    /// Negate this expression.
    #[must_use]
    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Fold the structural parts of this expression into the plan hasher.
    pub fn shape_hash_into(&self, h: &mut PlanHasher) {
        match self {
            Expr::Compare { path, op, .. } => {
                h.add(1);
                h.add_str(path);
                h.add(op.tag());
            }
            Expr::In {
                path,
                values,
                negated,
            } => {
                h.add(2);
                h.add_str(path);
                h.add(values.len() as u64);
                h.add_bool(*negated);
            }
            Expr::Between { path, .. } => {
                h.add(3);
                h.add_str(path);
            }
            Expr::IsNull { path, negated } => {
                h.add(4);
                h.add_str(path);
                h.add_bool(*negated);
            }
            Expr::Like {
                path,
                case_insensitive,
                ..
            } => {
                h.add(5);
                h.add_str(path);
                h.add_bool(*case_insensitive);
            }
            Expr::Raw { sql, binds } => {
                h.add(6);
                h.add_str(sql);
                h.add(binds.len() as u64);
            }
            Expr::And(children) => {
                h.add(7);
                h.add(children.len() as u64);
                for child in children {
                    child.shape_hash_into(h);
                }
            }
            Expr::Or(children) => {
                h.add(8);
                h.add(children.len() as u64);
                for child in children {
                    child.shape_hash_into(h);
                }
            }
            Expr::Not(child) => {
                h.add(9);
                child.shape_hash_into(h);
            }
        }
    }

    /// Append this expression's bind values in placeholder order.
    pub fn collect_binds(&self, out: &mut Vec<Value>) {
        match self {
            Expr::Compare { value, .. } => out.push(value.clone()),
            Expr::In { values, .. } => out.extend(values.iter().cloned()),
            Expr::Between { low, high, .. } => {
                out.push(low.clone());
                out.push(high.clone());
            }
            Expr::IsNull { .. } => {}
            Expr::Like { pattern, .. } => out.push(Value::Text(pattern.clone())),
            Expr::Raw { binds, .. } => out.extend(binds.iter().cloned()),
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_binds(out);
                }
            }
            Expr::Not(child) => child.collect_binds(out),
        }
    }

    /// Render to SQL with numbered placeholders.
    ///
    /// `resolve` maps a property path to its qualified column;
    /// `next_placeholder` is the 1-based index of the next placeholder.
    pub fn render(
        &self,
        resolve: &mut dyn FnMut(&str) -> Result<String>,
        next_placeholder: &mut usize,
    ) -> Result<String> {
        let mut bind = |next: &mut usize| {
            let p = format!("${next}");
            *next += 1;
            p
        };
        match self {
            Expr::Compare { path, op, .. } => {
                let column = resolve(path)?;
                Ok(format!(
                    "{column} {} {}",
                    op.sql(),
                    bind(next_placeholder)
                ))
            }
            Expr::In {
                path,
                values,
                negated,
            } => {
                let column = resolve(path)?;
                let placeholders: Vec<String> =
                    values.iter().map(|_| bind(next_placeholder)).collect();
                let keyword = if *negated { "not in" } else { "in" };
                Ok(format!("{column} {keyword} ({})", placeholders.join(", ")))
            }
            Expr::Between { path, .. } => {
                let column = resolve(path)?;
                let low = bind(next_placeholder);
                let high = bind(next_placeholder);
                Ok(format!("{column} between {low} and {high}"))
            }
            Expr::IsNull { path, negated } => {
                let column = resolve(path)?;
                let keyword = if *negated { "is not null" } else { "is null" };
                Ok(format!("{column} {keyword}"))
            }
            Expr::Like {
                path,
                case_insensitive,
                ..
            } => {
                let column = resolve(path)?;
                let placeholder = bind(next_placeholder);
                if *case_insensitive {
                    Ok(format!("lower({column}) like lower({placeholder})"))
                } else {
                    Ok(format!("{column} like {placeholder}"))
                }
            }
            Expr::Raw { sql, binds } => {
                let marker_count = sql.matches('?').count();
                if marker_count != binds.len() {
                    return Err(Error::Custom(format!(
                        "raw expression has {marker_count} markers but {} bind values",
                        binds.len()
                    )));
                }
                let mut rendered = String::with_capacity(sql.len() + marker_count * 2);
                let mut parts = sql.split('?');
                if let Some(first) = parts.next() {
                    rendered.push_str(first);
                }
                for part in parts {
                    rendered.push_str(&bind(next_placeholder));
                    rendered.push_str(part);
                }
                Ok(rendered)
            }
            Expr::And(children) => {
                let rendered: Result<Vec<String>> = children
                    .iter()
                    .map(|c| c.render(resolve, next_placeholder))
                    .collect();
                Ok(format!("({})", rendered?.join(" and ")))
            }
            Expr::Or(children) => {
                let rendered: Result<Vec<String>> = children
                    .iter()
                    .map(|c| c.render(resolve, next_placeholder))
                    .collect();
                Ok(format!("({})", rendered?.join(" or ")))
            }
            Expr::Not(child) => {
                let inner = child.render(resolve, next_placeholder)?;
                Ok(format!("not ({inner})"))
            }
        }
    }
}
