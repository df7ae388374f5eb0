//! TDTQL abstract syntax tree.
//!
//! Expression trees are finite and strictly nested: And/Or groups whose
//! leaves are filters, with an explicit Not wrapper.

/// Filter comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
            CompareOp::Lt => "lt",
            CompareOp::Lte => "lte",
            CompareOp::In => "in",
            CompareOp::NotIn => "not_in",
            CompareOp::Between => "between",
            CompareOp::Like => "like",
            CompareOp::NotLike => "not_like",
            CompareOp::IsNull => "is_null",
            CompareOp::IsNotNull => "is_not_null",
        }
    }
}

/// A leaf predicate over one field.
///
/// `value`/`value2` serve the binary and BETWEEN forms, `values` the IN
/// list. Values are kept in their string representation and typed at
/// evaluation time against the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: CompareOp,
    pub value: Option<String>,
    pub value2: Option<String>,
    pub values: Vec<String>,
}

impl Filter {
    pub fn binary(field: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            op,
            value: Some(value.into()),
            value2: None,
            values: Vec::new(),
        }
    }

    pub fn unary(field: impl Into<String>, op: CompareOp) -> Self {
        Filter {
            field: field.into(),
            op,
            value: None,
            value2: None,
            values: Vec::new(),
        }
    }
}

/// A filter tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Filter(Filter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// A parsed `SELECT * FROM ...` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub where_expr: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// The query text this statement was parsed from; travels in the
    /// query context of response packets.
    pub raw: String,
}

impl SelectStatement {
    pub fn new(table: impl Into<String>) -> Self {
        SelectStatement {
            table: table.into(),
            where_expr: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            raw: String::new(),
        }
    }

    /// Every field name referenced by filters and ordering.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
            match expr {
                Expr::And(children) | Expr::Or(children) => {
                    children.iter().for_each(|c| walk(c, out))
                }
                Expr::Not(inner) => walk(inner, out),
                Expr::Filter(f) => out.push(f.field.as_str()),
            }
        }
        if let Some(expr) = &self.where_expr {
            walk(expr, &mut out);
        }
        out.extend(self.order_by.iter().map(|o| o.field.as_str()));
        out
    }
}
