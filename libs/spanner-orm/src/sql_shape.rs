//! Recognizer for the statement shapes the ORM generates for single-row writes.
//!
//! Statements are parsed with `sqlparser` and then matched against a narrow
//! set of shapes:
//!
//! ```text
//! INSERT INTO t (c1, c2, ...) VALUES (e1, e2, ...)
//! UPDATE t SET c1 = e1, ... WHERE p1 AND p2 ...
//! DELETE FROM t WHERE p1 AND p2 ...
//! SELECT 1 | * | c1, ... FROM t [WHERE p1 AND p2 ...]
//! ```
//!
//! where `e` is a parameter (`?`, `$n` or `@name`) or a literal, and a
//! predicate `p` is `c = e` or `c IS NULL`. Columns may be qualified with the
//! target table. Anything else (OR, joins, sub-queries, comparison operators
//! other than `=`, expressions on the right-hand side) is rejected, which
//! makes the caller fall back to textual execution.

use sqlparser::ast::{
    AssignmentTarget, BinaryOperator, Delete, Expr, FromTable, FunctionArguments, Ident, Insert,
    ObjectName, ObjectNamePart, Query, SelectItem, SetExpr, Statement, TableFactor, TableObject,
    TableWithJoins, UnaryOperator, Update, Value as AstValue, ValueWithSpan,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::ClassifyError;

/// Literal appearing in place of a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlLiteral {
    Null,
    Bool(bool),
    Integer(i64),
    /// Kept as written so it renders back unchanged.
    Float(String),
    String(String),
    PendingCommitTimestamp,
}

impl SqlLiteral {
    /// Render the literal back into statement text.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            SqlLiteral::Null => "NULL".to_owned(),
            SqlLiteral::Bool(true) => "TRUE".to_owned(),
            SqlLiteral::Bool(false) => "FALSE".to_owned(),
            SqlLiteral::Integer(i) => i.to_string(),
            SqlLiteral::Float(f) => f.clone(),
            SqlLiteral::String(s) => format!("'{}'", s.replace('\'', "''")),
            SqlLiteral::PendingCommitTimestamp => "PENDING_COMMIT_TIMESTAMP()".to_owned(),
        }
    }
}

/// Right-hand side of an assignment or an equality predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Zero-based ordinal of the parameter in statement text order.
    Param(usize),
    Literal(SqlLiteral),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq { column: String, value: Operand },
    IsNull { column: String },
}

impl Predicate {
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. } | Predicate::IsNull { column } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// `SELECT 1`
    Exists,
    /// `SELECT *`
    All,
    Columns(Vec<String>),
}

/// A recognized statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementShape {
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Operand>,
    },
    Update {
        table: String,
        assignments: Vec<Assignment>,
        predicates: Vec<Predicate>,
    },
    Delete {
        table: String,
        predicates: Vec<Predicate>,
    },
    Select {
        table: String,
        projection: Projection,
        predicates: Vec<Predicate>,
    },
}

impl StatementShape {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            StatementShape::Insert { table, .. }
            | StatementShape::Update { table, .. }
            | StatementShape::Delete { table, .. }
            | StatementShape::Select { table, .. } => table,
        }
    }
}

/// Assigns parameter ordinals in statement text order.
///
/// `$n` names its ordinal explicitly; `?` and `@name` take the next one.
#[derive(Debug, Default)]
struct Params {
    next: usize,
}

impl Params {
    fn take(&mut self, placeholder: &str) -> Result<usize, ClassifyError> {
        let ordinal = match placeholder.strip_prefix('$') {
            Some(n) => n
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .ok_or_else(|| ClassifyError::new(format!("invalid parameter '{placeholder}'")))?,
            None => self.next,
        };
        self.next += 1;
        Ok(ordinal)
    }
}

fn ident_name(ident: &Ident) -> String {
    ident.value.clone()
}

/// Last part of a possibly qualified name.
fn terminal(name: &ObjectName) -> Result<String, ClassifyError> {
    name.0
        .last()
        .and_then(ObjectNamePart::as_ident)
        .map(ident_name)
        .ok_or_else(|| ClassifyError::new(format!("unsupported name '{name}'")))
}

fn single_table(from: &TableWithJoins) -> Result<String, ClassifyError> {
    if !from.joins.is_empty() {
        return Err(ClassifyError::new("joins are not supported"));
    }
    match &from.relation {
        TableFactor::Table {
            name, alias: None, ..
        } => terminal(name),
        other => Err(ClassifyError::new(format!("unsupported table '{other}'"))),
    }
}

fn only_table(from: &[TableWithJoins]) -> Result<String, ClassifyError> {
    match from {
        [table] => single_table(table),
        _ => Err(ClassifyError::new("expected exactly one table")),
    }
}

/// Column reference, optionally qualified with `table`.
fn column(expr: &Expr, table: &str) -> Result<String, ClassifyError> {
    match expr {
        Expr::Identifier(ident) if !is_named_param(ident) => Ok(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [qualifier, column] if qualifier.value.eq_ignore_ascii_case(table) => {
                Ok(ident_name(column))
            }
            _ => Err(ClassifyError::new(format!(
                "column '{expr}' is not qualified with '{table}'"
            ))),
        },
        Expr::Nested(inner) => column(inner, table),
        other => Err(ClassifyError::new(format!("expected a column, found '{other}'"))),
    }
}

/// `@name` lexes as a bare identifier in the generic dialect.
fn is_named_param(ident: &Ident) -> bool {
    ident.quote_style.is_none() && ident.value.starts_with('@')
}

fn number(text: &str, negative: bool) -> Result<SqlLiteral, ClassifyError> {
    let text = if negative {
        format!("-{text}")
    } else {
        text.to_owned()
    };
    if let Ok(i) = text.parse::<i64>() {
        return Ok(SqlLiteral::Integer(i));
    }
    text.parse::<f64>()
        .map(|_| SqlLiteral::Float(text.clone()))
        .map_err(|_| ClassifyError::new(format!("invalid number '{text}'")))
}

fn is_pending_commit_timestamp(expr: &Expr) -> bool {
    let Expr::Function(f) = expr else {
        return false;
    };
    let no_args = match &f.args {
        FunctionArguments::None => true,
        FunctionArguments::List(list) => list.args.is_empty(),
        FunctionArguments::Subquery(_) => false,
    };
    no_args
        && terminal(&f.name).is_ok_and(|n| n.eq_ignore_ascii_case("PENDING_COMMIT_TIMESTAMP"))
}

fn operand(expr: &Expr, params: &mut Params) -> Result<Operand, ClassifyError> {
    let lit = match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            AstValue::Placeholder(p) => return params.take(p).map(Operand::Param),
            AstValue::Null => SqlLiteral::Null,
            AstValue::Boolean(b) => SqlLiteral::Bool(*b),
            AstValue::Number(n, _) => number(n, false)?,
            AstValue::SingleQuotedString(s) => SqlLiteral::String(s.clone()),
            other => return Err(ClassifyError::new(format!("unsupported literal '{other}'"))),
        },
        Expr::Identifier(ident) if is_named_param(ident) => {
            return params.take(&ident.value).map(Operand::Param);
        }
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match inner.as_ref() {
            Expr::Value(ValueWithSpan {
                value: AstValue::Number(n, _),
                ..
            }) => number(n, true)?,
            other => return Err(ClassifyError::new(format!("unsupported expression '-{other}'"))),
        },
        Expr::Nested(inner) => return operand(inner, params),
        e if is_pending_commit_timestamp(e) => SqlLiteral::PendingCommitTimestamp,
        other => return Err(ClassifyError::new(format!("unsupported expression '{other}'"))),
    };
    Ok(Operand::Literal(lit))
}

/// Flatten `p1 AND p2 AND ...` left to right.
fn conjuncts(
    expr: &Expr,
    table: &str,
    params: &mut Params,
    out: &mut Vec<Predicate>,
) -> Result<(), ClassifyError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, table, params, out)?;
            conjuncts(right, table, params, out)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let column = column(left, table)?;
            let value = operand(right, params)?;
            out.push(Predicate::Eq { column, value });
            Ok(())
        }
        Expr::IsNull(inner) => {
            out.push(Predicate::IsNull {
                column: column(inner, table)?,
            });
            Ok(())
        }
        Expr::Nested(inner) => conjuncts(inner, table, params, out),
        other => Err(ClassifyError::new(format!("unsupported predicate '{other}'"))),
    }
}

fn predicates(
    selection: Option<&Expr>,
    table: &str,
    params: &mut Params,
) -> Result<Vec<Predicate>, ClassifyError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        conjuncts(expr, table, params, &mut out)?;
    }
    Ok(out)
}

fn insert_shape(insert: &Insert, params: &mut Params) -> Result<StatementShape, ClassifyError> {
    if insert.on.is_some() || insert.returning.is_some() {
        return Err(ClassifyError::new("upsert and RETURNING are not supported"));
    }
    let TableObject::TableName(name) = &insert.table else {
        return Err(ClassifyError::new("expected a table name"));
    };
    let table = terminal(name)?;
    let rows = match insert.source.as_deref().map(|q| q.body.as_ref()) {
        Some(SetExpr::Values(values)) => &values.rows,
        _ => return Err(ClassifyError::new("expected VALUES")),
    };
    let [row] = rows.as_slice() else {
        return Err(ClassifyError::new("expected exactly one VALUES row"));
    };
    let columns: Vec<String> = insert.columns.iter().map(ident_name).collect();
    if columns.len() != row.len() {
        return Err(ClassifyError::new(format!(
            "{} column(s) but {} value(s)",
            columns.len(),
            row.len()
        )));
    }
    let values = row
        .iter()
        .map(|e| operand(e, params))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(StatementShape::Insert {
        table,
        columns,
        values,
    })
}

fn update_shape(update: &Update, params: &mut Params) -> Result<StatementShape, ClassifyError> {
    if update.from.is_some() || update.returning.is_some() {
        return Err(ClassifyError::new("UPDATE ... FROM and RETURNING are not supported"));
    }
    let table = single_table(&update.table)?;
    // SET operands come before WHERE operands in text order.
    let mut assignments = Vec::with_capacity(update.assignments.len());
    for a in &update.assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(ClassifyError::new("tuple assignments are not supported"));
        };
        let column = match name.0.as_slice() {
            [_] => terminal(name)?,
            [qualifier, _]
                if qualifier
                    .as_ident()
                    .is_some_and(|q| q.value.eq_ignore_ascii_case(&table)) =>
            {
                terminal(name)?
            }
            _ => return Err(ClassifyError::new(format!("unsupported SET target '{name}'"))),
        };
        let value = operand(&a.value, params)?;
        assignments.push(Assignment { column, value });
    }
    let Some(selection) = &update.selection else {
        return Err(ClassifyError::new("UPDATE without WHERE"));
    };
    let predicates = predicates(Some(selection), &table, params)?;
    Ok(StatementShape::Update {
        table,
        assignments,
        predicates,
    })
}

fn delete_shape(delete: &Delete, params: &mut Params) -> Result<StatementShape, ClassifyError> {
    if !delete.tables.is_empty() || delete.using.is_some() || delete.returning.is_some() {
        return Err(ClassifyError::new("multi-table DELETE and RETURNING are not supported"));
    }
    let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) = &delete.from;
    let table = only_table(from)?;
    let Some(selection) = &delete.selection else {
        return Err(ClassifyError::new("DELETE without WHERE"));
    };
    let predicates = predicates(Some(selection), &table, params)?;
    Ok(StatementShape::Delete { table, predicates })
}

fn projection(items: &[SelectItem], table: &str) -> Result<Projection, ClassifyError> {
    match items {
        [SelectItem::Wildcard(_)] => Ok(Projection::All),
        [SelectItem::UnnamedExpr(Expr::Value(ValueWithSpan {
            value: AstValue::Number(n, _),
            ..
        }))] if n == "1" => Ok(Projection::Exists),
        _ => items
            .iter()
            .map(|item| match item {
                SelectItem::UnnamedExpr(expr) => column(expr, table),
                other => Err(ClassifyError::new(format!("unsupported projection '{other}'"))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Projection::Columns),
    }
}

fn select_shape(query: &Query, params: &mut Params) -> Result<StatementShape, ClassifyError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(ClassifyError::new("expected a plain SELECT"));
    };
    let table = only_table(&select.from)?;
    let projection = projection(&select.projection, &table)?;
    let predicates = predicates(select.selection.as_ref(), &table, params)?;
    Ok(StatementShape::Select {
        table,
        projection,
        predicates,
    })
}

/// Parse a statement into its shape.
///
/// # Errors
/// Returns `ClassifyError` when the text does not parse or is not one of the
/// accepted shapes.
pub fn parse(sql: &str) -> Result<StatementShape, ClassifyError> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)?;
    let [statement] = statements.as_slice() else {
        return Err(ClassifyError::new(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    };
    let mut params = Params::default();
    match statement {
        Statement::Insert(insert) => insert_shape(insert, &mut params),
        Statement::Update(update) => update_shape(update, &mut params),
        Statement::Delete(delete) => delete_shape(delete, &mut params),
        Statement::Query(query) => select_shape(query, &mut params),
        _ => Err(ClassifyError::new("expected INSERT, UPDATE, DELETE or SELECT")),
    }
}
