//! Statement classification.
//!
//! Turns ORM write intents into [`DualFormCommand`]s. The textual form follows
//! the usual DML synthesis rules; the structured form is then recovered by
//! reading the textual statement back, because only the textual statement
//! says which parameters are assignments and which are key/version predicates.

use tracing::debug;

use crate::command::{
    ColumnValue, DmlStatement, DualFormCommand, ParamTarget, StructuredForm, StructuredSlot,
    VersionCheck, WriteKind,
};
use crate::error::{BatchError, ClassifyError};
use crate::sql_shape::{self, Operand, Predicate, SqlLiteral, StatementShape};

/// Mapping of one entity property onto a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub insertable: bool,
    pub updatable: bool,
}

/// Column that always carries a fixed value instead of a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedColumn {
    pub column: String,
    pub value: SqlLiteral,
    pub on_insert: bool,
    pub on_update: bool,
}

impl FixedColumn {
    /// A column set to the commit timestamp on every insert and update.
    #[must_use]
    pub fn commit_timestamp(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: SqlLiteral::PendingCommitTimestamp,
            on_insert: true,
            on_update: true,
        }
    }

    fn applies_to(&self, kind: WriteKind) -> bool {
        match kind {
            WriteKind::Insert => self.on_insert,
            WriteKind::Update => self.on_update,
            WriteKind::Delete => false,
        }
    }
}

/// Discriminator for single-table-per-hierarchy polymorphism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discriminator {
    pub column: String,
    pub value: SqlLiteral,
}

/// Entity metadata needed to classify its writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    pub table: String,
    pub columns: Vec<ColumnMapping>,
    pub key_columns: Vec<String>,
    pub version_column: Option<String>,
    pub fixed: Vec<FixedColumn>,
    pub discriminator: Option<Discriminator>,
}

impl EntityMapping {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            key_columns: Vec::new(),
            version_column: None,
            fixed: Vec::new(),
            discriminator: None,
        }
    }

    /// Insertable and updatable property column.
    #[must_use]
    pub fn column(self, name: impl Into<String>) -> Self {
        self.column_with(name, true, true)
    }

    #[must_use]
    pub fn column_with(mut self, name: impl Into<String>, insertable: bool, updatable: bool) -> Self {
        self.columns.push(ColumnMapping {
            name: name.into(),
            insertable,
            updatable,
        });
        self
    }

    #[must_use]
    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.key_columns.push(name.into());
        self
    }

    /// Optimistic version column. Also mapped as a regular property so the new
    /// version is written on insert and update.
    #[must_use]
    pub fn version(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(&name)) {
            self.columns.push(ColumnMapping {
                name: name.clone(),
                insertable: true,
                updatable: true,
            });
        }
        self.version_column = Some(name);
        self
    }

    #[must_use]
    pub fn fixed(mut self, fixed: FixedColumn) -> Self {
        self.fixed.push(fixed);
        self
    }

    #[must_use]
    pub fn discriminator(mut self, column: impl Into<String>, value: SqlLiteral) -> Self {
        self.discriminator = Some(Discriminator {
            column: column.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    fn is_key(&self, column: &str) -> bool {
        self.key_columns
            .iter()
            .any(|k| k.eq_ignore_ascii_case(column))
    }

    fn is_version(&self, column: &str) -> bool {
        self.version_column
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(column))
    }

    fn fixed_for(&self, column: &str, kind: WriteKind) -> Option<&FixedColumn> {
        self.fixed
            .iter()
            .find(|f| f.applies_to(kind) && f.column.eq_ignore_ascii_case(column))
    }

    fn invalid(&self, message: impl Into<String>) -> BatchError {
        BatchError::InvalidMapping {
            table: self.table.clone(),
            message: message.into(),
        }
    }
}

fn quote(ident: &str) -> String {
    format!("`{ident}`")
}

/// Builds dual-form commands from entity mappings.
///
/// Stateless; classifying the same intent twice yields identical commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementClassifier;

impl StatementClassifier {
    /// Synthesize the write for `mapping` and derive its structured form.
    ///
    /// # Errors
    /// Returns `BatchError::InvalidMapping` when the mapping cannot produce a
    /// statement of this kind (no key columns, nothing to insert or update).
    pub fn classify(
        &self,
        mapping: &EntityMapping,
        kind: WriteKind,
    ) -> Result<DualFormCommand, BatchError> {
        let textual = match kind {
            WriteKind::Insert => Self::insert_sql(mapping)?,
            WriteKind::Update => Self::update_sql(mapping)?,
            WriteKind::Delete => Self::delete_sql(mapping)?,
        };
        Ok(self.classify_statement(mapping, kind, textual))
    }

    /// Derive the structured form of an ORM-generated statement.
    ///
    /// Shapes that cannot be expressed as a mutation degrade to a DML-only
    /// command; this never fails.
    #[must_use]
    #[allow(clippy::unused_self)] // method form keeps call sites uniform with `classify`
    pub fn classify_statement(
        &self,
        mapping: &EntityMapping,
        kind: WriteKind,
        textual: DmlStatement,
    ) -> DualFormCommand {
        match derive_structured(mapping, kind, &textual.sql) {
            Ok((form, targets)) if targets.len() == textual.params.len() => {
                DualFormCommand::dual(kind, textual, form, targets)
            }
            Ok((_, targets)) => {
                debug!(
                    table = %mapping.table,
                    expected = targets.len(),
                    actual = textual.params.len(),
                    "parameter count mismatch; using DML only"
                );
                DualFormCommand::textual_only(kind, mapping.table.clone(), textual)
            }
            Err(e) => {
                debug!(table = %mapping.table, %kind, error = %e, "statement shape not recognized; using DML only");
                DualFormCommand::textual_only(kind, mapping.table.clone(), textual)
            }
        }
    }

    fn insert_sql(mapping: &EntityMapping) -> Result<DmlStatement, BatchError> {
        if mapping.key_columns.is_empty() {
            return Err(mapping.invalid("no key columns"));
        }
        let mut cols: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        for c in &mapping.columns {
            if c.insertable
                && !mapping.is_key(&c.name)
                && mapping.fixed_for(&c.name, WriteKind::Insert).is_none()
            {
                cols.push(&c.name);
                values.push("?".to_owned());
            }
        }
        for k in &mapping.key_columns {
            cols.push(k);
            values.push("?".to_owned());
        }
        let params = cols.len();
        for f in mapping.fixed.iter().filter(|f| f.on_insert) {
            cols.push(&f.column);
            values.push(f.value.to_sql());
        }
        if let Some(d) = &mapping.discriminator {
            cols.push(&d.column);
            values.push(d.value.to_sql());
        }
        let cols: Vec<String> = cols.into_iter().map(quote).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&mapping.table),
            cols.join(", "),
            values.join(", ")
        );
        Ok(DmlStatement::new(sql, params))
    }

    fn where_clause(mapping: &EntityMapping, sql: &mut String) -> usize {
        let mut params = 0;
        sql.push_str(" WHERE ");
        let mut preds: Vec<String> = mapping
            .key_columns
            .iter()
            .map(|k| format!("{} = ?", quote(k)))
            .collect();
        params += preds.len();
        if let Some(v) = &mapping.version_column {
            preds.push(format!("{} = ?", quote(v)));
            params += 1;
        }
        sql.push_str(&preds.join(" AND "));
        params
    }

    fn update_sql(mapping: &EntityMapping) -> Result<DmlStatement, BatchError> {
        if mapping.key_columns.is_empty() {
            return Err(mapping.invalid("no key columns"));
        }
        let mut sets: Vec<String> = Vec::new();
        let mut params = 0;
        for c in &mapping.columns {
            if c.updatable
                && !mapping.is_key(&c.name)
                && mapping.fixed_for(&c.name, WriteKind::Update).is_none()
            {
                sets.push(format!("{} = ?", quote(&c.name)));
                params += 1;
            }
        }
        for f in mapping.fixed.iter().filter(|f| f.on_update) {
            sets.push(format!("{} = {}", quote(&f.column), f.value.to_sql()));
        }
        if sets.is_empty() {
            return Err(mapping.invalid("no updatable columns"));
        }
        let mut sql = format!("UPDATE {} SET {}", quote(&mapping.table), sets.join(", "));
        params += Self::where_clause(mapping, &mut sql);
        Ok(DmlStatement::new(sql, params))
    }

    fn delete_sql(mapping: &EntityMapping) -> Result<DmlStatement, BatchError> {
        if mapping.key_columns.is_empty() {
            return Err(mapping.invalid("no key columns"));
        }
        let mut sql = format!("DELETE FROM {}", quote(&mapping.table));
        let params = Self::where_clause(mapping, &mut sql);
        Ok(DmlStatement::new(sql, params))
    }
}

/// Accumulates slots and parameter targets while walking a statement.
struct FormBuilder<'m> {
    mapping: &'m EntityMapping,
    slots: Vec<StructuredSlot>,
    appended: Vec<StructuredSlot>,
    targets: Vec<Option<ParamTarget>>,
}

impl<'m> FormBuilder<'m> {
    fn new(mapping: &'m EntityMapping) -> Self {
        Self {
            mapping,
            slots: Vec::new(),
            appended: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Each parameter feeds exactly one target.
    fn target(&mut self, ordinal: usize, target: ParamTarget) -> Result<(), ClassifyError> {
        if self.targets.len() <= ordinal {
            self.targets.resize(ordinal + 1, None);
        }
        if self.targets[ordinal].replace(target).is_some() {
            return Err(ClassifyError::new(format!(
                "parameter {ordinal} is used more than once"
            )));
        }
        Ok(())
    }

    fn canonical(&self, column: &str) -> String {
        self.mapping
            .columns
            .iter()
            .map(|c| &c.name)
            .chain(&self.mapping.key_columns)
            .find(|n| n.eq_ignore_ascii_case(column))
            .cloned()
            .unwrap_or_else(|| column.to_owned())
    }

    fn value_column(&mut self, column: &str, operand: &Operand) -> Result<(), ClassifyError> {
        let column = self.canonical(column);
        match operand {
            Operand::Param(ordinal) => {
                let slot = self.slots.len();
                self.target(*ordinal, ParamTarget::Slot(slot))?;
                self.slots.push(StructuredSlot::open(column));
            }
            Operand::Literal(lit) => {
                self.appended
                    .push(StructuredSlot::fixed(column, ColumnValue::from(lit)));
            }
        }
        Ok(())
    }

    fn finish(
        mut self,
        kind: WriteKind,
        version_check: Option<VersionCheck>,
    ) -> Result<(StructuredForm, Vec<ParamTarget>), ClassifyError> {
        let targets = self
            .targets
            .into_iter()
            .enumerate()
            .map(|(i, t)| t.ok_or_else(|| ClassifyError::new(format!("parameter {i} is not mapped"))))
            .collect::<Result<Vec<_>, _>>()?;
        self.slots.append(&mut self.appended);
        Ok((
            StructuredForm {
                kind,
                table: self.mapping.table.clone(),
                slots: self.slots,
                key_columns: self.mapping.key_columns.clone(),
                version_check,
            },
            targets,
        ))
    }
}

fn derive_structured(
    mapping: &EntityMapping,
    kind: WriteKind,
    sql: &str,
) -> Result<(StructuredForm, Vec<ParamTarget>), ClassifyError> {
    let shape = sql_shape::parse(sql)?;
    if !shape.table().eq_ignore_ascii_case(&mapping.table) {
        return Err(ClassifyError::new(format!(
            "statement targets '{}', mapping is for '{}'",
            shape.table(),
            mapping.table
        )));
    }
    let mut b = FormBuilder::new(mapping);
    match (kind, shape) {
        (WriteKind::Insert, StatementShape::Insert { columns, values, .. }) => {
            for (column, value) in columns.iter().zip(&values) {
                b.value_column(column, value)?;
            }
            b.finish(kind, None)
        }
        (WriteKind::Update, StatementShape::Update {
            assignments,
            predicates,
            ..
        }) => {
            // SET first, left to right; then WHERE.
            for a in &assignments {
                b.value_column(&a.column, &a.value)?;
            }
            let check = key_and_version_predicates(&mut b, &predicates)?;
            b.finish(kind, check)
        }
        (WriteKind::Delete, StatementShape::Delete { predicates, .. }) => {
            let check = key_and_version_predicates(&mut b, &predicates)?;
            b.finish(kind, check)
        }
        (kind, shape) => Err(ClassifyError::new(format!(
            "{kind} command carries a {} statement",
            shape_name(&shape)
        ))),
    }
}

fn shape_name(shape: &StatementShape) -> &'static str {
    match shape {
        StatementShape::Insert { .. } => "INSERT",
        StatementShape::Update { .. } => "UPDATE",
        StatementShape::Delete { .. } => "DELETE",
        StatementShape::Select { .. } => "SELECT",
    }
}

/// Walk the WHERE clause: key predicates become slots, the version predicate
/// feeds the version check. Any other predicate cannot be expressed by a
/// key-addressed mutation.
fn key_and_version_predicates(
    b: &mut FormBuilder<'_>,
    predicates: &[Predicate],
) -> Result<Option<VersionCheck>, ClassifyError> {
    let mapping = b.mapping;
    let mut key_sources: Vec<(String, usize)> = Vec::new();
    let mut version: Option<Option<usize>> = None;

    for p in predicates {
        let column = p.column();
        if mapping.is_version(column) {
            version = Some(match p {
                Predicate::Eq {
                    value: Operand::Param(ordinal),
                    ..
                } => {
                    b.target(*ordinal, ParamTarget::ExpectedVersion)?;
                    Some(*ordinal)
                }
                Predicate::IsNull { .. } => None,
                Predicate::Eq { .. } => {
                    return Err(ClassifyError::new("version predicate must be parameterized"));
                }
            });
        } else if mapping.is_key(column) {
            let Predicate::Eq {
                value: Operand::Param(ordinal),
                ..
            } = p
            else {
                return Err(ClassifyError::new(format!(
                    "key predicate on '{column}' must be parameterized"
                )));
            };
            let canonical = b.canonical(column);
            let slot = b.slots.len();
            b.target(*ordinal, ParamTarget::Slot(slot))?;
            b.slots.push(StructuredSlot::open(canonical.clone()));
            key_sources.push((canonical, *ordinal));
        } else {
            return Err(ClassifyError::new(format!("predicate on non-key column '{column}'")));
        }
    }

    if key_sources.len() != mapping.key_columns.len() {
        return Err(ClassifyError::new("WHERE clause does not cover the full key"));
    }

    let Some(version_column) = mapping.version_column.clone() else {
        return Ok(None);
    };
    let Some(expected) = version else {
        return Err(ClassifyError::new(format!(
            "versioned entity without a predicate on '{version_column}'"
        )));
    };

    let mut sql = format!("SELECT 1 FROM {} WHERE ", quote(&mapping.table));
    let mut preds: Vec<String> = key_sources
        .iter()
        .map(|(k, _)| format!("{} = ?", quote(k)))
        .collect();
    let mut param_sources: Vec<usize> = key_sources.iter().map(|(_, src)| *src).collect();
    match expected {
        Some(src) => {
            preds.push(format!("{} = ?", quote(&version_column)));
            param_sources.push(src);
        }
        None => preds.push(format!("{} IS NULL", quote(&version_column))),
    }
    sql.push_str(&preds.join(" AND "));

    Ok(Some(VersionCheck {
        table: mapping.table.clone(),
        key_columns: key_sources.into_iter().map(|(k, _)| k).collect(),
        version_column,
        sql,
        param_sources,
    }))
}
