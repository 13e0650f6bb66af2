//! Dual-form write commands.
//!
//! A [`DualFormCommand`] carries the same logical write twice: as a textual DML
//! statement and, when the statement shape allows it, as a structured mutation.
//! Parameter values bound on the textual side are mirrored into the structured
//! slots so the execution path can be chosen as late as flush time.

use sea_orm::Value;

use crate::error::BatchError;
use crate::sql_shape::SqlLiteral;

/// Kind of write a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        })
    }
}

/// Value carried by a structured mutation column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Value(Value),
    Null,
    /// Filled in by the database with the transaction's commit timestamp.
    PendingCommitTimestamp,
}

impl From<Value> for ColumnValue {
    fn from(v: Value) -> Self {
        ColumnValue::Value(v)
    }
}

impl From<&SqlLiteral> for ColumnValue {
    fn from(lit: &SqlLiteral) -> Self {
        match lit {
            SqlLiteral::Null => ColumnValue::Null,
            SqlLiteral::Bool(b) => ColumnValue::Value(Value::from(*b)),
            SqlLiteral::Integer(i) => ColumnValue::Value(Value::from(*i)),
            SqlLiteral::Float(f) => ColumnValue::Value(Value::Double(f.parse().ok())),
            SqlLiteral::String(s) => ColumnValue::Value(Value::from(s.clone())),
            SqlLiteral::PendingCommitTimestamp => ColumnValue::PendingCommitTimestamp,
        }
    }
}

/// Textual statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlStatement {
    pub sql: String,
    /// `None` means not yet bound.
    pub params: Vec<Option<Value>>,
}

impl DmlStatement {
    /// Statement with `param_count` unbound parameters.
    pub fn new(sql: impl Into<String>, param_count: usize) -> Self {
        Self {
            sql: sql.into(),
            params: vec![None; param_count],
        }
    }

    /// Statement with all parameters bound.
    pub fn with_params(sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        Self {
            sql: sql.into(),
            params: params.into_iter().map(Some).collect(),
        }
    }

    /// Bound parameter values, or the index of the first unbound one.
    ///
    /// # Errors
    /// Returns the index of the first unbound parameter.
    pub fn bound_params(&self) -> Result<Vec<Value>, usize> {
        self.params
            .iter()
            .enumerate()
            .map(|(i, p)| p.clone().ok_or(i))
            .collect()
    }
}

/// One column of the structured form.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredSlot {
    pub column: String,
    pub value: Option<ColumnValue>,
    /// Fixed values (defaults, discriminators) are never overwritten.
    pub fixed: bool,
}

impl StructuredSlot {
    pub(crate) fn open(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: None,
            fixed: false,
        }
    }

    pub(crate) fn fixed(column: impl Into<String>, value: ColumnValue) -> Self {
        Self {
            column: column.into(),
            value: Some(value),
            fixed: true,
        }
    }
}

/// Where a textual parameter lands in the structured form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamTarget {
    /// Mirrored into the structured slot at this index.
    Slot(usize),
    /// Expected (old) version; only used by the version check.
    ExpectedVersion,
}

/// Existence query guarding a versioned update/delete on the mutation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub table: String,
    pub key_columns: Vec<String>,
    pub version_column: String,
    /// `SELECT 1 FROM t WHERE k = ? AND v = ?` (or `v IS NULL`).
    pub sql: String,
    /// Textual parameter index feeding each `?` of `sql`, in order.
    pub param_sources: Vec<usize>,
}

impl VersionCheck {
    /// Bind the check query from the command's textual parameters.
    ///
    /// # Errors
    /// Returns `BatchError::UnboundParameter` when a source parameter is unbound.
    pub fn statement(&self, textual: &DmlStatement) -> Result<DmlStatement, BatchError> {
        let mut params = Vec::with_capacity(self.param_sources.len());
        for &src in &self.param_sources {
            let value = textual.params.get(src).cloned().flatten().ok_or_else(|| {
                BatchError::UnboundParameter {
                    table: self.table.clone(),
                    index: src,
                }
            })?;
            params.push(value);
        }
        Ok(DmlStatement::with_params(self.sql.clone(), params))
    }
}

/// Structured (mutation) encoding of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredForm {
    pub kind: WriteKind,
    pub table: String,
    pub slots: Vec<StructuredSlot>,
    pub key_columns: Vec<String>,
    /// Present only when the entity has an optimistic version column and the
    /// write is an update or delete.
    pub version_check: Option<VersionCheck>,
}

impl StructuredForm {
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.column.as_str()).collect()
    }

    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.version_check.is_some()
    }
}

/// Mutation as handed to the database client.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub op: WriteKind,
    pub table: String,
    /// For deletes these are the key columns.
    pub columns: Vec<String>,
    pub values: Vec<ColumnValue>,
}

/// One logical write with a textual and an optional structured encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DualFormCommand {
    pub(crate) kind: WriteKind,
    pub(crate) table: String,
    pub(crate) textual: DmlStatement,
    pub(crate) structured: Option<StructuredForm>,
    /// One entry per textual parameter; empty when there is no structured form.
    pub(crate) targets: Vec<ParamTarget>,
}

impl DualFormCommand {
    /// DML-only command; used when the statement shape was not recognized.
    pub fn textual_only(kind: WriteKind, table: impl Into<String>, textual: DmlStatement) -> Self {
        Self {
            kind,
            table: table.into(),
            textual,
            structured: None,
            targets: Vec::new(),
        }
    }

    pub(crate) fn dual(
        kind: WriteKind,
        textual: DmlStatement,
        structured: StructuredForm,
        targets: Vec<ParamTarget>,
    ) -> Self {
        debug_assert_eq!(targets.len(), textual.params.len());
        Self {
            kind,
            table: structured.table.clone(),
            textual,
            structured: Some(structured),
            targets,
        }
    }

    #[must_use]
    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn textual(&self) -> &DmlStatement {
        &self.textual
    }

    #[must_use]
    pub fn structured(&self) -> Option<&StructuredForm> {
        self.structured.as_ref()
    }

    #[must_use]
    pub fn has_structured_form(&self) -> bool {
        self.structured.is_some()
    }

    #[must_use]
    pub fn version_check(&self) -> Option<&VersionCheck> {
        self.structured.as_ref()?.version_check.as_ref()
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.textual.params.len()
    }

    /// Bind a parameter on both forms.
    ///
    /// The structured slot is left alone when it carries a fixed value.
    ///
    /// # Errors
    /// Returns `BatchError::ParameterOutOfRange` for an unknown index.
    pub fn set_parameter(&mut self, index: usize, value: impl Into<Value>) -> Result<(), BatchError> {
        let value = value.into();
        self.bind_textual(index, value.clone())?;
        if let (Some(form), Some(ParamTarget::Slot(slot))) =
            (self.structured.as_mut(), self.targets.get(index))
        {
            let slot = &mut form.slots[*slot];
            if !slot.fixed {
                slot.value = Some(ColumnValue::Value(value));
            }
        }
        Ok(())
    }

    /// Bind a parameter on the textual form only.
    ///
    /// Mirrors how values arrive when the ORM binds a prepared command directly.
    /// Any value previously mirrored into the structured slot is dropped;
    /// [`finalize_structured`](Self::finalize_structured) copies the new one over.
    ///
    /// # Errors
    /// Returns `BatchError::ParameterOutOfRange` for an unknown index.
    pub fn bind_textual(&mut self, index: usize, value: impl Into<Value>) -> Result<(), BatchError> {
        let count = self.textual.params.len();
        let param = self
            .textual
            .params
            .get_mut(index)
            .ok_or_else(|| BatchError::ParameterOutOfRange {
                table: self.table.clone(),
                index,
                count,
            })?;
        *param = Some(value.into());
        if let (Some(form), Some(ParamTarget::Slot(slot))) =
            (self.structured.as_mut(), self.targets.get(index))
        {
            let slot = &mut form.slots[*slot];
            if !slot.fixed {
                slot.value = None;
            }
        }
        Ok(())
    }

    /// Refresh every open structured slot from its textual parameter.
    ///
    /// The textual form is authoritative: a slot always ends up holding the
    /// latest textual value. Fixed slots are never touched. A no-op for
    /// DML-only commands.
    ///
    /// # Errors
    /// Returns `BatchError::UnboundParameter` with the textual ordinal of the
    /// first parameter feeding a slot that was never bound.
    pub fn finalize_structured(&mut self) -> Result<(), BatchError> {
        let Some(form) = self.structured.as_mut() else {
            return Ok(());
        };
        for (index, target) in self.targets.iter().enumerate() {
            let ParamTarget::Slot(slot) = *target else {
                continue;
            };
            let slot = &mut form.slots[slot];
            if slot.fixed {
                continue;
            }
            let value = self.textual.params[index].clone().ok_or_else(|| {
                BatchError::UnboundParameter {
                    table: self.table.clone(),
                    index,
                }
            })?;
            slot.value = Some(ColumnValue::Value(value));
        }
        Ok(())
    }

    /// Textual ordinal feeding structured slot `slot`, or `slot` itself when
    /// no parameter targets it.
    fn param_for_slot(&self, slot: usize) -> usize {
        self.targets
            .iter()
            .position(|t| *t == ParamTarget::Slot(slot))
            .unwrap_or(slot)
    }

    /// Build the mutation sent to the client.
    ///
    /// Returns `None` for DML-only commands.
    ///
    /// # Errors
    /// Returns `BatchError::UnboundParameter` if a slot is still unset.
    pub fn to_mutation(&self) -> Result<Option<Mutation>, BatchError> {
        let Some(form) = &self.structured else {
            return Ok(None);
        };
        let mut columns = Vec::with_capacity(form.slots.len());
        let mut values = Vec::with_capacity(form.slots.len());
        for (i, slot) in form.slots.iter().enumerate() {
            if form.kind == WriteKind::Delete && !form.key_columns.contains(&slot.column) {
                continue;
            }
            let value = slot.value.clone().ok_or_else(|| BatchError::UnboundParameter {
                table: form.table.clone(),
                index: self.param_for_slot(i),
            })?;
            columns.push(slot.column.clone());
            values.push(value);
        }
        Ok(Some(Mutation {
            op: form.kind,
            table: form.table.clone(),
            columns,
            values,
        }))
    }
}
