//! Dimension values and the canonical dimension set of a count.

use crate::error::{MetricError, Result};
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::ToSql;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Value type of a dimension field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Number,
    /// Unix milliseconds, stored with the numbers
    Date,
    Uuid,
    Location,
}

impl ValueKind {
    pub fn index_table(self) -> IndexTable {
        match self {
            ValueKind::Text => IndexTable::String,
            ValueKind::Number | ValueKind::Date => IndexTable::Number,
            ValueKind::Uuid => IndexTable::Uuid,
            ValueKind::Location => IndexTable::Location,
        }
    }
}

/// Type-partitioned table holding dimension rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexTable {
    String,
    Number,
    Uuid,
    Location,
}

impl IndexTable {
    pub const ALL: [IndexTable; 4] = [
        IndexTable::String,
        IndexTable::Number,
        IndexTable::Uuid,
        IndexTable::Location,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            IndexTable::String => "CountRecordString",
            IndexTable::Number => "CountRecordNumber",
            IndexTable::Uuid => "CountRecordUuid",
            IndexTable::Location => "CountRecordLocation",
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            IndexTable::String | IndexTable::Location => "TEXT",
            IndexTable::Number => "REAL",
            IndexTable::Uuid => "BLOB",
        }
    }

    fn label(self) -> &'static str {
        match self {
            IndexTable::String => "text",
            IndexTable::Number => "numeric",
            IndexTable::Uuid => "uuid",
            IndexTable::Location => "location",
        }
    }
}

/// Describes the field a dimension is read from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    /// Name of the declaring type, used as the symbol namespace
    pub owner: String,
    pub internal_name: String,
    pub kind: ValueKind,
}

impl FieldDescriptor {
    pub fn new(owner: impl Into<String>, internal_name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            owner: owner.into(),
            internal_name: internal_name.into(),
            kind,
        }
    }

    /// `owner/internal_name`, or the bare name for an unowned field.
    pub fn unique_name(&self) -> String {
        if self.owner.is_empty() {
            self.internal_name.clone()
        } else {
            format!("{}/{}", self.owner, self.internal_name)
        }
    }
}

/// One value of a dimension.
#[derive(Clone, Debug)]
pub enum DimensionValue {
    Text(String),
    Number(f64),
    Uuid(Uuid),
    Location { latitude: f64, longitude: f64 },
}

impl DimensionValue {
    /// A date, stored as its Unix millisecond number.
    pub fn date(millis: i64) -> Self {
        DimensionValue::Number(millis as f64)
    }

    pub fn index_table(&self) -> IndexTable {
        match self {
            DimensionValue::Text(_) => IndexTable::String,
            DimensionValue::Number(_) => IndexTable::Number,
            DimensionValue::Uuid(_) => IndexTable::Uuid,
            DimensionValue::Location { .. } => IndexTable::Location,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DimensionValue::Text(_) => 0,
            DimensionValue::Number(_) => 1,
            DimensionValue::Uuid(_) => 2,
            DimensionValue::Location { .. } => 3,
        }
    }

    pub fn to_sql_value(&self) -> Value {
        match self {
            DimensionValue::Text(text) => Value::Text(text.clone()),
            DimensionValue::Number(n) => Value::Real(*n),
            DimensionValue::Uuid(id) => Value::Blob(id.as_bytes().to_vec()),
            DimensionValue::Location {
                latitude,
                longitude,
            } => Value::Text(format!("{} {}", latitude, longitude)),
        }
    }
}

impl Ord for DimensionValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DimensionValue::Text(a), DimensionValue::Text(b)) => a.cmp(b),
            (DimensionValue::Number(a), DimensionValue::Number(b)) => a.total_cmp(b),
            (DimensionValue::Uuid(a), DimensionValue::Uuid(b)) => a.cmp(b),
            (
                DimensionValue::Location {
                    latitude: a1,
                    longitude: o1,
                },
                DimensionValue::Location {
                    latitude: a2,
                    longitude: o2,
                },
            ) => a1.total_cmp(a2).then(o1.total_cmp(o2)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for DimensionValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DimensionValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DimensionValue {}

impl Hash for DimensionValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            DimensionValue::Text(text) => text.hash(state),
            DimensionValue::Number(n) => n.to_bits().hash(state),
            DimensionValue::Uuid(id) => id.hash(state),
            DimensionValue::Location {
                latitude,
                longitude,
            } => {
                latitude.to_bits().hash(state);
                longitude.to_bits().hash(state);
            }
        }
    }
}

impl ToSql for DimensionValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.to_sql_value()))
    }
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Text(text) => f.write_str(text),
            DimensionValue::Number(n) => write!(f, "{}", n),
            DimensionValue::Uuid(id) => write!(f, "{}", id),
            DimensionValue::Location {
                latitude,
                longitude,
            } => write!(f, "({}, {})", latitude, longitude),
        }
    }
}

impl From<&str> for DimensionValue {
    fn from(text: &str) -> Self {
        DimensionValue::Text(text.to_string())
    }
}

impl From<String> for DimensionValue {
    fn from(text: String) -> Self {
        DimensionValue::Text(text)
    }
}

impl From<f64> for DimensionValue {
    fn from(n: f64) -> Self {
        DimensionValue::Number(n)
    }
}

impl From<i64> for DimensionValue {
    fn from(n: i64) -> Self {
        DimensionValue::Number(n as f64)
    }
}

impl From<Uuid> for DimensionValue {
    fn from(id: Uuid) -> Self {
        DimensionValue::Uuid(id)
    }
}

/// A field together with the distinct values recorded for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dimension {
    field: FieldDescriptor,
    values: BTreeSet<DimensionValue>,
}

impl Dimension {
    /// Fails when a value does not belong in the field's index table.
    pub fn new<I, V>(field: FieldDescriptor, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<DimensionValue>,
    {
        let expected = field.kind.index_table();
        let mut set = BTreeSet::new();
        for value in values {
            let value = value.into();
            if value.index_table() != expected {
                return Err(MetricError::DimensionMismatch {
                    field: field.unique_name(),
                    expected: expected.label(),
                    found: value.index_table().label(),
                });
            }
            set.insert(value);
        }
        Ok(Self { field, values: set })
    }

    pub fn field(&self) -> &FieldDescriptor {
        &self.field
    }

    pub fn key(&self) -> String {
        self.field.unique_name()
    }

    pub fn values(&self) -> &BTreeSet<DimensionValue> {
        &self.values
    }

    pub fn index_table(&self) -> IndexTable {
        self.field.kind.index_table()
    }
}

/// Ordered set of dimensions, unique by field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DimensionSet {
    dimensions: Vec<Dimension>,
}

impl DimensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dimension. Values for an already present field are merged.
    /// A dimension without values is skipped.
    pub fn insert(&mut self, dimension: Dimension) {
        if dimension.values.is_empty() {
            return;
        }
        match self
            .dimensions
            .iter_mut()
            .find(|d| d.field == dimension.field)
        {
            Some(existing) => existing.values.extend(dimension.values),
            None => self.dimensions.push(dimension),
        }
    }

    /// Builder form of [`DimensionSet::insert`].
    pub fn with<I, V>(mut self, field: FieldDescriptor, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<DimensionValue>,
    {
        self.insert(Dimension::new(field, values)?);
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter()
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Index tables in first-use order.
    pub fn index_tables(&self) -> Vec<IndexTable> {
        let mut tables = Vec::new();
        for dimension in &self.dimensions {
            let table = dimension.index_table();
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        tables
    }

    pub fn in_table(&self, table: IndexTable) -> impl Iterator<Item = &Dimension> {
        self.dimensions
            .iter()
            .filter(move |d| d.index_table() == table)
    }

    /// Canonical name of the combination of fields.
    ///
    /// Dimensions are sorted by key. Each run of keys sharing a namespace
    /// prints the namespace once followed by `/`; each field contributes
    /// its name and, when it carries several values, `[n]`. Entries are
    /// comma separated and the whole symbol ends in `#count`.
    pub fn symbol(&self) -> String {
        let mut sorted: Vec<&Dimension> = self.dimensions.iter().collect();
        sorted.sort_by_key(|d| d.key());

        let mut symbol = String::new();
        let mut namespace: Option<String> = None;
        for dimension in sorted {
            let key = dimension.key();
            let (prefix, name) = match key.split_once('/') {
                Some((prefix, name)) => (Some(prefix), name),
                None => (None, key.as_str()),
            };
            if namespace.as_deref() != prefix {
                if let Some(prefix) = prefix {
                    symbol.push_str(prefix);
                    symbol.push('/');
                }
                namespace = prefix.map(str::to_string);
            }
            symbol.push_str(name);
            if dimension.values.len() > 1 {
                symbol.push_str(&format!("[{}]", dimension.values.len()));
            }
            symbol.push(',');
        }
        if symbol.ends_with(',') {
            symbol.pop();
        }
        symbol.push_str("#count");
        symbol
    }
}
