//! Value types for cells of the remote object graph.
//!
//! A [`ValueType`] describes the set of values a cell may take on, plus
//! hints about how the value should be interpreted. Types arrive from
//! the server as a small tagged-union descriptor inside `register_cell`
//! messages and are decoded once, at registration time.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::unit::Unit;

/// Failure to decode a type descriptor. Fatal to the one message that
/// carried the descriptor, never to the connection.
#[derive(Debug, Error)]
pub enum TypeDecodeError {
    #[error("unknown type tag: {0}")]
    UnknownTag(String),
    #[error("malformed type descriptor: {0}")]
    Malformed(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("unknown bulk data format: info={info:?}, array={array:?}")]
    UnknownBulkFormat { info: String, array: String },
}

/// Metadata for one legal value of an enum-like type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumRow {
    /// Human-friendly replacement for the raw value.
    pub label: String,
    /// Longer text a UI might present as a tooltip.
    pub description: Option<String>,
    /// String used to order values for display.
    pub sort_key: String,
}

impl EnumRow {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            description: None,
            sort_key: label.to_string(),
        }
    }

    /// Decode a table entry. The server sends either a full `EnumRow`
    /// object or a bare string used as the label; missing fields fall
    /// back to the value's own key.
    pub fn from_descriptor(key: &str, descriptor: &Value) -> Result<Self, TypeDecodeError> {
        match descriptor {
            Value::Null => Ok(Self::new(key)),
            Value::String(label) => Ok(Self {
                label: label.clone(),
                description: None,
                sort_key: key.to_string(),
            }),
            Value::Object(fields) => {
                let label = match fields.get("label") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => key.to_string(),
                    Some(other) => {
                        return Err(TypeDecodeError::Malformed(format!(
                            "enum row label: {other}"
                        )))
                    }
                };
                let description = match fields.get("description") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => {
                        return Err(TypeDecodeError::Malformed(format!(
                            "enum row description: {other}"
                        )))
                    }
                };
                let sort_key = match fields.get("sort_key") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => key.to_string(),
                    Some(other) => {
                        return Err(TypeDecodeError::Malformed(format!(
                            "enum row sort_key: {other}"
                        )))
                    }
                };
                Ok(Self {
                    label,
                    description,
                    sort_key,
                })
            }
            other => Err(TypeDecodeError::Malformed(format!("enum row: {other}"))),
        }
    }

    pub fn to_descriptor(&self) -> Value {
        serde_json::json!({
            "type": "EnumRow",
            "label": self.label,
            "description": self.description,
            "sort_key": self.sort_key,
        })
    }
}

/// Finite value -> metadata mapping exposed by enum and range types.
pub type EnumTable = BTreeMap<String, EnumRow>;

/// Type admitting exactly one value, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantT {
    pub value: Value,
}

impl ConstantT {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

/// Type accepting any of a fixed set of values, normally strings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumT {
    table: EnumTable,
}

impl EnumT {
    pub fn new(table: EnumTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &EnumTable {
        &self.table
    }

    fn decode(fields: &serde_json::Map<String, Value>) -> Result<Self, TypeDecodeError> {
        let table_desc = match fields.get("table") {
            Some(Value::Object(t)) => t,
            other => {
                return Err(TypeDecodeError::Malformed(format!(
                    "enum table: {other:?}"
                )))
            }
        };
        let mut table = EnumTable::new();
        for (key, row) in table_desc {
            table.insert(key.clone(), EnumRow::from_descriptor(key, row)?);
        }
        Ok(Self { table })
    }
}

/// Number with an associated unit but no bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityT {
    pub unit: Unit,
}

impl QuantityT {
    pub fn new(unit: Unit) -> Self {
        Self { unit }
    }
}

/// Number restricted to a union of closed subranges.
///
/// Subranges are kept sorted, nonoverlapping, inclusive on both ends.
#[derive(Debug, Clone)]
pub struct RangeT {
    subranges: Vec<(f64, f64)>,
    unit: Unit,
    logarithmic: bool,
    integer: bool,
    // derived table, built on first request
    table: OnceCell<EnumTable>,
}

impl PartialEq for RangeT {
    fn eq(&self, other: &Self) -> bool {
        self.subranges == other.subranges
            && self.unit == other.unit
            && self.logarithmic == other.logarithmic
            && self.integer == other.integer
    }
}

impl RangeT {
    pub fn new(
        subranges: Vec<(f64, f64)>,
        unit: Unit,
        logarithmic: bool,
        integer: bool,
    ) -> Result<Self, TypeDecodeError> {
        if subranges.is_empty() {
            return Err(TypeDecodeError::InvalidRange("no subranges".to_string()));
        }
        for (i, &(min, max)) in subranges.iter().enumerate() {
            if !(min <= max) {
                return Err(TypeDecodeError::InvalidRange(format!(
                    "subrange {i} has min {min} above max {max}"
                )));
            }
            if i > 0 && !(subranges[i - 1].1 < min) {
                return Err(TypeDecodeError::InvalidRange(format!(
                    "subrange {i} has min {min} not above previous max {}",
                    subranges[i - 1].1
                )));
            }
        }
        Ok(Self {
            subranges,
            unit,
            logarithmic,
            integer,
            table: OnceCell::new(),
        })
    }

    pub fn subranges(&self) -> &[(f64, f64)] {
        &self.subranges
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn is_logarithmic(&self) -> bool {
        self.logarithmic
    }

    pub fn is_integer(&self) -> bool {
        self.integer
    }

    pub fn min(&self) -> f64 {
        self.subranges[0].0
    }

    pub fn max(&self) -> f64 {
        self.subranges[self.subranges.len() - 1].1
    }

    /// The single legal value, if the range admits exactly one.
    pub fn single_point(&self) -> Option<f64> {
        match self.subranges.as_slice() {
            [(min, max)] if min == max => Some(*min),
            _ => None,
        }
    }

    /// Index of the last subrange whose lower bound does not exceed `v`.
    fn scan_index(&self, v: f64) -> usize {
        let mut i = 0;
        for (n, &(min, _)) in self.subranges.iter().enumerate() {
            if min <= v {
                i = n;
            } else {
                break;
            }
        }
        i
    }

    /// Map an arbitrary number to the nearest legal value.
    ///
    /// `direction = 0` picks the nearest value in either direction, with
    /// ties going to the earlier subrange. `+1` moves to the next
    /// subrange upward when the value overshoots the scanned one; `-1`
    /// never moves upward. A value outside the whole range clamps to
    /// the first or last subrange. Integer ranges round the value
    /// first; logarithmic integer ranges snap to the nearest power of
    /// two.
    pub fn round(&self, value: f64, direction: i32) -> f64 {
        let mut v = value;
        if self.integer {
            if self.logarithmic {
                if v <= 0.0 {
                    v = self.min();
                }
                if v > 0.0 {
                    v = f64::powi(2.0, v.log2().round() as i32);
                }
            } else {
                v = v.round();
            }
        }

        let mut i = self.scan_index(v);
        let last = self.subranges.len() - 1;
        if direction > 0 {
            if i < last && v > self.subranges[i].1 {
                i += 1;
            }
        } else if direction == 0 && i < last && self.subranges[i + 1].0 - v < v - self.subranges[i].1 {
            i += 1;
        }

        let (min, max) = self.subranges[i];
        v.clamp(min, max)
    }

    /// A copy of this range translated by `offset`. The integer flag is
    /// cleared when the offset is fractional.
    pub fn shifted_by(&self, offset: f64) -> Self {
        Self {
            subranges: self
                .subranges
                .iter()
                .map(|&(min, max)| (min + offset, max + offset))
                .collect(),
            unit: self.unit.clone(),
            logarithmic: self.logarithmic,
            integer: self.integer && offset.fract() == 0.0,
            table: OnceCell::new(),
        }
    }

    /// Value table synthesized from the subrange boundaries, memoized.
    pub fn enum_table(&self) -> &EnumTable {
        self.table.get_or_init(|| {
            let mut table = EnumTable::new();
            for &(min, max) in &self.subranges {
                for v in [min, max] {
                    let key = v.to_string();
                    table.entry(key.clone()).or_insert_with(|| EnumRow::new(&key));
                }
            }
            table
        })
    }

    fn decode(fields: &serde_json::Map<String, Value>) -> Result<Self, TypeDecodeError> {
        let raw = match fields.get("subranges") {
            Some(Value::Array(items)) => items,
            other => {
                return Err(TypeDecodeError::Malformed(format!(
                    "range subranges: {other:?}"
                )))
            }
        };
        let mut subranges = Vec::with_capacity(raw.len());
        for item in raw {
            match item.as_array().map(Vec::as_slice) {
                Some([min, max]) => match (min.as_f64(), max.as_f64()) {
                    (Some(min), Some(max)) => subranges.push((min, max)),
                    _ => {
                        return Err(TypeDecodeError::Malformed(format!(
                            "range endpoint: {item}"
                        )))
                    }
                },
                _ => {
                    return Err(TypeDecodeError::Malformed(format!(
                        "range subrange: {item}"
                    )))
                }
            }
        }
        Self::new(
            subranges,
            decode_unit(fields.get("unit"))?,
            fields.get("logarithmic").and_then(Value::as_bool).unwrap_or(false),
            fields.get("integer").and_then(Value::as_bool).unwrap_or(false),
        )
    }
}

/// Type for warning or error strings; empty means "no notice".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoticeT {
    pub always_visible: bool,
}

impl NoticeT {
    pub fn new(always_visible: bool) -> Self {
        Self { always_visible }
    }
}

/// Layout of a binary bulk-data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkFormat {
    /// f64 center frequency, f32 sample rate, f32 zero offset, then
    /// byte-quantized samples.
    SpectrumByte,
    /// f64 sample rate, then raw f32 samples.
    ScopeFloat,
}

/// Type for high-rate numeric arrays delivered on the binary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkDataT {
    pub format: BulkFormat,
}

impl BulkDataT {
    pub fn new(format: BulkFormat) -> Self {
        Self { format }
    }

    fn decode(fields: &serde_json::Map<String, Value>) -> Result<Self, TypeDecodeError> {
        let info = fields
            .get("info_format")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let array = fields
            .get("array_format")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let format = match (info, array) {
            ("dff", "b") => BulkFormat::SpectrumByte,
            ("d", "f") => BulkFormat::ScopeFloat,
            _ => {
                return Err(TypeDecodeError::UnknownBulkFormat {
                    info: info.to_string(),
                    array: array.to_string(),
                })
            }
        };
        Ok(Self { format })
    }

    fn to_descriptor(self) -> Value {
        let (info, array) = match self.format {
            BulkFormat::SpectrumByte => ("dff", "b"),
            BulkFormat::ScopeFloat => ("d", "f"),
        };
        serde_json::json!({
            "type": "BulkDataT",
            "info_format": info,
            "array_format": array,
        })
    }
}

/// Closed set of cell value types.
///
/// Identity and shape are immutable after construction; the only
/// interior state is the memoized enum table of [`RangeT`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Boolean,
    Number { integer: bool },
    String,
    /// Unconstrained value; also the type of command cells.
    Any,
    /// Reference to another node of the object graph.
    Block,
    /// Position report record (telemetry).
    Track,
    Constant(ConstantT),
    Enum(EnumT),
    Quantity(QuantityT),
    Range(RangeT),
    Notice(NoticeT),
    Timestamp,
    BulkData(BulkDataT),
}

impl ValueType {
    /// Decode a wire type descriptor.
    ///
    /// Pure and total over the descriptor grammar; anything outside it
    /// is a [`TypeDecodeError`], which callers treat as fatal to the
    /// single message carrying the descriptor.
    pub fn decode(descriptor: &Value) -> Result<Self, TypeDecodeError> {
        match descriptor {
            Value::Null => Ok(ValueType::Any),
            Value::String(tag) => match tag.as_str() {
                "boolean" => Ok(ValueType::Boolean),
                "float64" => Ok(ValueType::Number { integer: false }),
                "integer" => Ok(ValueType::Number { integer: true }),
                "string" => Ok(ValueType::String),
                "any" => Ok(ValueType::Any),
                "reference" => Ok(ValueType::Block),
                "track" => Ok(ValueType::Track),
                other => Err(TypeDecodeError::UnknownTag(other.to_string())),
            },
            Value::Object(fields) => {
                let tag = fields.get("type").and_then(Value::as_str).ok_or_else(|| {
                    TypeDecodeError::Malformed(format!("missing type tag: {descriptor}"))
                })?;
                match tag {
                    "ConstantT" => {
                        let value = fields.get("value").cloned().unwrap_or(Value::Null);
                        Ok(ValueType::Constant(ConstantT::new(value)))
                    }
                    "EnumT" => Ok(ValueType::Enum(EnumT::decode(fields)?)),
                    "QuantityT" => Ok(ValueType::Quantity(QuantityT::new(decode_unit(
                        fields.get("unit"),
                    )?))),
                    "RangeT" => Ok(ValueType::Range(RangeT::decode(fields)?)),
                    "NoticeT" => Ok(ValueType::Notice(NoticeT::new(
                        fields
                            .get("always_visible")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    ))),
                    "TimestampT" => Ok(ValueType::Timestamp),
                    "BulkDataT" => Ok(ValueType::BulkData(BulkDataT::decode(fields)?)),
                    other => Err(TypeDecodeError::UnknownTag(other.to_string())),
                }
            }
            other => Err(TypeDecodeError::Malformed(other.to_string())),
        }
    }

    /// Re-encode as a wire descriptor. `decode(to_descriptor())` yields
    /// a behaviorally identical type.
    pub fn to_descriptor(&self) -> Value {
        match self {
            ValueType::Boolean => Value::from("boolean"),
            ValueType::Number { integer: false } => Value::from("float64"),
            ValueType::Number { integer: true } => Value::from("integer"),
            ValueType::String => Value::from("string"),
            ValueType::Any => Value::from("any"),
            ValueType::Block => Value::from("reference"),
            ValueType::Track => Value::from("track"),
            ValueType::Constant(c) => serde_json::json!({
                "type": "ConstantT",
                "value": c.value,
            }),
            ValueType::Enum(e) => {
                let table: serde_json::Map<String, Value> = e
                    .table()
                    .iter()
                    .map(|(k, row)| (k.clone(), row.to_descriptor()))
                    .collect();
                serde_json::json!({ "type": "EnumT", "table": table })
            }
            ValueType::Quantity(q) => serde_json::json!({
                "type": "QuantityT",
                "unit": q.unit,
            }),
            ValueType::Range(r) => serde_json::json!({
                "type": "RangeT",
                "subranges": r.subranges(),
                "unit": r.unit(),
                "logarithmic": r.is_logarithmic(),
                "integer": r.is_integer(),
            }),
            ValueType::Notice(n) => serde_json::json!({
                "type": "NoticeT",
                "always_visible": n.always_visible,
            }),
            ValueType::Timestamp => serde_json::json!({ "type": "TimestampT" }),
            ValueType::BulkData(b) => b.to_descriptor(),
        }
    }

    /// True iff the type admits exactly one legal value. Consumers use
    /// this to suppress controls that could never change anything.
    pub fn is_single_valued(&self) -> bool {
        match self {
            ValueType::Constant(_) => true,
            ValueType::Enum(e) => e.table().len() == 1,
            ValueType::Range(r) => r.single_point().is_some(),
            _ => false,
        }
    }

    /// Finite value table, if this type has one.
    pub fn enum_table(&self) -> Option<&EnumTable> {
        match self {
            ValueType::Enum(e) => Some(e.table()),
            ValueType::Range(r) => Some(r.enum_table()),
            _ => None,
        }
    }

    /// Unit of measure for numeric types that carry one.
    pub fn numeric_unit(&self) -> Option<&Unit> {
        match self {
            ValueType::Quantity(q) => Some(&q.unit),
            ValueType::Range(r) => Some(r.unit()),
            _ => None,
        }
    }
}

fn decode_unit(field: Option<&Value>) -> Result<Unit, TypeDecodeError> {
    match field {
        None | Some(Value::Null) => Ok(Unit::none()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| TypeDecodeError::Malformed(format!("unit: {e}"))),
    }
}
