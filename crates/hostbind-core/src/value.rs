//! Runtime value type for stack slots, table entries and upvalues.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use ordered_float::OrderedFloat;

use crate::error::RuntimeError;
use crate::function::FunctionRef;
use crate::heap::UserdataHandle;
use crate::table::TableRef;

// ============================================================================
// ValueType
// ============================================================================

/// Type tag of a stack index.
///
/// `None` describes an index past the top of the current frame, which is
/// distinct from an index holding `nil`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    None,
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
    LightUserdata,
}

impl ValueType {
    /// The name scripts see for this type.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::None => "no value",
            ValueType::Nil => "nil",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
            ValueType::Userdata => "userdata",
            ValueType::LightUserdata => "light userdata",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// LightRef
// ============================================================================

/// A shared host value compared by identity.
///
/// This is how a host object that is not owned by the object heap travels
/// through the runtime: the runtime keeps the allocation alive but never
/// inspects it.
#[derive(Clone)]
pub struct LightRef(Rc<dyn Any>);

impl LightRef {
    pub fn new<T: Any>(value: Rc<T>) -> Self {
        LightRef(value)
    }

    /// Recover the shared value if it has type `T`.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &LightRef) -> bool {
        self.addr() == other.addr()
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for LightRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LightRef({:#x})", self.addr())
    }
}

// ============================================================================
// Value
// ============================================================================

/// A value stored in the runtime.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Table(TableRef),
    Function(FunctionRef),
    Userdata(UserdataHandle),
    Light(LightRef),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Bool(_) => ValueType::Boolean,
            Value::Int(_) | Value::Float(_) => ValueType::Number,
            Value::Str(_) => ValueType::String,
            Value::Table(_) => ValueType::Table,
            Value::Function(_) => ValueType::Function,
            Value::Userdata(_) => ValueType::Userdata,
            Value::Light(_) => ValueType::LightUserdata,
        }
    }

    /// Get a human-readable name for this value's type.
    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except `nil` and `false` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Integer view of a number. Floats qualify only when integral.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => float_to_int(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<UserdataHandle> {
        match self {
            Value::Userdata(h) => Some(*h),
            _ => None,
        }
    }

    /// Primitive equality: numbers by value, strings by content, everything
    /// else by identity. Never consults metamethods.
    pub fn raw_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                float_to_int(*f) == Some(*i)
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Userdata(a), Value::Userdata(b)) => a == b,
            (Value::Light(a), Value::Light(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Convert a float to an integer when it has an exact integer value.
pub fn float_to_int(value: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if value.fract() == 0.0 && (-LIMIT..LIMIT).contains(&value) {
        Some(value as i64)
    } else {
        None
    }
}

/// Render a float the way scripts print numbers.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        let sign = if value > 0.0 { "" } else { "-" };
        format!("{sign}inf")
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Table(t) => write!(f, "Table({:#x})", t.addr()),
            Value::Function(func) => write!(f, "Function({:#x})", func.addr()),
            Value::Userdata(h) => write!(f, "Userdata({h:?})"),
            Value::Light(l) => write!(f, "{l:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Rc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Rc::from(v))
    }
}

impl From<Rc<str>> for Value {
    fn from(v: Rc<str>) -> Self {
        Value::Str(v)
    }
}

impl From<TableRef> for Value {
    fn from(v: TableRef) -> Self {
        Value::Table(v)
    }
}

impl From<FunctionRef> for Value {
    fn from(v: FunctionRef) -> Self {
        Value::Function(v)
    }
}

impl From<UserdataHandle> for Value {
    fn from(v: UserdataHandle) -> Self {
        Value::Userdata(v)
    }
}

// ============================================================================
// TableKey
// ============================================================================

/// A normalized table key.
///
/// Integral floats collapse to `Int` so that `t[1]` and `t[1.0]` name the
/// same slot. `nil` and NaN are rejected.
#[derive(Clone)]
pub enum TableKey {
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(Rc<str>),
    Table(TableRef),
    Function(FunctionRef),
    Userdata(UserdataHandle),
    Light(LightRef),
}

impl TableKey {
    pub fn from_value(value: &Value) -> Result<Self, RuntimeError> {
        Ok(match value {
            Value::Nil => return Err(RuntimeError::runtime("table index is nil")),
            Value::Bool(b) => TableKey::Bool(*b),
            Value::Int(i) => TableKey::Int(*i),
            Value::Float(f) if f.is_nan() => {
                return Err(RuntimeError::runtime("table index is NaN"));
            }
            Value::Float(f) => match float_to_int(*f) {
                Some(i) => TableKey::Int(i),
                None => TableKey::Float(OrderedFloat(*f)),
            },
            Value::Str(s) => TableKey::Str(s.clone()),
            Value::Table(t) => TableKey::Table(t.clone()),
            Value::Function(f) => TableKey::Function(f.clone()),
            Value::Userdata(h) => TableKey::Userdata(*h),
            Value::Light(l) => TableKey::Light(l.clone()),
        })
    }

    pub fn str(name: &str) -> Self {
        TableKey::Str(Rc::from(name))
    }

    pub fn to_value(&self) -> Value {
        match self {
            TableKey::Bool(b) => Value::Bool(*b),
            TableKey::Int(i) => Value::Int(*i),
            TableKey::Float(f) => Value::Float(f.0),
            TableKey::Str(s) => Value::Str(s.clone()),
            TableKey::Table(t) => Value::Table(t.clone()),
            TableKey::Function(f) => Value::Function(f.clone()),
            TableKey::Userdata(h) => Value::Userdata(*h),
            TableKey::Light(l) => Value::Light(l.clone()),
        }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TableKey::Bool(a), TableKey::Bool(b)) => a == b,
            (TableKey::Int(a), TableKey::Int(b)) => a == b,
            (TableKey::Float(a), TableKey::Float(b)) => a == b,
            (TableKey::Str(a), TableKey::Str(b)) => a == b,
            (TableKey::Table(a), TableKey::Table(b)) => a.ptr_eq(b),
            (TableKey::Function(a), TableKey::Function(b)) => a.ptr_eq(b),
            (TableKey::Userdata(a), TableKey::Userdata(b)) => a == b,
            (TableKey::Light(a), TableKey::Light(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            TableKey::Bool(b) => b.hash(state),
            TableKey::Int(i) => i.hash(state),
            TableKey::Float(f) => f.hash(state),
            TableKey::Str(s) => s.hash(state),
            TableKey::Table(t) => t.addr().hash(state),
            TableKey::Function(f) => f.addr().hash(state),
            TableKey::Userdata(h) => h.hash(state),
            TableKey::Light(l) => l.addr().hash(state),
        }
    }
}

impl fmt::Debug for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_value())
    }
}
