// Key and value types supported by the tree family
// Integer, float, fixed-width byte, string and dynamically typed object
// keys/values, each adapted to the capability traits in `contracts`.

use std::cmp::Ordering;
use std::fmt;

use crate::contracts::{KeyOrdering, ValueCodec, WeightedValue};
use crate::error::{BTreeError, Result};
use crate::state::Datum;

fn integer_from_datum<T>(datum: &Datum, what: &str) -> std::result::Result<T, String>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    match datum {
        Datum::Int(v) => <T as TryFrom<i64>>::try_from(*v)
            .map_err(|_| format!("{v} out of range for {what}")),
        Datum::UInt(v) => <T as TryFrom<u64>>::try_from(*v)
            .map_err(|_| format!("{v} out of range for {what}")),
        other => Err(format!("expected integer for {what}, got {}", other.type_name())),
    }
}

fn merge_overflow(what: &str) -> BTreeError {
    BTreeError::InvalidValue(format!("weighted merge overflows {what}"))
}

macro_rules! integer_type {
    ($ty:ty, $variant:ident, $wide:ty) => {
        impl KeyOrdering for $ty {
            fn compare(&self, other: &Self) -> Result<Ordering> {
                Ok(self.cmp(other))
            }

            fn to_datum(&self) -> Datum {
                Datum::$variant(*self as $wide)
            }

            fn from_datum(datum: &Datum) -> Result<Self> {
                integer_from_datum(datum, stringify!($ty)).map_err(BTreeError::InvalidKey)
            }
        }

        impl ValueCodec for $ty {
            fn to_datum(&self) -> Datum {
                Datum::$variant(*self as $wide)
            }

            fn from_datum(datum: &Datum) -> Result<Self> {
                integer_from_datum(datum, stringify!($ty)).map_err(BTreeError::InvalidValue)
            }

            fn same(&self, other: &Self) -> bool {
                self == other
            }
        }

        impl WeightedValue for $ty {
            const MERGE_DEFAULT: Self = 1;

            fn merge(v1: Self, w1: Self, v2: Self, w2: Self) -> Result<Self> {
                let left = Self::merge_weight(v1, w1)?;
                let right = Self::merge_weight(v2, w2)?;
                left.checked_add(right)
                    .ok_or_else(|| merge_overflow(stringify!($ty)))
            }

            fn merge_weight(v: Self, w: Self) -> Result<Self> {
                v.checked_mul(w).ok_or_else(|| merge_overflow(stringify!($ty)))
            }

            fn add_weights(w1: Self, w2: Self) -> Result<Self> {
                w1.checked_add(w2).ok_or_else(|| merge_overflow(stringify!($ty)))
            }

            #[allow(unused_comparisons)]
            fn normalize(v: Self, min: Self) -> Self {
                if min > 0 {
                    v / min
                } else {
                    v
                }
            }

            fn zero() -> Self {
                0
            }
        }
    };
}

integer_type!(i32, Int, i64);
integer_type!(i64, Int, i64);
integer_type!(u32, UInt, u64);
integer_type!(u64, UInt, u64);

macro_rules! float_value {
    ($ty:ty) => {
        impl ValueCodec for $ty {
            fn to_datum(&self) -> Datum {
                Datum::Float(*self as f64)
            }

            fn from_datum(datum: &Datum) -> Result<Self> {
                match datum {
                    Datum::Float(v) => Ok(*v as $ty),
                    Datum::Int(v) => Ok(*v as $ty),
                    Datum::UInt(v) => Ok(*v as $ty),
                    other => Err(BTreeError::InvalidValue(format!(
                        "expected float, got {}",
                        other.type_name()
                    ))),
                }
            }

            fn same(&self, other: &Self) -> bool {
                self == other
            }
        }

        impl WeightedValue for $ty {
            const MERGE_DEFAULT: Self = 1.0;

            fn merge(v1: Self, w1: Self, v2: Self, w2: Self) -> Result<Self> {
                Ok(v1 * w1 + v2 * w2)
            }

            fn merge_weight(v: Self, w: Self) -> Result<Self> {
                Ok(v * w)
            }

            fn add_weights(w1: Self, w2: Self) -> Result<Self> {
                Ok(w1 + w2)
            }

            fn normalize(v: Self, min: Self) -> Self {
                if min > 0.0 {
                    v / min
                } else {
                    v
                }
            }

            fn zero() -> Self {
                0.0
            }
        }
    };
}

float_value!(f32);
float_value!(f64);

/// Fixed-width byte string, compared lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedBytes<const N: usize>(pub [u8; N]);

impl<const N: usize> FixedBytes<N> {
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; N] = bytes
            .try_into()
            .map_err(|_| BTreeError::InvalidKey(format!("expected {N} bytes, got {}", bytes.len())))?;
        Ok(Self(array))
    }
}

impl<const N: usize> KeyOrdering for FixedBytes<N> {
    const TREE_SIZE: usize = 500;
    const BUCKET_SIZE: usize = 500;

    fn compare(&self, other: &Self) -> Result<Ordering> {
        Ok(self.0.cmp(&other.0))
    }

    fn to_datum(&self) -> Datum {
        Datum::Bytes(self.0.to_vec())
    }

    fn from_datum(datum: &Datum) -> Result<Self> {
        match datum {
            Datum::Bytes(bytes) => Self::try_from_slice(bytes),
            other => Err(BTreeError::InvalidKey(format!(
                "expected bytes, got {}",
                other.type_name()
            ))),
        }
    }
}

impl<const N: usize> ValueCodec for FixedBytes<N> {
    fn to_datum(&self) -> Datum {
        Datum::Bytes(self.0.to_vec())
    }

    fn from_datum(datum: &Datum) -> Result<Self> {
        <Self as KeyOrdering>::from_datum(datum).map_err(|e| BTreeError::InvalidValue(e.to_string()))
    }

    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

impl KeyOrdering for String {
    const TREE_SIZE: usize = 250;
    const BUCKET_SIZE: usize = 60;

    fn compare(&self, other: &Self) -> Result<Ordering> {
        Ok(self.as_str().cmp(other.as_str()))
    }

    fn to_datum(&self) -> Datum {
        Datum::Str(self.clone())
    }

    fn from_datum(datum: &Datum) -> Result<Self> {
        match datum {
            Datum::Str(s) => Ok(s.clone()),
            other => Err(BTreeError::InvalidKey(format!(
                "expected str, got {}",
                other.type_name()
            ))),
        }
    }
}

impl ValueCodec for String {
    const IS_OBJECT: bool = true;

    fn to_datum(&self) -> Datum {
        Datum::Str(self.clone())
    }

    fn from_datum(datum: &Datum) -> Result<Self> {
        <String as KeyOrdering>::from_datum(datum)
            .map_err(|e| BTreeError::InvalidValue(e.to_string()))
    }

    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

/// Unit values; a mapping to `()` behaves like a set with explicit values
impl ValueCodec for () {
    fn to_datum(&self) -> Datum {
        Datum::None
    }

    fn from_datum(_datum: &Datum) -> Result<Self> {
        Ok(())
    }

    fn same(&self, _other: &Self) -> bool {
        true
    }
}

/// Dynamically typed object usable as key or value.
///
/// `None` sorts below everything and numbers compare across int/float. Any
/// other pair of different kinds has no ordering and comparing them fails.
/// `Opaque` stands for an object that only has identity comparison: it can
/// be compared but is refused as a key.
#[derive(Debug, Clone)]
pub enum Object {
    None,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    Opaque(u64),
}

impl Object {
    fn kind_name(&self) -> &'static str {
        match self {
            Object::None => "None",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Str(_) => "str",
            Object::Bytes(_) => "bytes",
            Object::Tuple(_) => "tuple",
            Object::Opaque(_) => "object",
        }
    }

    fn mismatch(&self, other: &Object) -> BTreeError {
        BTreeError::KeyComparison(format!(
            "'<' not supported between {} and {}",
            self.kind_name(),
            other.kind_name()
        ))
    }

    fn float_cmp(a: f64, b: f64) -> Result<Ordering> {
        a.partial_cmp(&b)
            .ok_or_else(|| BTreeError::KeyComparison(format!("unordered floats {a} and {b}")))
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::None => write!(f, "None"),
            Object::Int(v) => write!(f, "{v}"),
            Object::Float(v) => write!(f, "{v}"),
            Object::Str(s) => write!(f, "{s:?}"),
            Object::Bytes(b) => write!(f, "b{b:?}"),
            Object::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Object::Opaque(id) => write!(f, "<object at 0x{id:x}>"),
        }
    }
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Object::Int(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Object::Str(v.to_string())
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Object::Float(v)
    }
}

impl KeyOrdering for Object {
    const TREE_SIZE: usize = 250;
    const BUCKET_SIZE: usize = 60;

    fn compare(&self, other: &Self) -> Result<Ordering> {
        match (self, other) {
            (Object::None, Object::None) => Ok(Ordering::Equal),
            (Object::None, _) => Ok(Ordering::Less),
            (_, Object::None) => Ok(Ordering::Greater),
            (Object::Int(a), Object::Int(b)) => Ok(a.cmp(b)),
            (Object::Int(a), Object::Float(b)) => Self::float_cmp(*a as f64, *b),
            (Object::Float(a), Object::Int(b)) => Self::float_cmp(*a, *b as f64),
            (Object::Float(a), Object::Float(b)) => Self::float_cmp(*a, *b),
            (Object::Str(a), Object::Str(b)) => Ok(a.cmp(b)),
            (Object::Bytes(a), Object::Bytes(b)) => Ok(a.cmp(b)),
            (Object::Tuple(a), Object::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        unequal => return Ok(unequal),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (Object::Opaque(a), Object::Opaque(b)) => Ok(a.cmp(b)),
            _ => Err(self.mismatch(other)),
        }
    }

    fn supports(&self) -> bool {
        match self {
            Object::Opaque(_) => false,
            Object::Tuple(items) => items.iter().all(KeyOrdering::supports),
            _ => true,
        }
    }

    fn to_datum(&self) -> Datum {
        match self {
            Object::None => Datum::None,
            Object::Int(v) => Datum::Int(*v),
            Object::Float(v) => Datum::Float(*v),
            Object::Str(s) => Datum::Str(s.clone()),
            Object::Bytes(b) => Datum::Bytes(b.clone()),
            Object::Tuple(items) => {
                Datum::Tuple(items.iter().map(KeyOrdering::to_datum).collect())
            }
            Object::Opaque(id) => Datum::Opaque(*id),
        }
    }

    fn from_datum(datum: &Datum) -> Result<Self> {
        Ok(match datum {
            Datum::None => Object::None,
            Datum::Int(v) => Object::Int(*v),
            Datum::UInt(v) => Object::Int(
                i64::try_from(*v).map_err(|_| BTreeError::InvalidKey(format!("{v} too large")))?,
            ),
            Datum::Float(v) => Object::Float(*v),
            Datum::Str(s) => Object::Str(s.clone()),
            Datum::Bytes(b) => Object::Bytes(b.clone()),
            Datum::Tuple(items) => Object::Tuple(
                items
                    .iter()
                    .map(<Object as KeyOrdering>::from_datum)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Datum::Opaque(id) => Object::Opaque(*id),
            other => {
                return Err(BTreeError::InvalidKey(format!(
                    "cannot use {} as an object",
                    other.type_name()
                )))
            }
        })
    }
}

impl ValueCodec for Object {
    const IS_OBJECT: bool = true;

    fn to_datum(&self) -> Datum {
        KeyOrdering::to_datum(self)
    }

    fn from_datum(datum: &Datum) -> Result<Self> {
        <Object as KeyOrdering>::from_datum(datum)
            .map_err(|e| BTreeError::InvalidValue(e.to_string()))
    }

    fn same(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ok(Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_keys_convert_with_range_checks() {
        assert_eq!(<i32 as KeyOrdering>::from_datum(&Datum::Int(-5)).unwrap(), -5);
        assert!(matches!(
            <i32 as KeyOrdering>::from_datum(&Datum::Int(i64::from(i32::MAX) + 1)),
            Err(BTreeError::InvalidKey(_))
        ));
        assert!(matches!(
            <u32 as KeyOrdering>::from_datum(&Datum::Int(-1)),
            Err(BTreeError::InvalidKey(_))
        ));
        assert!(matches!(
            <i64 as ValueCodec>::from_datum(&Datum::Str("x".into())),
            Err(BTreeError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_object_ordering() {
        let one = Object::Int(1);
        let half = Object::Float(0.5);
        assert_eq!(one.compare(&half).unwrap(), Ordering::Greater);
        assert_eq!(Object::None.compare(&one).unwrap(), Ordering::Less);
        assert!(one.compare(&Object::from("a")).unwrap_err().is_comparison());
        assert!(Object::Float(f64::NAN).compare(&half).unwrap_err().is_comparison());

        let t1 = Object::Tuple(vec![Object::Int(1), Object::from("a")]);
        let t2 = Object::Tuple(vec![Object::Int(1), Object::from("b")]);
        assert_eq!(t1.compare(&t2).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_default_comparison_guard() {
        assert!(Object::Int(3).supports());
        assert!(!Object::Opaque(0xdead).supports());
        assert!(!Object::Tuple(vec![Object::Int(1), Object::Opaque(1)]).supports());
    }

    #[test]
    fn test_opaque_objects_keep_their_identity_through_datum() {
        for id in [0xdead, u64::MAX] {
            let datum = ValueCodec::to_datum(&Object::Opaque(id));
            assert_eq!(datum, Datum::Opaque(id));
            let back = <Object as ValueCodec>::from_datum(&datum).unwrap();
            assert!(matches!(back, Object::Opaque(got) if got == id));
        }
        // a plain unsigned integer still decodes as an int
        let int = <Object as ValueCodec>::from_datum(&Datum::UInt(7)).unwrap();
        assert!(matches!(int, Object::Int(7)));
    }

    #[test]
    fn test_bucket_sizes_follow_value_kind() {
        assert_eq!(<i32 as KeyOrdering>::bucket_size_for::<i32>(), 120);
        assert_eq!(<i32 as KeyOrdering>::bucket_size_for::<Object>(), 60);
        assert_eq!(<Object as KeyOrdering>::bucket_size_for::<Object>(), 30);
        assert_eq!(<FixedBytes<2> as KeyOrdering>::bucket_size_for::<i64>(), 500);
        assert_eq!(<Object as KeyOrdering>::TREE_SIZE, 250);
    }

    #[test]
    fn test_normalize_only_for_positive_minimum() {
        assert_eq!(i32::normalize(10, 5), 2);
        assert_eq!(i32::normalize(10, 0), 10);
        assert_eq!(i32::normalize(10, -5), 10);
        assert_eq!(u32::normalize(10, 0), 10);
        assert_eq!(f32::normalize(3.0, 2.0), 1.5);
        assert_eq!(f32::normalize(3.0, -2.0), 3.0);
    }

    #[test]
    fn test_weighted_merge_arithmetic() {
        assert_eq!(i64::merge(2, 3, 4, 5).unwrap(), 26);
        assert_eq!(i64::merge_weight(7, 2).unwrap(), 14);
        assert_eq!(u32::add_weights(1, 1).unwrap(), 2);
        assert_eq!(f64::merge(0.5, 2.0, 1.0, 3.0).unwrap(), 4.0);
    }

    #[test]
    fn test_integer_weighted_merge_reports_overflow() {
        assert!(matches!(i32::merge_weight(i32::MAX, 2), Err(BTreeError::InvalidValue(_))));
        assert!(matches!(i64::merge(i64::MAX, 1, 1, 1), Err(BTreeError::InvalidValue(_))));
        assert!(matches!(u32::add_weights(u32::MAX, 1), Err(BTreeError::InvalidValue(_))));
        assert_eq!(i32::merge(i32::MAX, 1, 0, 5).unwrap(), i32::MAX);
    }
}
