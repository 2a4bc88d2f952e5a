//! The predicted-type lattice.
//!
//! A [`Prediction`] is a bitset over dynamic-type categories. The bottom
//! element is the empty set ("no information yet"); joins are bitwise unions
//! and only ever grow. A prediction consisting of a single atom is called
//! *pure*; speculation decisions key off pure predictions, since a mixed
//! prediction means the speculation would sometimes fail.

use std::fmt;

use bitflags::bitflags;

use crate::opcode::Op;
use crate::runtime::{JsValue, ObjectKind};

bitflags! {
    /// A set of dynamic-type categories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prediction: u32 {
        const FINAL_OBJECT = 1 << 0;
        const ARRAY = 1 << 1;
        const FUNCTION = 1 << 2;
        const INT8_ARRAY = 1 << 3;
        const INT16_ARRAY = 1 << 4;
        const INT32_ARRAY = 1 << 5;
        const UINT8_ARRAY = 1 << 6;
        const UINT8_CLAMPED_ARRAY = 1 << 7;
        const UINT16_ARRAY = 1 << 8;
        const UINT32_ARRAY = 1 << 9;
        const FLOAT32_ARRAY = 1 << 10;
        const FLOAT64_ARRAY = 1 << 11;
        const BYTE_ARRAY = 1 << 12;
        /// Objects with no more specific category.
        const OBJECT_OTHER = 1 << 13;
        const STRING = 1 << 14;
        /// Heap cells that are not objects or strings (scope chains, ...).
        const CELL_OTHER = 1 << 15;
        const INT32 = 1 << 16;
        const DOUBLE = 1 << 17;
        const BOOLEAN = 1 << 18;
        /// Undefined, null, and opaque non-heap values (storage pointers).
        const OTHER = 1 << 19;

        const OBJECT_MASK = Self::FINAL_OBJECT.bits()
            | Self::ARRAY.bits()
            | Self::FUNCTION.bits()
            | Self::INT8_ARRAY.bits()
            | Self::INT16_ARRAY.bits()
            | Self::INT32_ARRAY.bits()
            | Self::UINT8_ARRAY.bits()
            | Self::UINT8_CLAMPED_ARRAY.bits()
            | Self::UINT16_ARRAY.bits()
            | Self::UINT32_ARRAY.bits()
            | Self::FLOAT32_ARRAY.bits()
            | Self::FLOAT64_ARRAY.bits()
            | Self::BYTE_ARRAY.bits()
            | Self::OBJECT_OTHER.bits();
        const CELL_MASK =
            Self::OBJECT_MASK.bits() | Self::STRING.bits() | Self::CELL_OTHER.bits();
        const NUMBER_MASK = Self::INT32.bits() | Self::DOUBLE.bits();
        const TOP = u32::MAX >> (32 - 20);
    }
}

/// The typed-array atoms, in the order the length-specialization table uses.
const TYPED_ARRAYS: [Prediction; 8] = [
    Prediction::INT8_ARRAY,
    Prediction::INT16_ARRAY,
    Prediction::INT32_ARRAY,
    Prediction::UINT8_ARRAY,
    Prediction::UINT8_CLAMPED_ARRAY,
    Prediction::UINT16_ARRAY,
    Prediction::UINT32_ARRAY,
    Prediction::FLOAT32_ARRAY,
];

impl Prediction {
    // ── Pure-atom predicates ────────────────────────────────────────

    pub fn is_int32(self) -> bool {
        self == Prediction::INT32
    }

    pub fn is_double(self) -> bool {
        self == Prediction::DOUBLE
    }

    pub fn is_boolean(self) -> bool {
        self == Prediction::BOOLEAN
    }

    pub fn is_string(self) -> bool {
        self == Prediction::STRING
    }

    pub fn is_array(self) -> bool {
        self == Prediction::ARRAY
    }

    pub fn is_byte_array(self) -> bool {
        self == Prediction::BYTE_ARRAY
    }

    pub fn is_final_object(self) -> bool {
        self == Prediction::FINAL_OBJECT
    }

    pub fn is_typed_array(self) -> bool {
        TYPED_ARRAYS.contains(&self)
            || self == Prediction::FLOAT64_ARRAY
    }

    // ── Family predicates ───────────────────────────────────────────

    /// Non-empty and contained in the numeric categories.
    pub fn is_number(self) -> bool {
        !self.is_empty() && Prediction::NUMBER_MASK.contains(self)
    }

    /// Non-empty and contained in the object categories.
    pub fn is_object(self) -> bool {
        !self.is_empty() && Prediction::OBJECT_MASK.contains(self)
    }

    /// Non-empty and contained in the heap-cell categories.
    pub fn is_cell(self) -> bool {
        !self.is_empty() && Prediction::CELL_MASK.contains(self)
    }

    /// A container whose indexed stores are expressible without observable
    /// side effects: arrays, byte arrays, typed arrays.
    pub fn is_actionable_mutable_array(self) -> bool {
        self.is_array() || self.is_byte_array() || self.is_typed_array()
    }

    /// A container whose indexed loads are expressible without observable
    /// side effects; strings qualify for loads but not stores.
    pub fn is_actionable_array(self) -> bool {
        self.is_actionable_mutable_array() || self.is_string()
    }

    /// Containers whose indexed storage pointer never moves, so an indexed
    /// store cannot invalidate a cached storage pointer.
    pub fn has_fixed_indexed_storage(self) -> bool {
        self.is_byte_array() || self.is_typed_array()
    }

    // ── Length specialization ───────────────────────────────────────

    /// The dedicated length opcode for a base speculating this category, if
    /// the category has one. This drives both the length-prediction inference
    /// and the fixup rewrite of `GetById "length"`.
    pub fn length_specialization(self) -> Option<Op> {
        const TABLE: [(Prediction, Op); 12] = [
            (Prediction::ARRAY, Op::GetArrayLength),
            (Prediction::STRING, Op::GetStringLength),
            (Prediction::BYTE_ARRAY, Op::GetByteArrayLength),
            (Prediction::INT8_ARRAY, Op::GetInt8ArrayLength),
            (Prediction::INT16_ARRAY, Op::GetInt16ArrayLength),
            (Prediction::INT32_ARRAY, Op::GetInt32ArrayLength),
            (Prediction::UINT8_ARRAY, Op::GetUint8ArrayLength),
            (
                Prediction::UINT8_CLAMPED_ARRAY,
                Op::GetUint8ClampedArrayLength,
            ),
            (Prediction::UINT16_ARRAY, Op::GetUint16ArrayLength),
            (Prediction::UINT32_ARRAY, Op::GetUint32ArrayLength),
            (Prediction::FLOAT32_ARRAY, Op::GetFloat32ArrayLength),
            (Prediction::FLOAT64_ARRAY, Op::GetFloat64ArrayLength),
        ];
        TABLE.iter().find(|(p, _)| *p == self).map(|&(_, op)| op)
    }

    /// Parse a single atom name ("Int32", "Array", ...) as written in the
    /// textual graph format.
    pub fn from_atom_name(name: &str) -> Option<Prediction> {
        Some(match name {
            "Int32" => Prediction::INT32,
            "Double" => Prediction::DOUBLE,
            "Boolean" => Prediction::BOOLEAN,
            "String" => Prediction::STRING,
            "Array" => Prediction::ARRAY,
            "FinalObject" => Prediction::FINAL_OBJECT,
            "Function" => Prediction::FUNCTION,
            "ObjectOther" => Prediction::OBJECT_OTHER,
            "CellOther" => Prediction::CELL_OTHER,
            "ByteArray" => Prediction::BYTE_ARRAY,
            "Int8Array" => Prediction::INT8_ARRAY,
            "Int16Array" => Prediction::INT16_ARRAY,
            "Int32Array" => Prediction::INT32_ARRAY,
            "Uint8Array" => Prediction::UINT8_ARRAY,
            "Uint8ClampedArray" => Prediction::UINT8_CLAMPED_ARRAY,
            "Uint16Array" => Prediction::UINT16_ARRAY,
            "Uint32Array" => Prediction::UINT32_ARRAY,
            "Float32Array" => Prediction::FLOAT32_ARRAY,
            "Float64Array" => Prediction::FLOAT64_ARRAY,
            "Other" => Prediction::OTHER,
            _ => return None,
        })
    }
}

/// The prediction a literal value justifies.
pub fn prediction_from_value(value: &JsValue) -> Prediction {
    match value {
        JsValue::Int32(_) => Prediction::INT32,
        JsValue::Double(d) => {
            // Integral doubles still fit the int32 speculation as long as
            // they round-trip (and are not negative zero).
            let truncated = *d as i32;
            if f64::from(truncated) == *d && !(*d == 0.0 && d.is_sign_negative()) {
                Prediction::INT32
            } else {
                Prediction::DOUBLE
            }
        }
        JsValue::Boolean(_) => Prediction::BOOLEAN,
        JsValue::Str(_) => Prediction::STRING,
        JsValue::Undefined | JsValue::Null => Prediction::OTHER,
        JsValue::Object(kind) => match kind {
            ObjectKind::FinalObject => Prediction::FINAL_OBJECT,
            ObjectKind::Array => Prediction::ARRAY,
            ObjectKind::Function => Prediction::FUNCTION,
            ObjectKind::Other => Prediction::OBJECT_OTHER,
        },
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "None");
        }
        if *self == Prediction::TOP {
            return write!(f, "Top");
        }
        const NAMES: [(Prediction, &str); 20] = [
            (Prediction::FINAL_OBJECT, "FinalObject"),
            (Prediction::ARRAY, "Array"),
            (Prediction::FUNCTION, "Function"),
            (Prediction::INT8_ARRAY, "Int8Array"),
            (Prediction::INT16_ARRAY, "Int16Array"),
            (Prediction::INT32_ARRAY, "Int32Array"),
            (Prediction::UINT8_ARRAY, "Uint8Array"),
            (Prediction::UINT8_CLAMPED_ARRAY, "Uint8ClampedArray"),
            (Prediction::UINT16_ARRAY, "Uint16Array"),
            (Prediction::UINT32_ARRAY, "Uint32Array"),
            (Prediction::FLOAT32_ARRAY, "Float32Array"),
            (Prediction::FLOAT64_ARRAY, "Float64Array"),
            (Prediction::BYTE_ARRAY, "ByteArray"),
            (Prediction::OBJECT_OTHER, "ObjectOther"),
            (Prediction::STRING, "String"),
            (Prediction::CELL_OTHER, "CellOther"),
            (Prediction::INT32, "Int32"),
            (Prediction::DOUBLE, "Double"),
            (Prediction::BOOLEAN, "Boolean"),
            (Prediction::OTHER, "Other"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                first = false;
                write!(f, "{name}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_atoms_are_not_families() {
        assert!(Prediction::INT32.is_int32());
        assert!(Prediction::INT32.is_number());
        assert!(!(Prediction::INT32 | Prediction::DOUBLE).is_int32());
        assert!((Prediction::INT32 | Prediction::DOUBLE).is_number());
        assert!(!(Prediction::INT32 | Prediction::STRING).is_number());
        assert!(!Prediction::empty().is_number());
    }

    #[test]
    fn object_and_cell_masks_nest() {
        assert!(Prediction::CELL_MASK.contains(Prediction::OBJECT_MASK));
        assert!(Prediction::ARRAY.is_object());
        assert!(Prediction::STRING.is_cell());
        assert!(!Prediction::STRING.is_object());
        assert!(!(Prediction::ARRAY | Prediction::INT32).is_object());
    }

    #[test]
    fn actionable_array_families() {
        assert!(Prediction::ARRAY.is_actionable_mutable_array());
        assert!(Prediction::FLOAT64_ARRAY.is_actionable_mutable_array());
        assert!(Prediction::STRING.is_actionable_array());
        assert!(!Prediction::STRING.is_actionable_mutable_array());
        assert!(!Prediction::FINAL_OBJECT.is_actionable_array());
        // A mixed prediction is never actionable: the speculation could fail.
        assert!(!(Prediction::ARRAY | Prediction::STRING).is_actionable_array());
    }

    #[test]
    fn every_length_container_has_a_specialization() {
        assert_eq!(
            Prediction::ARRAY.length_specialization(),
            Some(Op::GetArrayLength)
        );
        assert_eq!(
            Prediction::FLOAT64_ARRAY.length_specialization(),
            Some(Op::GetFloat64ArrayLength)
        );
        assert_eq!(Prediction::FINAL_OBJECT.length_specialization(), None);
        assert_eq!(
            (Prediction::ARRAY | Prediction::STRING).length_specialization(),
            None
        );
    }

    #[test]
    fn literal_values_predict_their_category() {
        assert_eq!(
            prediction_from_value(&JsValue::Int32(7)),
            Prediction::INT32
        );
        assert_eq!(
            prediction_from_value(&JsValue::Double(2.0)),
            Prediction::INT32
        );
        assert_eq!(
            prediction_from_value(&JsValue::Double(0.5)),
            Prediction::DOUBLE
        );
        assert_eq!(
            prediction_from_value(&JsValue::Double(-0.0)),
            Prediction::DOUBLE
        );
        assert_eq!(
            prediction_from_value(&JsValue::Str("x".into())),
            Prediction::STRING
        );
        assert_eq!(prediction_from_value(&JsValue::Null), Prediction::OTHER);
    }
}
