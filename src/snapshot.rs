//! Defensive structural snapshots.
//!
//! The cache can capture a [`Snapshot`] of a value at insertion time and
//! verify it on later retrievals to detect in-place mutation of shared
//! cached data. The capture is driven through `serde`: a private
//! serializer records the complete structure of the value -- every integer
//! width distinctly, floats by bit pattern, map entries with their key
//! structure, struct and enum shapes by name -- so that any observable
//! change to the value changes the snapshot.
//!
//! This is the moral equivalent of a reflective deep copy; in Rust the
//! per-type hook is simply `serde::Serialize`, which cached query results
//! implement by nature.

use std::fmt;

use serde::ser::{self, Serialize};

/// A structural deep-snapshot of a serializable value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot(Value);

impl Snapshot {
    /// Captures the structure of `value`. Fails only if the value's own
    /// `Serialize` implementation fails (e.g. a poisoned lock).
    pub fn capture<T: Serialize + ?Sized>(value: &T) -> Result<Snapshot, CaptureError> {
        value.serialize(ValueSerializer).map(Snapshot)
    }

    /// Structural equality between the current `value` and this snapshot.
    /// A value that can no longer be captured verifies as changed.
    pub fn verify<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match Snapshot::capture(value) {
            Ok(current) => current == *self,
            Err(_) => false,
        }
    }
}

impl Serialize for Snapshot {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Error produced by a value's `Serialize` implementation during capture.
#[derive(Clone, Debug)]
pub struct CaptureError(String);

impl fmt::Display for CaptureError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "snapshot capture failed: {}", self.0)
    }
}

impl std::error::Error for CaptureError {}

impl ser::Error for CaptureError {
    fn custom<T: fmt::Display>(msg: T) -> CaptureError {
        CaptureError(msg.to_string())
    }
}

/// The recorded structure. Numeric kinds are kept distinct and floats are
/// stored as bit patterns so the tree is `Eq`.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Value {
    Unit,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    F32(u32),
    F64(u64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    None,
    Some(Box<Value>),
    UnitStruct(&'static str),
    UnitVariant(&'static str, u32, &'static str),
    NewtypeStruct(&'static str, Box<Value>),
    NewtypeVariant(&'static str, u32, &'static str, Box<Value>),
    Seq(Vec<Value>),
    Tuple(Vec<Value>),
    TupleStruct(&'static str, Vec<Value>),
    TupleVariant(&'static str, u32, &'static str, Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(&'static str, Vec<(&'static str, Value)>),
    StructVariant(&'static str, u32, &'static str, Vec<(&'static str, Value)>),
}

impl Serialize for Value {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::{
            SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
            SerializeTupleStruct, SerializeTupleVariant,
        };

        match self {
            Value::Unit => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::I8(v) => serializer.serialize_i8(*v),
            Value::I16(v) => serializer.serialize_i16(*v),
            Value::I32(v) => serializer.serialize_i32(*v),
            Value::I64(v) => serializer.serialize_i64(*v),
            Value::I128(v) => serializer.serialize_i128(*v),
            Value::U8(v) => serializer.serialize_u8(*v),
            Value::U16(v) => serializer.serialize_u16(*v),
            Value::U32(v) => serializer.serialize_u32(*v),
            Value::U64(v) => serializer.serialize_u64(*v),
            Value::U128(v) => serializer.serialize_u128(*v),
            Value::F32(bits) => serializer.serialize_f32(f32::from_bits(*bits)),
            Value::F64(bits) => serializer.serialize_f64(f64::from_bits(*bits)),
            Value::Char(v) => serializer.serialize_char(*v),
            Value::Str(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.serialize_bytes(v),
            Value::None => serializer.serialize_none(),
            Value::Some(v) => serializer.serialize_some(v),
            Value::UnitStruct(name) => serializer.serialize_unit_struct(*name),
            Value::UnitVariant(name, index, variant) => {
                serializer.serialize_unit_variant(*name, *index, *variant)
            }
            Value::NewtypeStruct(name, v) => serializer.serialize_newtype_struct(*name, v),
            Value::NewtypeVariant(name, index, variant, v) => {
                serializer.serialize_newtype_variant(*name, *index, *variant, v)
            }
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Tuple(items) => {
                let mut tuple = serializer.serialize_tuple(items.len())?;
                for item in items {
                    tuple.serialize_element(item)?;
                }
                tuple.end()
            }
            Value::TupleStruct(name, items) => {
                let mut tuple = serializer.serialize_tuple_struct(*name, items.len())?;
                for item in items {
                    tuple.serialize_field(item)?;
                }
                tuple.end()
            }
            Value::TupleVariant(name, index, variant, items) => {
                let mut tuple =
                    serializer.serialize_tuple_variant(*name, *index, *variant, items.len())?;
                for item in items {
                    tuple.serialize_field(item)?;
                }
                tuple.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Struct(name, fields) => {
                let mut st = serializer.serialize_struct(*name, fields.len())?;
                for (field, value) in fields {
                    st.serialize_field(*field, value)?;
                }
                st.end()
            }
            Value::StructVariant(name, index, variant, fields) => {
                let mut st =
                    serializer.serialize_struct_variant(*name, *index, *variant, fields.len())?;
                for (field, value) in fields {
                    st.serialize_field(*field, value)?;
                }
                st.end()
            }
        }
    }
}

struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = CaptureError;

    type SerializeSeq = SeqCollector;
    type SerializeTuple = SeqCollector;
    type SerializeTupleStruct = SeqCollector;
    type SerializeTupleVariant = SeqCollector;
    type SerializeMap = MapCollector;
    type SerializeStruct = StructCollector;
    type SerializeStructVariant = StructCollector;

    fn serialize_bool(self, v: bool) -> Result<Value, CaptureError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, CaptureError> {
        Ok(Value::I8(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Value, CaptureError> {
        Ok(Value::I16(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Value, CaptureError> {
        Ok(Value::I32(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Value, CaptureError> {
        Ok(Value::I64(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Value, CaptureError> {
        Ok(Value::I128(v))
    }

    fn serialize_u8(self, v: u8) -> Result<Value, CaptureError> {
        Ok(Value::U8(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Value, CaptureError> {
        Ok(Value::U16(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Value, CaptureError> {
        Ok(Value::U32(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Value, CaptureError> {
        Ok(Value::U64(v))
    }

    fn serialize_u128(self, v: u128) -> Result<Value, CaptureError> {
        Ok(Value::U128(v))
    }

    fn serialize_f32(self, v: f32) -> Result<Value, CaptureError> {
        Ok(Value::F32(v.to_bits()))
    }

    fn serialize_f64(self, v: f64) -> Result<Value, CaptureError> {
        Ok(Value::F64(v.to_bits()))
    }

    fn serialize_char(self, v: char) -> Result<Value, CaptureError> {
        Ok(Value::Char(v))
    }

    fn serialize_str(self, v: &str) -> Result<Value, CaptureError> {
        Ok(Value::Str(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, CaptureError> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<Value, CaptureError> {
        Ok(Value::None)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, CaptureError> {
        Ok(Value::Some(Box::new(value.serialize(ValueSerializer)?)))
    }

    fn serialize_unit(self) -> Result<Value, CaptureError> {
        Ok(Value::Unit)
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<Value, CaptureError> {
        Ok(Value::UnitStruct(name))
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        variant_index: u32,
        variant: &'static str,
    ) -> Result<Value, CaptureError> {
        Ok(Value::UnitVariant(name, variant_index, variant))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<Value, CaptureError> {
        Ok(Value::NewtypeStruct(
            name,
            Box::new(value.serialize(ValueSerializer)?),
        ))
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, CaptureError> {
        Ok(Value::NewtypeVariant(
            name,
            variant_index,
            variant,
            Box::new(value.serialize(ValueSerializer)?),
        ))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqCollector, CaptureError> {
        Ok(SeqCollector {
            shape: SeqShape::Seq,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqCollector, CaptureError> {
        Ok(SeqCollector {
            shape: SeqShape::Tuple,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        len: usize,
    ) -> Result<SeqCollector, CaptureError> {
        Ok(SeqCollector {
            shape: SeqShape::TupleStruct(name),
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqCollector, CaptureError> {
        Ok(SeqCollector {
            shape: SeqShape::TupleVariant(name, variant_index, variant),
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapCollector, CaptureError> {
        Ok(MapCollector {
            entries: Vec::with_capacity(len.unwrap_or(0)),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        name: &'static str,
        len: usize,
    ) -> Result<StructCollector, CaptureError> {
        Ok(StructCollector {
            name,
            variant: None,
            fields: Vec::with_capacity(len),
        })
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<StructCollector, CaptureError> {
        Ok(StructCollector {
            name,
            variant: Some((variant_index, variant)),
            fields: Vec::with_capacity(len),
        })
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

enum SeqShape {
    Seq,
    Tuple,
    TupleStruct(&'static str),
    TupleVariant(&'static str, u32, &'static str),
}

struct SeqCollector {
    shape: SeqShape,
    items: Vec<Value>,
}

impl SeqCollector {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CaptureError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn finish(self) -> Value {
        match self.shape {
            SeqShape::Seq => Value::Seq(self.items),
            SeqShape::Tuple => Value::Tuple(self.items),
            SeqShape::TupleStruct(name) => Value::TupleStruct(name, self.items),
            SeqShape::TupleVariant(name, index, variant) => {
                Value::TupleVariant(name, index, variant, self.items)
            }
        }
    }
}

impl ser::SerializeSeq for SeqCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CaptureError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CaptureError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CaptureError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for SeqCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CaptureError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(self.finish())
    }
}

struct MapCollector {
    entries: Vec<(Value, Value)>,
    pending_key: Option<Value>,
}

impl ser::SerializeMap for MapCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CaptureError> {
        self.pending_key = Some(key.serialize(ValueSerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CaptureError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| ser::Error::custom("map value serialized before its key"))?;
        self.entries.push((key, value.serialize(ValueSerializer)?));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(Value::Map(self.entries))
    }
}

struct StructCollector {
    name: &'static str,
    variant: Option<(u32, &'static str)>,
    fields: Vec<(&'static str, Value)>,
}

impl ser::SerializeStruct for StructCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CaptureError> {
        self.fields.push((key, value.serialize(ValueSerializer)?));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(Value::Struct(self.name, self.fields))
    }
}

impl ser::SerializeStructVariant for StructCollector {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CaptureError> {
        self.fields.push((key, value.serialize(ValueSerializer)?));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        match self.variant {
            Some((index, variant)) => {
                Ok(Value::StructVariant(self.name, index, variant, self.fields))
            }
            None => Err(ser::Error::custom("struct variant ended without a variant")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Account {
        id: u64,
        name: String,
        balances: BTreeMap<String, i64>,
    }

    #[derive(Serialize)]
    enum Event {
        Opened,
        Renamed(String),
        Adjusted { delta: i64 },
    }

    fn account() -> Account {
        let mut balances = BTreeMap::new();
        balances.insert("usd".to_owned(), 125);
        Account {
            id: 7,
            name: "primary".to_owned(),
            balances,
        }
    }

    #[test]
    fn unchanged_value_verifies() {
        let value = account();
        let snapshot = Snapshot::capture(&value).unwrap();
        assert!(snapshot.verify(&value));
    }

    #[test]
    fn mutation_is_detected() {
        let value = Mutex::new(vec![1, 2, 3]);
        let snapshot = Snapshot::capture(&value).unwrap();
        assert!(snapshot.verify(&value));

        value.lock().unwrap().push(4);
        assert!(!snapshot.verify(&value));
    }

    #[test]
    fn map_entry_mutation_is_detected() {
        let mut value = account();
        let snapshot = Snapshot::capture(&value).unwrap();

        value.balances.insert("eur".to_owned(), 3);
        assert!(!snapshot.verify(&value));
    }

    #[test]
    fn numeric_kind_is_preserved() {
        let as_i64 = Snapshot::capture(&1i64).unwrap();
        let as_u64 = Snapshot::capture(&1u64).unwrap();
        assert_ne!(as_i64, as_u64);
        assert!(!as_i64.verify(&1u64));
    }

    #[test]
    fn float_bits_are_compared() {
        let snapshot = Snapshot::capture(&f64::NAN).unwrap();
        assert!(snapshot.verify(&f64::NAN));
        assert!(!snapshot.verify(&0.0f64));
    }

    #[test]
    fn enum_variants_are_distinguished() {
        let opened = Snapshot::capture(&Event::Opened).unwrap();
        assert!(!opened.verify(&Event::Renamed("primary".to_owned())));
        assert!(opened.verify(&Event::Opened));

        let adjusted = Snapshot::capture(&Event::Adjusted { delta: 1 }).unwrap();
        assert!(!adjusted.verify(&Event::Adjusted { delta: 2 }));
    }
}
