use crate::error::SerializationError;
use crate::value::Value;

/// Turns task results into bytes and back.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

/// Human readable store format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        check(value)?;
        check_finite(value)?;
        serde_json::to_vec(value).map_err(|e| SerializationError::NotSerializable(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Malformed(e.to_string()))
    }
}

/// Compact binary store format.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        check(value)?;
        let mut buffer = Vec::new();
        ciborium::into_writer(value, &mut buffer)
            .map_err(|e| SerializationError::NotSerializable(e.to_string()))?;
        Ok(buffer)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        ciborium::from_reader(bytes).map_err(|e| SerializationError::Malformed(e.to_string()))
    }
}

/// Outputs point at live tasks and never make it into a store.
fn check(value: &Value) -> Result<(), SerializationError> {
    let mut found = None;
    value.visit_outputs(&mut |output| {
        found.get_or_insert_with(|| output.owner().name().to_string());
    });

    match found {
        Some(task) => Err(SerializationError::NotSerializable(format!(
            "value holds an unresolved output of task {task}"
        ))),
        None => Ok(()),
    }
}

/// JSON has no spelling for NaN or the infinities; serde_json would write
/// them as `null`, which never reads back as a float.
fn check_finite(value: &Value) -> Result<(), SerializationError> {
    let items: Box<dyn Iterator<Item = &Value> + '_> = match value {
        Value::Float(f) if !f.is_finite() => {
            return Err(SerializationError::NotSerializable(format!(
                "JSON cannot represent the float {f}"
            )));
        }
        Value::List(items) | Value::Tuple(items) => Box::new(items.iter()),
        Value::Set(items) => Box::new(items.iter()),
        Value::Map(map) => Box::new(map.iter().flat_map(|(k, v)| [k, v])),
        Value::Record(record) => Box::new(record.fields().iter().map(|field| &field.value)),
        _ => return Ok(()),
    };
    items.map(check_finite).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Arguments, TaskDef};
    use crate::value::Record;

    fn sample() -> Value {
        Value::map([
            ("numbers", Value::list([1, 2, 3])),
            ("pair", Value::tuple([Value::from(1.5), Value::from("x")])),
            ("tags", Value::set(["b", "a"])),
            ("empty", Value::Null),
            (
                "config",
                Record::new("Config")
                    .field("factor", 2)
                    .ignored_field("verbose", true)
                    .into(),
            ),
        ])
    }

    #[test]
    fn test_json_keeps_structure() {
        let bytes = JsonSerializer.serialize(&sample()).unwrap();
        assert_eq!(JsonSerializer.deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_cbor_keeps_structure() {
        let bytes = CborSerializer.serialize(&sample()).unwrap();
        assert_eq!(CborSerializer.deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            JsonSerializer.deserialize(b"not json"),
            Err(SerializationError::Malformed(_))
        ));
        assert!(matches!(
            CborSerializer.deserialize(&[0xff, 0x00, 0x13]),
            Err(SerializationError::Malformed(_))
        ));
    }

    #[test]
    fn test_json_refuses_non_finite_floats() {
        for f in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let nested = Value::map([("stats", Value::list([Value::from(1.0), Value::from(f)]))]);
            assert!(matches!(
                JsonSerializer.serialize(&nested),
                Err(SerializationError::NotSerializable(_))
            ));
        }

        let bytes = CborSerializer.serialize(&Value::from(f64::INFINITY)).unwrap();
        assert_eq!(
            CborSerializer.deserialize(&bytes).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn test_outputs_are_refused() {
        let output = TaskDef::new("pending")
            .run(|_| Ok(Value::Null))
            .call(Arguments::new())
            .unwrap();
        let value = Value::list([Value::from(1), Value::from(output)]);

        let err = JsonSerializer.serialize(&value).unwrap_err();
        assert!(err.to_string().contains("pending"));
        assert!(CborSerializer.serialize(&value).is_err());
    }
}
