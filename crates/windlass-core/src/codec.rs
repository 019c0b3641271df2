//! Class-instance serialization registry
//!
//! Step inputs and outputs are opaque JSON values, but user code may embed
//! instances of registered classes in them. The serializer emits a tagged
//! record for those; the deserializer looks the class up by its stable
//! `class_id` and rehydrates. Instances whose class is absent in the
//! consulting context are downgraded to a [`ClassInstanceRef`] that
//! preserves the underlying data.
//!
//! Lookup is isomorphic: an isolated (per-VM) registry is consulted first
//! and falls back to the process-wide registry.

use std::sync::OnceLock;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminator key on tagged value records.
pub const TYPE_KEY: &str = "__type";

/// Tag for serialized class instances.
pub const CLASS_INSTANCE_TAG: &str = "class_instance_ref";

/// Tag for references to durable streams embedded in step outputs.
pub const STREAM_REF_TAG: &str = "stream_ref";

/// A value type that can cross the event log as a tagged class instance.
///
/// `CLASS_ID` must be stable across processes (conventionally derived from
/// the defining module path and type name).
pub trait ClassInstance: Serialize + DeserializeOwned {
    const CLASS_ID: &'static str;
    const CLASS_NAME: &'static str;
}

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A classId was registered twice.
    #[error("class already registered: {0}")]
    DuplicateClass(String),

    /// The value is not a tagged class-instance record.
    #[error("value is not a class instance reference")]
    NotAClassRef,

    /// The record's classId does not match the requested type.
    #[error("class mismatch: expected {expected}, found {found}")]
    ClassMismatch { expected: String, found: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type ReviveFn = fn(Value) -> Result<Value, serde_json::Error>;

struct ClassEntry {
    class_name: &'static str,
    revive: ReviveFn,
}

/// Registry mapping `class_id` to a rehydrator.
///
/// The process-wide instance ([`ClassRegistry::global`]) is written once at
/// startup and read thereafter; double registration is rejected so silent
/// shadowing cannot occur.
#[derive(Default)]
pub struct ClassRegistry {
    entries: DashMap<String, ClassEntry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ClassRegistry {
        static GLOBAL: OnceLock<ClassRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ClassRegistry::new)
    }

    pub fn register<T: ClassInstance>(&self) -> Result<(), CodecError> {
        let revive: ReviveFn = |data| {
            let typed: T = serde_json::from_value(data)?;
            serde_json::to_value(typed)
        };
        // Entry-based insert keeps check-and-set atomic.
        match self.entries.entry(T::CLASS_ID.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CodecError::DuplicateClass(T::CLASS_ID.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ClassEntry {
                    class_name: T::CLASS_NAME,
                    revive,
                });
                Ok(())
            }
        }
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.entries.contains_key(class_id)
    }
}

/// The downgraded form of an instance whose class is not registered in the
/// consulting context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassInstanceRef {
    pub class_name: String,
    pub class_id: String,
    pub data: Value,
}

/// Result of reviving a value against a registry pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Revived {
    /// The class was found; `value` is the validated, normalized data.
    Instance { class_id: String, value: Value },

    /// The class is unknown here; the data survives as a reference.
    Ref(ClassInstanceRef),

    /// Not a tagged record at all.
    Plain(Value),
}

/// Serialize a registered class instance into its tagged wire record.
pub fn wrap<T: ClassInstance>(value: &T) -> Result<Value, CodecError> {
    let mut record = Map::new();
    record.insert(TYPE_KEY.into(), Value::String(CLASS_INSTANCE_TAG.into()));
    record.insert("class_name".into(), Value::String(T::CLASS_NAME.into()));
    record.insert("class_id".into(), Value::String(T::CLASS_ID.into()));
    record.insert("data".into(), serde_json::to_value(value)?);
    Ok(Value::Object(record))
}

/// Extract a typed instance from a tagged wire record.
pub fn unwrap_instance<T: ClassInstance>(value: &Value) -> Result<T, CodecError> {
    let (class_id, data) = tagged_parts(value).ok_or(CodecError::NotAClassRef)?;
    if class_id != T::CLASS_ID {
        return Err(CodecError::ClassMismatch {
            expected: T::CLASS_ID.to_string(),
            found: class_id.to_string(),
        });
    }
    Ok(serde_json::from_value(data.clone())?)
}

/// Revive a value, consulting the isolated registry first and falling back
/// to the process-wide one.
pub fn revive(value: &Value, local: Option<&ClassRegistry>) -> Revived {
    let Some((class_id, data)) = tagged_parts(value) else {
        return Revived::Plain(value.clone());
    };

    let lookup = |registry: &ClassRegistry| {
        registry.entries.get(class_id).map(|entry| {
            (entry.revive)(data.clone())
                .map(|revived| Revived::Instance {
                    class_id: class_id.to_string(),
                    value: revived,
                })
                .unwrap_or_else(|_| Revived::Ref(downgrade(value, class_id, data)))
        })
    };

    if let Some(revived) = local.and_then(lookup) {
        return revived;
    }
    if let Some(revived) = lookup(ClassRegistry::global()) {
        return revived;
    }
    Revived::Ref(downgrade(value, class_id, data))
}

fn downgrade(value: &Value, class_id: &str, data: &Value) -> ClassInstanceRef {
    let class_name = value
        .get("class_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ClassInstanceRef {
        class_name,
        class_id: class_id.to_string(),
        data: data.clone(),
    }
}

fn tagged_parts(value: &Value) -> Option<(&str, &Value)> {
    let record = value.as_object()?;
    if record.get(TYPE_KEY)?.as_str()? != CLASS_INSTANCE_TAG {
        return None;
    }
    let class_id = record.get("class_id")?.as_str()?;
    let data = record.get("data")?;
    Some((class_id, data))
}

/// A reference to a durable stream, embeddable in step outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRef {
    pub stream_name: String,
}

impl StreamRef {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            TYPE_KEY: STREAM_REF_TAG,
            "stream_name": self.stream_name,
        })
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let record = value.as_object()?;
        if record.get(TYPE_KEY)?.as_str()? != STREAM_REF_TAG {
            return None;
        }
        Some(Self::new(record.get("stream_name")?.as_str()?))
    }
}
