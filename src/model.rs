//! The model framework: dynamic objects produced by deserialization, the
//! class registry that maps class names to readers, and version dispatch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use crate::cursor::Cursor;
use crate::errors::Result;
use crate::source::Chunk;
use crate::streamers::{ElementProgram, StreamerInfo};

/// A member value inside a deserialized object.
#[derive(Clone, Debug)]
pub enum Value {
    None,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    ArrayI8(Vec<i8>),
    ArrayU8(Vec<u8>),
    ArrayI16(Vec<i16>),
    ArrayU16(Vec<u16>),
    ArrayI32(Vec<i32>),
    ArrayU32(Vec<u32>),
    ArrayI64(Vec<i64>),
    ArrayU64(Vec<u64>),
    ArrayF32(Vec<f32>),
    ArrayF64(Vec<f64>),
    List(Vec<Value>),
    Object(Arc<ObjectModel>),
    /// A `TRef`-style reference id; resolution is left to the caller.
    Ref(u32),
}

impl Value {
    /// Integer coercion across widths; `None` for non-integers.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(v) => Some(v as i64),
            Value::I8(v) => Some(v as i64),
            Value::U8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U64(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectModel> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn tojson(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(v) => json!(v),
            Value::I8(v) => json!(v),
            Value::U8(v) => json!(v),
            Value::I16(v) => json!(v),
            Value::U16(v) => json!(v),
            Value::I32(v) => json!(v),
            Value::U32(v) => json!(v),
            Value::I64(v) => json!(v),
            Value::U64(v) => json!(v),
            Value::F32(v) => json!(v),
            Value::F64(v) => json!(v),
            Value::String(v) => json!(v),
            Value::Bytes(v) => json!(v.len()),
            Value::ArrayI8(v) => json!(v),
            Value::ArrayU8(v) => json!(v),
            Value::ArrayI16(v) => json!(v),
            Value::ArrayU16(v) => json!(v),
            Value::ArrayI32(v) => json!(v),
            Value::ArrayU32(v) => json!(v),
            Value::ArrayI64(v) => json!(v),
            Value::ArrayU64(v) => json!(v),
            Value::ArrayF32(v) => json!(v),
            Value::ArrayF64(v) => json!(v),
            Value::List(v) => serde_json::Value::Array(v.iter().map(Value::tojson).collect()),
            Value::Object(v) => v.tojson(),
            Value::Ref(v) => json!({ "$ref": v }),
        }
    }
}

/// A deserialized object: class identity, the byte count declared in its
/// stream, its members in declaration order, and its base-class sub-objects
/// (multiple inheritance linearized in C++ declaration order).
#[derive(Clone, Debug, Default)]
pub struct ObjectModel {
    pub classname: String,
    pub class_version: Option<i32>,
    pub num_bytes: Option<u32>,
    pub members: Vec<(String, Value)>,
    pub bases: Vec<ObjectModel>,
}

impl ObjectModel {
    pub fn new(classname: impl Into<String>, class_version: Option<i32>) -> Self {
        ObjectModel {
            classname: classname.into(),
            class_version,
            ..Default::default()
        }
    }

    pub fn set_member(&mut self, name: impl Into<String>, value: Value) {
        self.members.push((name.into(), value));
    }

    /// Looks up a member by name: own members first, then bases in
    /// declaration order, recursively.
    pub fn member(&self, name: &str) -> Option<&Value> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.bases.iter().find_map(|base| base.member(name)))
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.member(name).is_some()
    }

    /// The base-class sub-object with the given class name, searching
    /// recursively.
    pub fn base(&self, classname: &str) -> Option<&ObjectModel> {
        for base in &self.bases {
            if base.classname == classname {
                return Some(base);
            }
            if let Some(found) = base.base(classname) {
                return Some(found);
            }
        }
        None
    }

    pub fn is_instance(&self, classname: &str) -> bool {
        self.classname == classname || self.base(classname).is_some()
    }

    /// Best-effort structural dump.
    pub fn tojson(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("_typename".into(), serde_json::json!(self.classname));
        for base in &self.bases {
            if let serde_json::Value::Object(fields) = base.tojson() {
                for (k, v) in fields {
                    if k != "_typename" {
                        map.insert(k, v);
                    }
                }
            }
        }
        for (name, value) in &self.members {
            map.insert(name.clone(), value.tojson());
        }
        serde_json::Value::Object(map)
    }
}

/// Where a class definition came from; decides whether the streamer-refresh
/// retry can replace it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Hand-written, shipped with the crate.
    Bootstrap,
    /// Registered by the caller.
    Custom,
    /// Synthesized from this file's own streamers.
    FileStreamer,
}

pub type ReaderFn =
    Arc<dyn Fn(&Chunk, &mut Cursor, &mut ReadContext<'_>) -> Result<ObjectModel> + Send + Sync>;

/// How to read one class.
#[derive(Clone)]
pub enum ClassDef {
    /// A hand-written versionless reader used for all versions of the class.
    Bootstrap(ReaderFn),
    /// A caller-registered versionless reader.
    Custom(ReaderFn),
    /// Versioned readers synthesized from streamers on demand.
    Versioned(Arc<DispatchByVersion>),
    /// No streamer and no model: instances are skippable but opaque.
    Unknown,
}

impl ClassDef {
    pub fn provenance(&self) -> Provenance {
        match self {
            ClassDef::Bootstrap(_) => Provenance::Bootstrap,
            ClassDef::Custom(_) => Provenance::Custom,
            ClassDef::Versioned(_) | ClassDef::Unknown => Provenance::FileStreamer,
        }
    }
}

/// A registry of versioned element programs for one class. Missing versions
/// trigger on-demand synthesis from the resolver's streamers.
pub struct DispatchByVersion {
    classname: String,
    programs: Mutex<HashMap<i32, Arc<ElementProgram>>>,
}

impl DispatchByVersion {
    pub fn new(classname: impl Into<String>) -> Self {
        DispatchByVersion {
            classname: classname.into(),
            programs: Mutex::new(HashMap::new()),
        }
    }

    pub fn classname(&self) -> &str {
        &self.classname
    }

    /// The program for `version`, synthesizing one from the resolver's
    /// streamers if this is the first time the version is seen.
    pub fn program_for(
        &self,
        version: i32,
        resolver: &dyn ClassResolver,
    ) -> Result<Option<Arc<ElementProgram>>> {
        if let Some(program) = self.programs.lock().unwrap().get(&version) {
            return Ok(Some(Arc::clone(program)));
        }
        let streamer = match resolver.streamer_named(&self.classname, Some(version)) {
            Some(streamer) => streamer,
            None => return Ok(None),
        };
        let program = Arc::new(crate::streamers::synthesize(&streamer, resolver)?);
        self.programs
            .lock()
            .unwrap()
            .insert(version, Arc::clone(&program));
        Ok(Some(program))
    }
}

/// An entry in the per-record back-reference table.
#[derive(Clone)]
pub enum RefEntry {
    Class(String),
    Object(Value),
}

/// State carried through the deserialization of a single record.
pub struct ReadContext<'a> {
    pub resolver: &'a dyn ClassResolver,
    /// Back-references, local to this record.
    pub refs: HashMap<u64, RefEntry>,
    /// Class definitions consulted so far, with their provenance.
    pub breadcrumbs: Vec<(String, Provenance)>,
    pub object_path: Option<String>,
}

impl<'a> ReadContext<'a> {
    pub fn new(resolver: &'a dyn ClassResolver) -> Self {
        ReadContext {
            resolver,
            refs: HashMap::new(),
            breadcrumbs: Vec::new(),
            object_path: None,
        }
    }

    pub fn with_object_path(resolver: &'a dyn ClassResolver, object_path: String) -> Self {
        let mut out = ReadContext::new(resolver);
        out.object_path = Some(object_path);
        out
    }

    /// True if any class consulted so far did not come from this file's own
    /// streamers or the bootstrap table; such reads can be retried after a
    /// streamer refresh.
    pub fn used_custom_classes(&self) -> bool {
        self.breadcrumbs
            .iter()
            .any(|(_, provenance)| *provenance == Provenance::Custom)
    }
}

/// What the deserializer needs from the enclosing file: class lookup (with
/// on-demand synthesis) and streamer access.
pub trait ClassResolver {
    fn file_path(&self) -> &Path;

    fn class_named(&self, classname: &str) -> ClassDef;

    fn streamer_named(&self, classname: &str, version: Option<i32>) -> Option<Arc<StreamerInfo>>;
}

/// The process-wide bootstrap classes, initialized once at startup.
pub fn bootstrap_registry() -> &'static HashMap<String, ClassDef> {
    static REGISTRY: OnceLock<HashMap<String, ClassDef>> = OnceLock::new();
    REGISTRY.get_or_init(crate::models::bootstrap_classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_lookup_searches_bases_in_order() {
        let mut named = ObjectModel::new("TNamed", None);
        named.set_member("fName", Value::String("h".into()));
        let mut hist = ObjectModel::new("TH1D", Some(3));
        hist.set_member("fEntries", Value::F64(39.0));
        hist.bases.push(named);

        assert_eq!(hist.member("fEntries").unwrap().as_f64(), Some(39.0));
        assert_eq!(hist.member("fName").unwrap().as_str(), Some("h"));
        assert!(hist.member("fMissing").is_none());
        assert!(hist.is_instance("TNamed"));
        assert!(!hist.is_instance("TTree"));
    }

    #[test]
    fn tojson_merges_base_members() {
        let mut named = ObjectModel::new("TNamed", None);
        named.set_member("fName", Value::String("h".into()));
        let mut hist = ObjectModel::new("TH1D", Some(3));
        hist.bases.push(named);
        hist.set_member("fEntries", Value::F64(2.0));

        let json = hist.tojson();
        assert_eq!(json["_typename"], "TH1D");
        assert_eq!(json["fName"], "h");
        assert_eq!(json["fEntries"], 2.0);
    }
}
