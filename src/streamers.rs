//! The schema subsystem: parsing `TStreamerInfo` records, synthesizing
//! readers for classes described by them, and serializing streamers back when
//! updating a file.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::cursor::Cursor;
use crate::deserialization::{
    check_numbytes, error, numbytes_version, read_class, read_object_any,
};
use crate::errors::{Error, Result};
use crate::model::{ClassResolver, ObjectModel, ReadContext, Value};
use crate::serialization;
use crate::source::Chunk;
use crate::STREAMED_MEMBERWISE;

/// `TStreamerElement::fType` codes.
pub mod etype {
    pub const BASE: i32 = 0;
    pub const CHAR: i32 = 1;
    pub const SHORT: i32 = 2;
    pub const INT: i32 = 3;
    pub const LONG: i32 = 4;
    pub const FLOAT: i32 = 5;
    pub const COUNTER: i32 = 6;
    pub const CHAR_STAR: i32 = 7;
    pub const DOUBLE: i32 = 8;
    pub const DOUBLE32: i32 = 9;
    pub const LEGACY_CHAR: i32 = 10;
    pub const UCHAR: i32 = 11;
    pub const USHORT: i32 = 12;
    pub const UINT: i32 = 13;
    pub const ULONG: i32 = 14;
    pub const BITS: i32 = 15;
    pub const LONG64: i32 = 16;
    pub const ULONG64: i32 = 17;
    pub const BOOL: i32 = 18;
    pub const FLOAT16: i32 = 19;
    /// Added to a primitive code for a fixed-length array member.
    pub const OFFSET_L: i32 = 20;
    /// Added to a primitive code for a counted (variable-length) member.
    pub const OFFSET_P: i32 = 40;
    pub const OBJECT: i32 = 61;
    pub const ANY: i32 = 62;
    pub const OBJECTP: i32 = 63;
    pub const OBJECT_P: i32 = 64;
    pub const TSTRING: i32 = 65;
    pub const TOBJECT: i32 = 66;
    pub const TNAMED: i32 = 67;
    pub const ANYP: i32 = 68;
    pub const ANY_P: i32 = 69;
    pub const ANY_P_NO_VT: i32 = 70;
    pub const STLP: i32 = 71;
    pub const SKIP: i32 = 100;
    pub const STL: i32 = 300;
    pub const STL_STRING: i32 = 365;
    pub const STREAMER: i32 = 500;
    pub const STREAM_LOOP: i32 = 501;
}

/// The primitive decoders a synthesized reader can dispatch to.
///
/// `Float16` is a 32-bit float written with a truncated mantissa; `Double32`
/// is a 64-bit value written as 32 bits. Both decode from 4 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimCode {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Float16,
    Double32,
}

impl PrimCode {
    fn from_basic(code: i32) -> Option<PrimCode> {
        match code {
            etype::CHAR | etype::LEGACY_CHAR => Some(PrimCode::I8),
            etype::SHORT => Some(PrimCode::I16),
            etype::INT | etype::COUNTER => Some(PrimCode::I32),
            etype::LONG | etype::LONG64 => Some(PrimCode::I64),
            etype::FLOAT => Some(PrimCode::F32),
            etype::DOUBLE => Some(PrimCode::F64),
            etype::DOUBLE32 => Some(PrimCode::Double32),
            etype::UCHAR => Some(PrimCode::U8),
            etype::USHORT => Some(PrimCode::U16),
            etype::UINT | etype::BITS => Some(PrimCode::U32),
            etype::ULONG | etype::ULONG64 => Some(PrimCode::U64),
            etype::BOOL => Some(PrimCode::Bool),
            etype::FLOAT16 => Some(PrimCode::Float16),
            _ => None,
        }
    }

    fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &ReadContext<'_>,
    ) -> Result<Value> {
        let path = ctx.resolver.file_path();
        Ok(match self {
            PrimCode::Bool => Value::Bool(cursor.read_bool(chunk, path)?),
            PrimCode::I8 => Value::I8(cursor.read_i8(chunk, path)?),
            PrimCode::U8 => Value::U8(cursor.read_u8(chunk, path)?),
            PrimCode::I16 => Value::I16(cursor.read_i16(chunk, path)?),
            PrimCode::U16 => Value::U16(cursor.read_u16(chunk, path)?),
            PrimCode::I32 => Value::I32(cursor.read_i32(chunk, path)?),
            PrimCode::U32 => Value::U32(cursor.read_u32(chunk, path)?),
            PrimCode::I64 => Value::I64(cursor.read_i64(chunk, path)?),
            PrimCode::U64 => Value::U64(cursor.read_u64(chunk, path)?),
            PrimCode::F32 | PrimCode::Float16 => Value::F32(cursor.read_f32(chunk, path)?),
            PrimCode::F64 => Value::F64(cursor.read_f64(chunk, path)?),
            PrimCode::Double32 => Value::F64(cursor.read_f32(chunk, path)? as f64),
        })
    }

    fn read_array(
        &self,
        count: usize,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &ReadContext<'_>,
    ) -> Result<Value> {
        let path = ctx.resolver.file_path();
        macro_rules! array {
            ($variant:ident, $reader:ident) => {{
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(cursor.$reader(chunk, path)?);
                }
                Value::$variant(out)
            }};
        }
        Ok(match self {
            PrimCode::Bool | PrimCode::U8 => array!(ArrayU8, read_u8),
            PrimCode::I8 => array!(ArrayI8, read_i8),
            PrimCode::I16 => array!(ArrayI16, read_i16),
            PrimCode::U16 => array!(ArrayU16, read_u16),
            PrimCode::I32 => array!(ArrayI32, read_i32),
            PrimCode::U32 => array!(ArrayU32, read_u32),
            PrimCode::I64 => array!(ArrayI64, read_i64),
            PrimCode::U64 => array!(ArrayU64, read_u64),
            PrimCode::F32 | PrimCode::Float16 => array!(ArrayF32, read_f32),
            PrimCode::F64 => array!(ArrayF64, read_f64),
            PrimCode::Double32 => {
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(cursor.read_f32(chunk, path)? as f64);
                }
                Value::ArrayF64(out)
            }
        })
    }
}

/// One field descriptor inside a [`StreamerInfo`].
#[derive(Clone, Debug)]
pub struct StreamerElement {
    /// The concrete `TStreamer*` class this element was streamed as.
    pub element_class: String,
    pub name: String,
    pub title: String,
    pub etype: i32,
    pub size: i32,
    pub array_length: i32,
    pub type_name: String,
    /// `TStreamerBase` only.
    pub base_version: Option<i32>,
    /// `TStreamerBasicPointer` and `TStreamerLoop` only.
    pub count_name: Option<String>,
    pub count_class: Option<String>,
    pub count_version: Option<i32>,
}

/// The layout of one class version, as described by the file.
#[derive(Clone, Debug)]
pub struct StreamerInfo {
    pub name: String,
    pub checksum: u32,
    pub class_version: i32,
    pub elements: Vec<StreamerElement>,
    /// The element's bytes as they appeared in the streamer list (including
    /// the trailing option byte), reused verbatim when updating a file.
    pub raw: Vec<u8>,
}

/// All streamers in a file plus any preserved schema-evolution rule lists.
#[derive(Default)]
pub struct StreamerRegistry {
    infos: HashMap<String, BTreeMap<i32, Arc<StreamerInfo>>>,
    /// Raw serializations of nested TLists of TObjString (C++ rule snippets),
    /// preserved verbatim but never evaluated.
    rules: Vec<Vec<u8>>,
}

impl StreamerRegistry {
    /// Parses the decompressed streamer-info record: a TList of
    /// TStreamerInfo, possibly followed by TLists of TObjStrings.
    pub fn parse(
        chunk: &Chunk,
        mut cursor: Cursor,
        resolver: &dyn ClassResolver,
    ) -> Result<StreamerRegistry> {
        let mut ctx = ReadContext::new(resolver);
        let tlist = read_class("TList", chunk, &mut cursor, &mut ctx)?;

        let mut registry = StreamerRegistry::default();
        let items = tlist
            .member("items")
            .and_then(Value::as_list)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let ranges = match tlist.member("@byte_ranges") {
            Some(Value::ArrayU64(ranges)) => ranges.clone(),
            _ => Vec::new(),
        };

        for (i, item) in items.iter().enumerate() {
            let raw = if 2 * i + 1 < ranges.len() {
                chunk
                    .get(ranges[2 * i], ranges[2 * i + 1], resolver.file_path())?
                    .to_vec()
            } else {
                Vec::new()
            };
            match item {
                Value::Object(model) if model.classname == "TStreamerInfo" => {
                    if let Some(info) = streamer_info_from_model(model.as_ref(), raw) {
                        debug!(class = %info.name, version = info.class_version, "streamer");
                        registry
                            .infos
                            .entry(info.name.clone())
                            .or_default()
                            .insert(info.class_version, Arc::new(info));
                    }
                }
                Value::Object(model) if model.classname == "TList" => {
                    registry.rules.push(raw);
                }
                _ => {}
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, info: StreamerInfo) {
        self.infos
            .entry(info.name.clone())
            .or_default()
            .insert(info.class_version, Arc::new(info));
    }

    /// The streamer for a class, at an exact version or (with `None`) the
    /// maximum known version.
    pub fn streamer_named(&self, classname: &str, version: Option<i32>) -> Option<Arc<StreamerInfo>> {
        let versions = self.infos.get(classname)?;
        match version {
            Some(version) => versions.get(&version).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    pub fn classnames(&self) -> impl Iterator<Item = &str> {
        self.infos.keys().map(String::as_str)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<StreamerInfo>> {
        self.infos.values().flat_map(|versions| versions.values())
    }

    pub fn rules(&self) -> &[Vec<u8>] {
        &self.rules
    }

    /// Converts a deserialized `TStreamerInfo` model, keeping its raw bytes
    /// for write-back.
    pub fn info_from_model(model: &ObjectModel, raw: Vec<u8>) -> Option<StreamerInfo> {
        streamer_info_from_model(model, raw)
    }
}

fn element_from_model(model: &ObjectModel) -> Option<StreamerElement> {
    // The element data lives on the TStreamerElement base; subclass members
    // (count names, base versions) live on the concrete model.
    let base = if model.classname == "TStreamerElement" {
        model
    } else {
        model.base("TStreamerElement")?
    };
    let member_str = |of: &ObjectModel, name: &str| -> Option<String> {
        of.member(name).and_then(|v| v.as_str().map(str::to_owned))
    };
    let member_i32 = |of: &ObjectModel, name: &str| -> Option<i32> {
        of.member(name).and_then(Value::as_i64).map(|v| v as i32)
    };
    Some(StreamerElement {
        element_class: model.classname.clone(),
        name: member_str(base, "fName")?,
        title: member_str(base, "fTitle").unwrap_or_default(),
        etype: member_i32(base, "fType")?,
        size: member_i32(base, "fSize").unwrap_or(0),
        array_length: member_i32(base, "fArrayLength").unwrap_or(0),
        type_name: member_str(base, "fTypeName").unwrap_or_default(),
        base_version: member_i32(model, "fBaseVersion"),
        count_name: member_str(model, "fCountName"),
        count_class: member_str(model, "fCountClass"),
        count_version: member_i32(model, "fCountVersion"),
    })
}

fn streamer_info_from_model(model: &ObjectModel, raw: Vec<u8>) -> Option<StreamerInfo> {
    let name = model.member("fName")?.as_str()?.to_owned();
    let checksum = model.member("fCheckSum").and_then(Value::as_i64).unwrap_or(0) as u32;
    let class_version = model.member("fClassVersion").and_then(Value::as_i64)? as i32;
    let mut elements = Vec::new();
    if let Some(Value::Object(array)) = model.member("fElements") {
        if let Some(items) = array.member("items").and_then(Value::as_list) {
            for item in items {
                if let Value::Object(element) = item {
                    elements.push(element_from_model(element)?);
                }
            }
        }
    }
    Some(StreamerInfo {
        name,
        checksum,
        class_version,
        elements,
        raw,
    })
}

/// What an STL-container element decodes to.
#[derive(Clone, Debug)]
pub enum StlSpec {
    VectorPrim(PrimCode),
    VectorString,
    String,
    /// Not covered by the typename grammar: skipped via the container's
    /// byte-count header.
    Unknown,
}

/// One step of a synthesized class reader.
#[derive(Clone, Debug)]
pub enum ReadOp {
    /// Recursively read a model for the named base class.
    Base { classname: String },
    /// Read one primitive into a member.
    Primitive { name: String, code: PrimCode },
    /// Read a fixed-length array of primitives.
    FixedArray {
        name: String,
        code: PrimCode,
        len: usize,
    },
    /// Read a 1-byte flag, then as many primitives as a previously read
    /// sibling member dictates.
    CountedArray {
        name: String,
        code: PrimCode,
        count_member: String,
    },
    /// A 4-byte length followed by that many bytes.
    CharStar { name: String },
    /// A length-prefixed string.
    StringMember { name: String },
    /// Read a nested model of a statically known class.
    ObjectMember { name: String, classname: String },
    /// Read an inline-tagged polymorphic reference.
    ObjectAny { name: String },
    /// An STL container with its own byte-count header.
    Stl { name: String, spec: StlSpec },
    /// Skip 6 bytes, then read `count_member` instances of a class.
    Loop {
        name: String,
        count_member: String,
        classname: String,
    },
    /// Artificial elements: skip the declared size.
    SkipBytes { name: String, bytes: usize },
}

/// The interpreted reader for one (class, version) pair.
#[derive(Clone, Debug)]
pub struct ElementProgram {
    pub classname: String,
    pub class_version: i32,
    pub ops: Vec<ReadOp>,
}

/// Strips pointer and reference decorations from a C++ type name.
fn strip_pointer(type_name: &str) -> &str {
    type_name.trim_end_matches(['*', '&', ' '])
}

/// A minimal typename grammar for STL containers of primitives and strings.
fn parse_stl_typename(type_name: &str) -> StlSpec {
    let type_name = strip_pointer(type_name);
    if type_name == "string" || type_name == "std::string" {
        return StlSpec::String;
    }
    let inner = type_name
        .strip_prefix("std::vector<")
        .or_else(|| type_name.strip_prefix("vector<"))
        .and_then(|rest| rest.strip_suffix('>'));
    match inner.map(str::trim) {
        Some("string") | Some("std::string") | Some("TString") => StlSpec::VectorString,
        Some(primitive) => match primitive {
            "bool" | "Bool_t" => StlSpec::VectorPrim(PrimCode::Bool),
            "char" | "Char_t" => StlSpec::VectorPrim(PrimCode::I8),
            "unsigned char" | "UChar_t" => StlSpec::VectorPrim(PrimCode::U8),
            "short" | "Short_t" => StlSpec::VectorPrim(PrimCode::I16),
            "unsigned short" | "UShort_t" => StlSpec::VectorPrim(PrimCode::U16),
            "int" | "Int_t" => StlSpec::VectorPrim(PrimCode::I32),
            "unsigned int" | "UInt_t" => StlSpec::VectorPrim(PrimCode::U32),
            "long" | "Long_t" | "long long" | "Long64_t" => StlSpec::VectorPrim(PrimCode::I64),
            "unsigned long" | "ULong_t" | "unsigned long long" | "ULong64_t" => {
                StlSpec::VectorPrim(PrimCode::U64)
            }
            "float" | "Float_t" => StlSpec::VectorPrim(PrimCode::F32),
            "double" | "Double_t" => StlSpec::VectorPrim(PrimCode::F64),
            _ => StlSpec::Unknown,
        },
        None => StlSpec::Unknown,
    }
}

/// Builds the interpreted reader for one streamer.
pub fn synthesize(info: &StreamerInfo, resolver: &dyn ClassResolver) -> Result<ElementProgram> {
    let mut ops = Vec::with_capacity(info.elements.len());
    for element in &info.elements {
        let name = element.name.clone();
        let op = match element.etype {
            etype::BASE => ReadOp::Base {
                classname: element.name.clone(),
            },
            etype::CHAR_STAR => ReadOp::CharStar { name },
            code @ 1..=19 => match PrimCode::from_basic(code) {
                Some(prim) if element.array_length > 0 => ReadOp::FixedArray {
                    name,
                    code: prim,
                    len: element.array_length as usize,
                },
                Some(prim) => ReadOp::Primitive { name, code: prim },
                None => {
                    return Err(Error::schema(
                        resolver.file_path(),
                        format!(
                            "unknown primitive code {code} in member {name} of {}",
                            info.name
                        ),
                    ));
                }
            },
            code if (etype::OFFSET_L + 1..=etype::OFFSET_L + 19).contains(&code) => {
                match PrimCode::from_basic(code - etype::OFFSET_L) {
                    Some(prim) => ReadOp::FixedArray {
                        name,
                        code: prim,
                        len: element.array_length.max(1) as usize,
                    },
                    None => {
                        return Err(Error::schema(
                            resolver.file_path(),
                            format!(
                                "unknown primitive code {code} in member {name} of {}",
                                info.name
                            ),
                        ));
                    }
                }
            }
            code if (etype::OFFSET_P + 1..=etype::OFFSET_P + 19).contains(&code) => {
                let count_member = element.count_name.clone().ok_or_else(|| {
                    Error::schema(
                        resolver.file_path(),
                        format!("counted member {name} of {} names no counter", info.name),
                    )
                })?;
                match PrimCode::from_basic(code - etype::OFFSET_P) {
                    Some(prim) => ReadOp::CountedArray {
                        name,
                        code: prim,
                        count_member,
                    },
                    None => {
                        return Err(Error::schema(
                            resolver.file_path(),
                            format!(
                                "unknown primitive code {code} in member {name} of {}",
                                info.name
                            ),
                        ));
                    }
                }
            }
            etype::TSTRING => ReadOp::StringMember { name },
            etype::TOBJECT => ReadOp::ObjectMember {
                name,
                classname: "TObject".into(),
            },
            etype::TNAMED => ReadOp::ObjectMember {
                name,
                classname: "TNamed".into(),
            },
            etype::OBJECT | etype::ANY => ReadOp::ObjectMember {
                name,
                classname: strip_pointer(&element.type_name).to_owned(),
            },
            etype::OBJECTP
            | etype::OBJECT_P
            | etype::ANYP
            | etype::ANY_P
            | etype::ANY_P_NO_VT
            | etype::STLP => ReadOp::ObjectAny { name },
            etype::STL | etype::STL_STRING => ReadOp::Stl {
                name,
                spec: parse_stl_typename(&element.type_name),
            },
            etype::STREAMER | etype::STREAM_LOOP => {
                let count_member = element.count_name.clone().ok_or_else(|| {
                    Error::schema(
                        resolver.file_path(),
                        format!("loop member {name} of {} names no counter", info.name),
                    )
                })?;
                ReadOp::Loop {
                    name,
                    count_member,
                    classname: strip_pointer(&element.type_name).to_owned(),
                }
            }
            code if code >= etype::SKIP || element.element_class == "TStreamerArtificial" => {
                ReadOp::SkipBytes {
                    name,
                    bytes: element.size.max(0) as usize,
                }
            }
            code => {
                return Err(Error::schema(
                    resolver.file_path(),
                    format!(
                        "unknown element code {code} in member {name} of {}",
                        info.name
                    ),
                ));
            }
        };
        ops.push(op);
    }
    debug!(class = %info.name, version = info.class_version, ops = ops.len(), "synthesized reader");
    Ok(ElementProgram {
        classname: info.name.clone(),
        class_version: info.class_version,
        ops,
    })
}

fn read_stl(
    name: &str,
    spec: &StlSpec,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<Value> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    if version & STREAMED_MEMBERWISE != 0 {
        return Err(Error::not_implemented(
            &path,
            format!("memberwise serialization of STL member {name}"),
        ));
    }
    match spec {
        StlSpec::String => Ok(Value::String(cursor.string(chunk, &path)?)),
        StlSpec::VectorPrim(code) => {
            let count = cursor.read_i32(chunk, &path)?.max(0) as usize;
            code.read_array(count, chunk, cursor, ctx)
        }
        StlSpec::VectorString => {
            let count = cursor.read_i32(chunk, &path)?.max(0) as usize;
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(Value::String(cursor.string(chunk, &path)?));
            }
            Ok(Value::List(out))
        }
        StlSpec::Unknown => match num_bytes {
            Some(num_bytes) => {
                cursor.move_to(start.index() + num_bytes as u64);
                Ok(Value::None)
            }
            None => Err(error(
                ctx,
                chunk,
                cursor,
                format!("STL member {name} has an unknown container type and no byte count"),
            )),
        },
    }
}

/// Runs a synthesized program. The caller has already consumed the record's
/// num-bytes/version header and verifies the byte count afterward.
pub fn execute(
    program: &ElementProgram,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
    classname: &str,
    version: i32,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let mut out = ObjectModel::new(classname, Some(version));
    for op in &program.ops {
        match op {
            ReadOp::Base { classname } => {
                let base = read_class(classname, chunk, cursor, ctx)?;
                out.bases.push(base);
            }
            ReadOp::Primitive { name, code } => {
                let value = code.read(chunk, cursor, ctx)?;
                out.set_member(name.clone(), value);
            }
            ReadOp::FixedArray { name, code, len } => {
                let value = code.read_array(*len, chunk, cursor, ctx)?;
                out.set_member(name.clone(), value);
            }
            ReadOp::CountedArray {
                name,
                code,
                count_member,
            } => {
                cursor.skip(1);
                let count = out
                    .member(count_member)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        error(
                            ctx,
                            chunk,
                            cursor,
                            format!("counter member {count_member} was not read before {name}"),
                        )
                    })?;
                let value = code.read_array(count.max(0) as usize, chunk, cursor, ctx)?;
                out.set_member(name.clone(), value);
            }
            ReadOp::CharStar { name } => {
                let count = cursor.read_i32(chunk, &path)?.max(0) as u64;
                let bytes = cursor.bytes(chunk, count, &path)?.to_vec();
                out.set_member(name.clone(), Value::Bytes(bytes));
            }
            ReadOp::StringMember { name } => {
                let value = cursor.string(chunk, &path)?;
                out.set_member(name.clone(), Value::String(value));
            }
            ReadOp::ObjectMember { name, classname } => {
                let value = read_class(classname, chunk, cursor, ctx)?;
                out.set_member(name.clone(), Value::Object(Arc::new(value)));
            }
            ReadOp::ObjectAny { name } => {
                let value = read_object_any(chunk, cursor, ctx)?;
                out.set_member(name.clone(), value);
            }
            ReadOp::Stl { name, spec } => {
                let value = read_stl(name, spec, chunk, cursor, ctx)?;
                out.set_member(name.clone(), value);
            }
            ReadOp::Loop {
                name,
                count_member,
                classname,
            } => {
                cursor.skip(6);
                let count = out
                    .member(count_member)
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .max(0);
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(Value::Object(Arc::new(read_class(
                        classname, chunk, cursor, ctx,
                    )?)));
                }
                out.set_member(name.clone(), Value::List(items));
            }
            ReadOp::SkipBytes { name: _, bytes } => {
                cursor.skip(*bytes as u64);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Bootstrap models for the TStreamer* family.

pub(crate) fn read_streamer_element_base(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TStreamerElement", Some(version as i32));
    out.bases.push(read_class("TNamed", chunk, cursor, ctx)?);

    let mut ftype = cursor.read_i32(chunk, &path)?;
    let fsize = cursor.read_i32(chunk, &path)?;
    let farraylength = cursor.read_i32(chunk, &path)?;
    let farraydim = cursor.read_i32(chunk, &path)?;
    let max_index_len = if version == 1 {
        cursor.read_i32(chunk, &path)?.max(0) as usize
    } else {
        5
    };
    let mut max_index = Vec::with_capacity(max_index_len);
    for _ in 0..max_index_len {
        max_index.push(cursor.read_i32(chunk, &path)?);
    }
    let type_name = cursor.string(chunk, &path)?;
    if ftype == etype::UCHAR && (type_name == "Bool_t" || type_name == "bool") {
        ftype = etype::BOOL;
    }

    out.set_member("fType", Value::I32(ftype));
    out.set_member("fSize", Value::I32(fsize));
    out.set_member("fArrayLength", Value::I32(farraylength));
    out.set_member("fArrayDim", Value::I32(farraydim));
    out.set_member("fMaxIndex", Value::ArrayI32(max_index));
    out.set_member("fTypeName", Value::String(type_name));

    check_numbytes(ctx, chunk, &start, cursor, "TStreamerElement", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

/// Elements whose concrete class adds nothing beyond `TStreamerElement`.
fn read_plain_element(
    classname: &'static str,
) -> impl Fn(&Chunk, &mut Cursor, &mut ReadContext<'_>) -> Result<ObjectModel> {
    move |chunk, cursor, ctx| {
        let start = *cursor;
        let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
        let mut out = ObjectModel::new(classname, Some(version as i32));
        out.bases
            .push(read_streamer_element_base(chunk, cursor, ctx)?);
        check_numbytes(ctx, chunk, &start, cursor, classname, num_bytes)?;
        out.num_bytes = num_bytes;
        Ok(out)
    }
}

pub(crate) fn read_tstreamerbase(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TStreamerBase", Some(version as i32));
    out.bases
        .push(read_streamer_element_base(chunk, cursor, ctx)?);
    if version >= 2 {
        let base_version = cursor.read_i32(chunk, &path)?;
        out.set_member("fBaseVersion", Value::I32(base_version));
    }
    check_numbytes(ctx, chunk, &start, cursor, "TStreamerBase", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

fn read_counted_element(
    classname: &'static str,
) -> impl Fn(&Chunk, &mut Cursor, &mut ReadContext<'_>) -> Result<ObjectModel> {
    move |chunk, cursor, ctx| {
        let path = ctx.resolver.file_path().to_path_buf();
        let start = *cursor;
        let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
        let mut out = ObjectModel::new(classname, Some(version as i32));
        out.bases
            .push(read_streamer_element_base(chunk, cursor, ctx)?);
        out.set_member("fCountVersion", Value::I32(cursor.read_i32(chunk, &path)?));
        out.set_member("fCountName", Value::String(cursor.string(chunk, &path)?));
        out.set_member("fCountClass", Value::String(cursor.string(chunk, &path)?));
        check_numbytes(ctx, chunk, &start, cursor, classname, num_bytes)?;
        out.num_bytes = num_bytes;
        Ok(out)
    }
}

pub(crate) fn read_tstreamerstl(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TStreamerSTL", Some(version as i32));
    out.bases
        .push(read_streamer_element_base(chunk, cursor, ctx)?);
    out.set_member("fSTLtype", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fCtype", Value::I32(cursor.read_i32(chunk, &path)?));
    check_numbytes(ctx, chunk, &start, cursor, "TStreamerSTL", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn read_tstreamerstlstring(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TStreamerSTLstring", Some(version as i32));
    out.bases.push(read_tstreamerstl(chunk, cursor, ctx)?);
    check_numbytes(ctx, chunk, &start, cursor, "TStreamerSTLstring", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn read_tstreamerinfo(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TStreamerInfo", Some(version as i32));
    out.bases.push(read_class("TNamed", chunk, cursor, ctx)?);
    out.set_member("fCheckSum", Value::U32(cursor.read_u32(chunk, &path)?));
    out.set_member("fClassVersion", Value::I32(cursor.read_i32(chunk, &path)?));
    let elements = read_object_any(chunk, cursor, ctx)?;
    out.set_member("fElements", elements);
    check_numbytes(ctx, chunk, &start, cursor, "TStreamerInfo", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

/// Registers the whole `TStreamer*` family into a bootstrap table.
pub(crate) fn register_bootstrap(
    classes: &mut HashMap<String, crate::model::ClassDef>,
) {
    use crate::model::ClassDef;
    classes.insert(
        "TStreamerInfo".into(),
        ClassDef::Bootstrap(Arc::new(read_tstreamerinfo)),
    );
    classes.insert(
        "TStreamerElement".into(),
        ClassDef::Bootstrap(Arc::new(read_streamer_element_base)),
    );
    classes.insert(
        "TStreamerBase".into(),
        ClassDef::Bootstrap(Arc::new(read_tstreamerbase)),
    );
    classes.insert(
        "TStreamerBasicType".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerBasicType"))),
    );
    classes.insert(
        "TStreamerString".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerString"))),
    );
    classes.insert(
        "TStreamerObject".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerObject"))),
    );
    classes.insert(
        "TStreamerObjectPointer".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerObjectPointer"))),
    );
    classes.insert(
        "TStreamerObjectAny".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerObjectAny"))),
    );
    classes.insert(
        "TStreamerObjectAnyPointer".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerObjectAnyPointer"))),
    );
    classes.insert(
        "TStreamerArtificial".into(),
        ClassDef::Bootstrap(Arc::new(read_plain_element("TStreamerArtificial"))),
    );
    classes.insert(
        "TStreamerBasicPointer".into(),
        ClassDef::Bootstrap(Arc::new(read_counted_element("TStreamerBasicPointer"))),
    );
    classes.insert(
        "TStreamerLoop".into(),
        ClassDef::Bootstrap(Arc::new(read_counted_element("TStreamerLoop"))),
    );
    classes.insert(
        "TStreamerSTL".into(),
        ClassDef::Bootstrap(Arc::new(read_tstreamerstl)),
    );
    classes.insert(
        "TStreamerSTLstring".into(),
        ClassDef::Bootstrap(Arc::new(read_tstreamerstlstring)),
    );
}

// ---------------------------------------------------------------------------
// Serialization of streamers written by this crate.

/// An element description for [`serialize_streamer_info`].
pub struct BuiltElement {
    pub name: String,
    pub title: String,
    pub etype: i32,
    pub size: i32,
    pub type_name: String,
    /// Emits a `TStreamerBase` (with this base version) instead of a
    /// `TStreamerBasicType`.
    pub base_version: Option<i32>,
}

impl BuiltElement {
    pub fn basic(name: &str, etype: i32, size: i32, type_name: &str) -> BuiltElement {
        BuiltElement {
            name: name.into(),
            title: String::new(),
            etype,
            size,
            type_name: type_name.into(),
            base_version: None,
        }
    }

    pub fn base(name: &str, base_version: i32) -> BuiltElement {
        BuiltElement {
            name: name.into(),
            title: String::new(),
            etype: etype::BASE,
            size: 0,
            type_name: "BASE".into(),
            base_version: Some(base_version),
        }
    }

    pub fn object(name: &str, etype: i32, size: i32, type_name: &str) -> BuiltElement {
        BuiltElement {
            name: name.into(),
            title: String::new(),
            etype,
            size,
            type_name: type_name.into(),
            base_version: None,
        }
    }

    fn element_classname(&self) -> &'static str {
        if self.base_version.is_some() {
            return "TStreamerBase";
        }
        match self.etype {
            etype::TSTRING => "TStreamerString",
            etype::OBJECT => "TStreamerObject",
            etype::OBJECTP | etype::OBJECT_P => "TStreamerObjectPointer",
            etype::ANY => "TStreamerObjectAny",
            etype::ANYP | etype::ANY_P => "TStreamerObjectAnyPointer",
            _ => "TStreamerBasicType",
        }
    }

    fn element_class_version(&self) -> u16 {
        if self.base_version.is_some() {
            3
        } else {
            2
        }
    }

    fn serialize(&self) -> Vec<u8> {
        // TStreamerElement v4 body shared by every concrete element class.
        let mut body = serialization::tnamed(&self.name, &self.title, 0);
        body.extend_from_slice(&self.etype.to_be_bytes());
        body.extend_from_slice(&self.size.to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes()); // fArrayLength
        body.extend_from_slice(&0i32.to_be_bytes()); // fArrayDim
        for _ in 0..5 {
            body.extend_from_slice(&0i32.to_be_bytes()); // fMaxIndex
        }
        body.extend_from_slice(&serialization::string(&self.type_name));

        let mut element = serialization::numbytes_version(body.len(), 4).to_vec();
        element.extend_from_slice(&body);
        if let Some(base_version) = self.base_version {
            element.extend_from_slice(&base_version.to_be_bytes());
        }

        let mut out = serialization::numbytes_version(element.len(), self.element_class_version())
            .to_vec();
        out.extend_from_slice(&element);
        out
    }
}

/// Serializes a complete `TStreamerInfo` in the read-any-object encoding
/// used inside the streamer list (without the trailing option byte; the list
/// writer appends it).
pub fn serialize_streamer_info(
    name: &str,
    title: &str,
    class_version: i32,
    checksum: u32,
    elements: &[BuiltElement],
) -> Vec<u8> {
    // TObjArray of elements, each an object-any record with an inline class
    // name.
    let mut array_body = serialization::tobject(0).to_vec();
    array_body.extend_from_slice(&serialization::string("")); // fName
    array_body.extend_from_slice(&(elements.len() as i32).to_be_bytes());
    array_body.extend_from_slice(&0i32.to_be_bytes()); // fLowerBound
    for element in elements {
        let serialized = element.serialize();
        let mut tagged = Vec::new();
        tagged.extend_from_slice(element.element_classname().as_bytes());
        tagged.push(0);
        tagged.extend_from_slice(&serialized);
        array_body.extend_from_slice(&serialization::object_any_header(tagged.len() + 4));
        array_body.extend_from_slice(&tagged);
    }
    let mut array = serialization::numbytes_version(array_body.len(), 3).to_vec();
    array.extend_from_slice(&array_body);

    let mut tagged_array = Vec::new();
    tagged_array.extend_from_slice(b"TObjArray\x00");
    tagged_array.extend_from_slice(&array);

    let mut info_body = serialization::tnamed(name, title, 0);
    info_body.extend_from_slice(&checksum.to_be_bytes());
    info_body.extend_from_slice(&class_version.to_be_bytes());
    info_body.extend_from_slice(&serialization::object_any_header(tagged_array.len() + 4));
    info_body.extend_from_slice(&tagged_array);

    let mut info = serialization::numbytes_version(info_body.len(), 9).to_vec();
    info.extend_from_slice(&info_body);

    let mut out = Vec::new();
    out.extend_from_slice(&serialization::object_any_header(
        info.len() + b"TStreamerInfo\x00".len() + 4,
    ));
    out.extend_from_slice(b"TStreamerInfo\x00");
    out.extend_from_slice(&info);
    out
}
