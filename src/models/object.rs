//! `TObject`, `TNamed`, `TString`, and `TObjString`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::deserialization::{check_numbytes, numbytes_version};
use crate::errors::Result;
use crate::model::{ClassDef, ObjectModel, ReadContext, Value};
use crate::source::Chunk;
use crate::ObjectBits;

/// `TObject` streams in the short form: a 2-byte version with no byte count,
/// then the unique id and status bits. Referenced objects carry a 2-byte
/// process id after the bits.
pub(crate) fn read_tobject(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let version = cursor.read_u16(chunk, &path)?;
    let unique_id = cursor.read_u32(chunk, &path)?;
    let bits = cursor.read_u32(chunk, &path)?;
    if bits & ObjectBits::IS_REFERENCED.bits() != 0 {
        cursor.skip(2);
    }
    let mut out = ObjectModel::new("TObject", Some(version as i32));
    out.set_member("fUniqueID", Value::U32(unique_id));
    out.set_member("fBits", Value::U32(bits));
    Ok(out)
}

pub(crate) fn read_tnamed(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TNamed", Some(version as i32));
    out.bases.push(read_tobject(chunk, cursor, ctx)?);
    out.set_member("fName", Value::String(cursor.string(chunk, &path)?));
    out.set_member("fTitle", Value::String(cursor.string(chunk, &path)?));
    check_numbytes(ctx, chunk, &start, cursor, "TNamed", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

/// A bare `TString` member object: just the length-prefixed bytes.
pub(crate) fn read_tstring(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let mut out = ObjectModel::new("TString", None);
    out.set_member("fString", Value::String(cursor.string(chunk, &path)?));
    Ok(out)
}

pub(crate) fn read_tobjstring(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TObjString", Some(version as i32));
    out.bases.push(read_tobject(chunk, cursor, ctx)?);
    out.set_member("fString", Value::String(cursor.string(chunk, &path)?));
    check_numbytes(ctx, chunk, &start, cursor, "TObjString", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn register(classes: &mut HashMap<String, ClassDef>) {
    classes.insert("TObject".into(), ClassDef::Bootstrap(Arc::new(read_tobject)));
    classes.insert("TNamed".into(), ClassDef::Bootstrap(Arc::new(read_tnamed)));
    classes.insert("TString".into(), ClassDef::Bootstrap(Arc::new(read_tstring)));
    classes.insert(
        "TObjString".into(),
        ClassDef::Bootstrap(Arc::new(read_tobjstring)),
    );
}