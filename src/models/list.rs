//! `TList`, `THashList`, and `TObjArray`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::deserialization::{check_numbytes, numbytes_version, read_object_any};
use crate::errors::Result;
use crate::model::{ClassDef, ObjectModel, ReadContext, Value};
use crate::models::object::read_tobject;
use crate::source::Chunk;

/// Reads a `TList`. Each item is a polymorphic reference followed by a
/// length-prefixed "option" string (ignored, but consumed).
///
/// The byte range of every item (including its option) is recorded in a
/// `@byte_ranges` member so that the streamer list can be captured verbatim
/// for write-back.
fn read_tlist_as(
    classname: &'static str,
) -> impl Fn(&Chunk, &mut Cursor, &mut ReadContext<'_>) -> Result<ObjectModel> {
    move |chunk, cursor, ctx| {
        let path = ctx.resolver.file_path().to_path_buf();
        let start = *cursor;
        let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
        let mut out = ObjectModel::new(classname, Some(version as i32));
        out.bases.push(read_tobject(chunk, cursor, ctx)?);
        out.set_member("fName", Value::String(cursor.string(chunk, &path)?));
        let size = cursor.read_i32(chunk, &path)?.max(0);

        let mut items = Vec::with_capacity(size as usize);
        let mut ranges = Vec::with_capacity(2 * size as usize);
        for _ in 0..size {
            ranges.push(cursor.index());
            items.push(read_object_any(chunk, cursor, ctx)?);
            let option_length = cursor.read_u8(chunk, &path)? as u64;
            cursor.skip(option_length);
            ranges.push(cursor.index());
        }
        out.set_member("fSize", Value::I32(size));
        out.set_member("items", Value::List(items));
        out.set_member("@byte_ranges", Value::ArrayU64(ranges));

        check_numbytes(ctx, chunk, &start, cursor, classname, num_bytes)?;
        out.num_bytes = num_bytes;
        Ok(out)
    }
}

pub(crate) fn read_tobjarray(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TObjArray", Some(version as i32));
    out.bases.push(read_tobject(chunk, cursor, ctx)?);
    out.set_member("fName", Value::String(cursor.string(chunk, &path)?));
    let size = cursor.read_i32(chunk, &path)?.max(0);
    let lower_bound = cursor.read_i32(chunk, &path)?;

    let mut items = Vec::with_capacity(size as usize);
    for _ in 0..size {
        items.push(read_object_any(chunk, cursor, ctx)?);
    }
    out.set_member("fSize", Value::I32(size));
    out.set_member("fLowerBound", Value::I32(lower_bound));
    out.set_member("items", Value::List(items));

    check_numbytes(ctx, chunk, &start, cursor, "TObjArray", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn register(classes: &mut HashMap<String, ClassDef>) {
    classes.insert(
        "TList".into(),
        ClassDef::Bootstrap(Arc::new(read_tlist_as("TList"))),
    );
    classes.insert(
        "THashList".into(),
        ClassDef::Bootstrap(Arc::new(read_tlist_as("THashList"))),
    );
    classes.insert(
        "TObjArray".into(),
        ClassDef::Bootstrap(Arc::new(read_tobjarray)),
    );
}
