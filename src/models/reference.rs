//! `TRef`: a 32-bit reference id with no pointer. Resolution is left to the
//! caller.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::errors::Result;
use crate::model::{ClassDef, ObjectModel, ReadContext, Value};
use crate::source::Chunk;

/// A `TRef` streams as its `TObject` base with the reference id in the
/// unique-id slot: 2 bytes of version, the 4-byte id, 4 bytes of status
/// bits, and a 2-byte process id.
pub(crate) fn read_tref(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    cursor.skip(2);
    let reference = cursor.read_u32(chunk, &path)?;
    cursor.skip(6);
    let mut out = ObjectModel::new("TRef", None);
    out.set_member("ref", Value::Ref(reference));
    Ok(out)
}

pub(crate) fn register(classes: &mut HashMap<String, ClassDef>) {
    classes.insert("TRef".into(), ClassDef::Bootstrap(Arc::new(read_tref)));
}
