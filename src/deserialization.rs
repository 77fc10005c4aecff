//! Record framing and the read-any-object protocol.

use std::sync::Arc;

use tracing::trace;

use crate::cursor::Cursor;
use crate::errors::{Error, Result};
use crate::model::{ClassDef, ObjectModel, ReadContext, RefEntry, Value};
use crate::source::Chunk;
use crate::{BYTE_COUNT_MASK, CLASS_MASK, MAP_OFFSET, NEW_CLASS_TAG, STREAMED_MEMBERWISE};

/// Builds a deserialization error with a dump of the cursor neighborhood.
pub(crate) fn error(
    ctx: &ReadContext<'_>,
    chunk: &Chunk,
    cursor: &Cursor,
    reason: impl Into<String>,
) -> Error {
    Error::Deserialization {
        path: ctx.resolver.file_path().to_path_buf(),
        object_path: ctx.object_path.clone(),
        reason: reason.into(),
        dump: cursor.debug_dump(chunk, -16, 64),
    }
}

/// Reads the num-bytes/version framing. If the 4-byte field carries the
/// byte-count mask, returns the total record length (including these 6
/// bytes); otherwise the length is unknown and only the 2-byte version is
/// consumed.
pub(crate) fn numbytes_version(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &ReadContext<'_>,
) -> Result<(Option<u32>, u16)> {
    let path = ctx.resolver.file_path();
    let saved = *cursor;
    let raw = cursor.read_u32(chunk, path)?;
    if raw & BYTE_COUNT_MASK != 0 {
        let version = cursor.read_u16(chunk, path)?;
        Ok((Some((raw & !BYTE_COUNT_MASK) + 4), version))
    } else {
        *cursor = saved;
        let version = cursor.read_u16(chunk, path)?;
        Ok((None, version))
    }
}

/// Verifies that exactly `num_bytes` were consumed since `start`.
pub(crate) fn check_numbytes(
    ctx: &ReadContext<'_>,
    chunk: &Chunk,
    start: &Cursor,
    cursor: &Cursor,
    classname: &str,
    num_bytes: Option<u32>,
) -> Result<()> {
    if let Some(num_bytes) = num_bytes {
        let observed = cursor.displacement(start);
        if observed != num_bytes as i64 {
            return Err(error(
                ctx,
                chunk,
                cursor,
                format!(
                    "expected {num_bytes} bytes but read {observed} in an instance of {classname}"
                ),
            ));
        }
    }
    Ok(())
}

/// Skips one framed record (used for attribute blocks whose content is not
/// interpreted).
pub(crate) fn skip_framed(chunk: &Chunk, cursor: &mut Cursor, ctx: &ReadContext<'_>) -> Result<()> {
    let start = *cursor;
    let (num_bytes, _version) = numbytes_version(chunk, cursor, ctx)?;
    match num_bytes {
        Some(num_bytes) => {
            cursor.move_to(start.index() + num_bytes as u64);
            Ok(())
        }
        None => Err(error(
            ctx,
            chunk,
            cursor,
            "cannot skip a record whose byte count is unknown",
        )),
    }
}

/// Reads an instance of `classname` at the cursor, dispatching to the
/// registered or synthesized reader.
pub(crate) fn read_class(
    classname: &str,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let def = ctx.resolver.class_named(classname);
    ctx.breadcrumbs
        .push((classname.to_string(), def.provenance()));
    match def {
        ClassDef::Bootstrap(reader) | ClassDef::Custom(reader) => reader(chunk, cursor, ctx),
        ClassDef::Versioned(dispatch) => {
            let start = *cursor;
            let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
            if version & STREAMED_MEMBERWISE != 0 {
                return Err(Error::not_implemented(
                    ctx.resolver.file_path(),
                    format!("memberwise serialization of {classname}"),
                ));
            }
            match dispatch.program_for(version as i32, ctx.resolver)? {
                Some(program) => {
                    let mut out = crate::streamers::execute(
                        &program,
                        chunk,
                        cursor,
                        ctx,
                        classname,
                        version as i32,
                    )?;
                    check_numbytes(ctx, chunk, &start, cursor, classname, num_bytes)?;
                    out.num_bytes = num_bytes;
                    Ok(out)
                }
                None => {
                    skip_unknown(classname, version as i32, num_bytes, &start, chunk, cursor, ctx)
                }
            }
        }
        ClassDef::Unknown => {
            let start = *cursor;
            let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
            skip_unknown(classname, version as i32, num_bytes, &start, chunk, cursor, ctx)
        }
    }
}

/// Consumes the declared bytes of an uninterpretable instance, leaving a
/// placeholder that remembers only its class and length.
fn skip_unknown(
    classname: &str,
    version: i32,
    num_bytes: Option<u32>,
    start: &Cursor,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    match num_bytes {
        Some(num_bytes) => {
            trace!(classname, version, num_bytes, "skipping unknown class");
            cursor.move_to(start.index() + num_bytes as u64);
            let mut out = ObjectModel::new(classname, Some(version));
            out.num_bytes = Some(num_bytes);
            Ok(out)
        }
        None => Err(error(
            ctx,
            chunk,
            cursor,
            format!(
                "instance of {classname} (version {version}) has no streamer, no registered \
                 model, and no byte count to skip"
            ),
        )),
    }
}

/// The in-stream polymorphic reference protocol. Returns `Value::None` for a
/// null pointer, a previously read object for a back-reference, or reads a
/// new object (registering it in the record-local reference table).
pub(crate) fn read_object_any(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<Value> {
    let path = ctx.resolver.file_path().to_path_buf();
    let beg = cursor.refpoint();
    let bcnt = cursor.read_u32(chunk, path.as_path())?;

    let (tag, versioned, start) = if bcnt & BYTE_COUNT_MASK == 0 || bcnt == NEW_CLASS_TAG {
        (bcnt, false, 0i64)
    } else {
        let start = cursor.refpoint();
        (cursor.read_u32(chunk, path.as_path())?, true, start)
    };

    if tag & CLASS_MASK == 0 && tag != NEW_CLASS_TAG {
        // Null, or a back-reference to an object already read in this record.
        if tag == 0 {
            return Ok(Value::None);
        }
        match ctx.refs.get(&(tag as u64)) {
            Some(RefEntry::Object(value)) => Ok(value.clone()),
            Some(RefEntry::Class(_)) | None => Err(error(
                ctx,
                chunk,
                cursor,
                format!("invalid object back-reference {tag}"),
            )),
        }
    } else if tag == NEW_CLASS_TAG {
        let classname = cursor.classname(chunk, path.as_path())?;
        if versioned {
            ctx.refs.insert(
                (start as u64) + MAP_OFFSET,
                RefEntry::Class(classname.clone()),
            );
        } else {
            let key = ctx.refs.len() as u64 + 1;
            ctx.refs.insert(key, RefEntry::Class(classname.clone()));
        }
        let value = Value::Object(Arc::new(read_class(&classname, chunk, cursor, ctx)?));
        if versioned {
            ctx.refs
                .insert((beg as u64) + MAP_OFFSET, RefEntry::Object(value.clone()));
        } else {
            let key = ctx.refs.len() as u64 + 1;
            ctx.refs.insert(key, RefEntry::Object(value.clone()));
        }
        Ok(value)
    } else {
        // A back-reference to a class name registered earlier in this record;
        // the object itself is at the cursor.
        let reference = (tag & !CLASS_MASK) as u64;
        let classname = match ctx.refs.get(&reference) {
            Some(RefEntry::Class(classname)) => classname.clone(),
            Some(RefEntry::Object(_)) | None => {
                return Err(error(
                    ctx,
                    chunk,
                    cursor,
                    format!("invalid class back-reference {reference}"),
                ));
            }
        };
        let value = Value::Object(Arc::new(read_class(&classname, chunk, cursor, ctx)?));
        if versioned {
            ctx.refs
                .insert((beg as u64) + MAP_OFFSET, RefEntry::Object(value.clone()));
        } else {
            let key = ctx.refs.len() as u64 + 1;
            ctx.refs.insert(key, RefEntry::Object(value.clone()));
        }
        Ok(value)
    }
}
