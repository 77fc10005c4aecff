//! A file whose embedded schema disagrees with a caller-registered model:
//! the first read fails, the stale model is dropped, and the retry reads
//! through a reader synthesized from the file's own streamers.

use std::sync::Arc;

use taproot::cursor::Cursor;
use taproot::errors::Error;
use taproot::model::{ObjectModel, ReadContext, Value};
use taproot::serialization;
use taproot::source::Chunk;
use taproot::streamers::{etype, serialize_streamer_info, BuiltElement};

fn write_file(path: &std::path::Path) {
    let mut file = taproot::create(path).unwrap();

    let streamer = serialize_streamer_info(
        "MyClass",
        "",
        1,
        0xDEADBEEF,
        &[
            BuiltElement::basic("fX", etype::INT, 4, "Int_t"),
            BuiltElement::basic("fY", etype::INT, 4, "Int_t"),
        ],
    );
    file.add_streamers(&[("MyClass".to_string(), 1, streamer)])
        .unwrap();

    // An instance serialized per the streamer: framed header plus two ints.
    let mut payload = serialization::numbytes_version(8, 1).to_vec();
    payload.extend_from_slice(&7i32.to_be_bytes());
    payload.extend_from_slice(&11i32.to_be_bytes());
    file.add_object_raw("MyClass", "obj", "", &payload).unwrap();

    file.close().unwrap();
}

/// A hand-written model that believes `MyClass` has three ints; the on-disk
/// byte count says otherwise.
fn stale_reader(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> taproot::Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let raw = cursor.read_u32(chunk, &path)?;
    let num_bytes = (raw & 0x3FFF_FFFF) + 4;
    let version = cursor.read_u16(chunk, &path)?;

    let mut out = ObjectModel::new("MyClass", Some(version as i32));
    for member in ["fX", "fY", "fZ"] {
        if cursor.displacement(&start) as u32 + 4 > num_bytes {
            return Err(Error::Deserialization {
                path,
                object_path: ctx.object_path.clone(),
                reason: format!("expected a member {member} but the record is exhausted"),
                dump: cursor.debug_dump(chunk, -16, 32),
            });
        }
        out.set_member(member, Value::I32(cursor.read_i32(chunk, &path)?));
    }
    Ok(out)
}

#[test]
fn stale_models_are_refreshed_from_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("refresh.root");
    write_file(&path);

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    file.register_class("MyClass", Arc::new(stale_reader));

    // One call: fails internally with the stale model, retries from the
    // file's streamers, and succeeds.
    let object = file.get_object("obj").unwrap();
    assert_eq!(object.classname, "MyClass");
    assert_eq!(object.member("fX").unwrap().as_i64(), Some(7));
    assert_eq!(object.member("fY").unwrap().as_i64(), Some(11));
    assert!(object.member("fZ").is_none());
}

#[test]
fn without_registered_models_the_streamers_are_used_directly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("direct.root");
    write_file(&path);

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let streamers = file.streamers().unwrap();
    let info = streamers.streamer_named("MyClass", None).unwrap();
    assert_eq!(info.class_version, 1);
    assert_eq!(info.elements.len(), 2);
    assert_eq!(info.elements[0].name, "fX");
    assert_eq!(info.elements[1].type_name, "Int_t");

    let object = file.get_object("obj").unwrap();
    assert_eq!(object.member("fX").unwrap().as_i64(), Some(7));
}
