//! Read-side models for the 1-D histogram layout this crate writes
//! (`TH1D` v3 over `TH1` v8, axes as `TAxis` v10).

use std::collections::HashMap;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::deserialization::{
    check_numbytes, numbytes_version, read_class, read_object_any, skip_framed,
};
use crate::errors::Result;
use crate::model::{ClassDef, ObjectModel, ReadContext, Value};
use crate::source::Chunk;

fn read_tarrayd(chunk: &Chunk, cursor: &mut Cursor, ctx: &ReadContext<'_>) -> Result<Vec<f64>> {
    let path = ctx.resolver.file_path().to_path_buf();
    let count = cursor.read_i32(chunk, &path)?.max(0) as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(cursor.read_f64(chunk, &path)?);
    }
    Ok(out)
}

pub(crate) fn read_taxis(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TAxis", Some(version as i32));
    out.bases.push(read_class("TNamed", chunk, cursor, ctx)?);
    skip_framed(chunk, cursor, ctx)?; // TAttAxis

    out.set_member("fNbins", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fXmin", Value::F64(cursor.read_f64(chunk, &path)?));
    out.set_member("fXmax", Value::F64(cursor.read_f64(chunk, &path)?));
    out.set_member("fXbins", Value::ArrayF64(read_tarrayd(chunk, cursor, ctx)?));
    out.set_member("fFirst", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fLast", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fBits2", Value::U16(cursor.read_u16(chunk, &path)?));
    out.set_member("fTimeDisplay", Value::Bool(cursor.read_bool(chunk, &path)?));
    out.set_member("fTimeFormat", Value::String(cursor.string(chunk, &path)?));
    out.set_member("fLabels", read_object_any(chunk, cursor, ctx)?);
    out.set_member("fModLabs", read_object_any(chunk, cursor, ctx)?);

    check_numbytes(ctx, chunk, &start, cursor, "TAxis", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

fn read_th1_base(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TH1", Some(version as i32));
    out.bases.push(read_class("TNamed", chunk, cursor, ctx)?);
    skip_framed(chunk, cursor, ctx)?; // TAttLine
    skip_framed(chunk, cursor, ctx)?; // TAttFill
    skip_framed(chunk, cursor, ctx)?; // TAttMarker

    out.set_member("fNcells", Value::I32(cursor.read_i32(chunk, &path)?));
    for axis in ["fXaxis", "fYaxis", "fZaxis"] {
        let model = read_class("TAxis", chunk, cursor, ctx)?;
        out.set_member(axis, Value::Object(Arc::new(model)));
    }
    out.set_member("fBarOffset", Value::I16(cursor.read_i16(chunk, &path)?));
    out.set_member("fBarWidth", Value::I16(cursor.read_i16(chunk, &path)?));
    for member in [
        "fEntries",
        "fTsumw",
        "fTsumw2",
        "fTsumwx",
        "fTsumwx2",
        "fMaximum",
        "fMinimum",
        "fNormFactor",
    ] {
        out.set_member(member, Value::F64(cursor.read_f64(chunk, &path)?));
    }
    out.set_member("fContour", Value::ArrayF64(read_tarrayd(chunk, cursor, ctx)?));
    out.set_member("fSumw2", Value::ArrayF64(read_tarrayd(chunk, cursor, ctx)?));
    out.set_member("fOption", Value::String(cursor.string(chunk, &path)?));
    let functions = read_class("TList", chunk, cursor, ctx)?;
    out.set_member("fFunctions", Value::Object(Arc::new(functions)));
    out.set_member("fBufferSize", Value::I32(cursor.read_i32(chunk, &path)?));
    cursor.skip(1); // speedbump before the (empty) fBuffer
    out.set_member("fBinStatErrOpt", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fStatOverflows", Value::I32(cursor.read_i32(chunk, &path)?));

    check_numbytes(ctx, chunk, &start, cursor, "TH1", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn read_th1d(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    let mut out = ObjectModel::new("TH1D", Some(version as i32));
    out.bases.push(read_th1_base(chunk, cursor, ctx)?);
    out.set_member("fArray", Value::ArrayF64(read_tarrayd(chunk, cursor, ctx)?));
    check_numbytes(ctx, chunk, &start, cursor, "TH1D", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn register(classes: &mut HashMap<String, ClassDef>) {
    classes.insert("TAxis".into(), ClassDef::Bootstrap(Arc::new(read_taxis)));
    classes.insert("TH1D".into(), ClassDef::Bootstrap(Arc::new(read_th1d)));
}
