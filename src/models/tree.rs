//! Read-side models for the `TTree` family (the class versions this crate
//! writes: `TTree` v20, `TBranch` v13, `TLeaf` v2 with v1 specializations)
//! and the basket reader that turns a branch back into column data.

use std::collections::HashMap;
use std::sync::Arc;

use binrw::binrw;
use tracing::trace;

use crate::cursor::Cursor;
use crate::deserialization::{
    check_numbytes, error, numbytes_version, read_class, read_object_any, skip_framed,
};
use crate::errors::{Error, Result};
use crate::model::{ClassDef, ClassResolver, ObjectModel, ReadContext, Value};
use crate::reading::{KeyRecord, ReadOnlyFile};
use crate::source::Chunk;

/// The `TBasket` struct embedded in a basket's key region, after the three
/// strings.
#[binrw]
#[brw(big)]
pub(crate) struct BasketRecord {
    pub version: u16,
    pub buffer_size: i32,
    pub nev_buf_size: i32,
    pub nev_buf: i32,
    pub last: i32,
}

pub(crate) fn read_ttree(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    if version != 20 {
        // Only the version this crate writes is modeled; other versions are
        // skippable but opaque.
        return match num_bytes {
            Some(num_bytes) => {
                cursor.move_to(start.index() + num_bytes as u64);
                let mut out = ObjectModel::new("TTree", Some(version as i32));
                out.num_bytes = Some(num_bytes);
                Ok(out)
            }
            None => Err(error(
                ctx,
                chunk,
                cursor,
                format!("no model for TTree version {version} and no byte count to skip"),
            )),
        };
    }

    let mut out = ObjectModel::new("TTree", Some(version as i32));
    out.bases.push(read_class("TNamed", chunk, cursor, ctx)?);
    skip_framed(chunk, cursor, ctx)?; // TAttLine
    skip_framed(chunk, cursor, ctx)?; // TAttFill
    skip_framed(chunk, cursor, ctx)?; // TAttMarker

    out.set_member("fEntries", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fTotBytes", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fZipBytes", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fSavedBytes", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fFlushedBytes", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fWeight", Value::F64(cursor.read_f64(chunk, &path)?));
    out.set_member("fTimerInterval", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fScanField", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fUpdate", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member(
        "fDefaultEntryOffsetLen",
        Value::I32(cursor.read_i32(chunk, &path)?),
    );
    let ncluster_range = cursor.read_u32(chunk, &path)?;
    out.set_member("fNClusterRange", Value::U32(ncluster_range));
    out.set_member("fMaxEntries", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fMaxEntryLoop", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fMaxVirtualSize", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fAutoSave", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fAutoFlush", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fEstimate", Value::I64(cursor.read_i64(chunk, &path)?));

    // Speedbumped fClusterRangeEnd and fClusterSize arrays.
    cursor.skip(1);
    cursor.skip(8 * ncluster_range as u64);
    cursor.skip(1);
    cursor.skip(8 * ncluster_range as u64);
    skip_framed(chunk, cursor, ctx)?; // fIOFeatures

    let branches = read_class("TObjArray", chunk, cursor, ctx)?;
    out.set_member("fBranches", Value::Object(Arc::new(branches)));
    let leaves = read_class("TObjArray", chunk, cursor, ctx)?;
    out.set_member("fLeaves", Value::Object(Arc::new(leaves)));

    out.set_member("fAliases", read_object_any(chunk, cursor, ctx)?);
    let n_index_values = cursor.read_i32(chunk, &path)?.max(0);
    cursor.skip(8 * n_index_values as u64);
    let n_index = cursor.read_i32(chunk, &path)?.max(0);
    cursor.skip(4 * n_index as u64);
    out.set_member("fTreeIndex", read_object_any(chunk, cursor, ctx)?);
    out.set_member("fFriends", read_object_any(chunk, cursor, ctx)?);
    out.set_member("fUserInfo", read_object_any(chunk, cursor, ctx)?);
    out.set_member("fBranchRef", read_object_any(chunk, cursor, ctx)?);

    check_numbytes(ctx, chunk, &start, cursor, "TTree", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

pub(crate) fn read_tbranch(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext<'_>,
) -> Result<ObjectModel> {
    let path = ctx.resolver.file_path().to_path_buf();
    let start = *cursor;
    let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
    if version != 13 {
        return match num_bytes {
            Some(num_bytes) => {
                cursor.move_to(start.index() + num_bytes as u64);
                let mut out = ObjectModel::new("TBranch", Some(version as i32));
                out.num_bytes = Some(num_bytes);
                Ok(out)
            }
            None => Err(error(
                ctx,
                chunk,
                cursor,
                format!("no model for TBranch version {version} and no byte count to skip"),
            )),
        };
    }

    let mut out = ObjectModel::new("TBranch", Some(version as i32));
    out.bases.push(read_class("TNamed", chunk, cursor, ctx)?);
    skip_framed(chunk, cursor, ctx)?; // TAttFill

    out.set_member("fCompress", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fBasketSize", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fEntryOffsetLen", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fWriteBasket", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fEntryNumber", Value::I64(cursor.read_i64(chunk, &path)?));
    skip_framed(chunk, cursor, ctx)?; // fIOFeatures

    out.set_member("fOffset", Value::I32(cursor.read_i32(chunk, &path)?));
    let max_baskets = cursor.read_u32(chunk, &path)?;
    out.set_member("fMaxBaskets", Value::U32(max_baskets));
    out.set_member("fSplitLevel", Value::I32(cursor.read_i32(chunk, &path)?));
    out.set_member("fEntries", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fFirstEntry", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fTotBytes", Value::I64(cursor.read_i64(chunk, &path)?));
    out.set_member("fZipBytes", Value::I64(cursor.read_i64(chunk, &path)?));

    let sub_branches = read_class("TObjArray", chunk, cursor, ctx)?;
    out.set_member("fBranches", Value::Object(Arc::new(sub_branches)));
    let leaves = read_class("TObjArray", chunk, cursor, ctx)?;
    out.set_member("fLeaves", Value::Object(Arc::new(leaves)));
    let baskets = read_class("TObjArray", chunk, cursor, ctx)?;
    out.set_member("fBaskets", Value::Object(Arc::new(baskets)));

    cursor.skip(1);
    let mut basket_bytes = Vec::with_capacity(max_baskets as usize);
    for _ in 0..max_baskets {
        basket_bytes.push(cursor.read_i32(chunk, &path)?);
    }
    out.set_member("fBasketBytes", Value::ArrayI32(basket_bytes));

    cursor.skip(1);
    let mut basket_entry = Vec::with_capacity(max_baskets as usize);
    for _ in 0..max_baskets {
        basket_entry.push(cursor.read_i64(chunk, &path)?);
    }
    out.set_member("fBasketEntry", Value::ArrayI64(basket_entry));

    cursor.skip(1);
    let mut basket_seek = Vec::with_capacity(max_baskets as usize);
    for _ in 0..max_baskets {
        basket_seek.push(cursor.read_i64(chunk, &path)?);
    }
    out.set_member("fBasketSeek", Value::ArrayI64(basket_seek));

    out.set_member("fFileName", Value::String(cursor.string(chunk, &path)?));

    check_numbytes(ctx, chunk, &start, cursor, "TBranch", num_bytes)?;
    out.num_bytes = num_bytes;
    Ok(out)
}

/// The primitive type a leaf stores, encoded in the leaf's class name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafType {
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
}

impl LeafType {
    pub fn item_size(&self) -> usize {
        match self {
            LeafType::Bool | LeafType::I8 | LeafType::U8 => 1,
            LeafType::I16 | LeafType::U16 => 2,
            LeafType::I32 | LeafType::U32 | LeafType::F32 => 4,
            LeafType::I64 | LeafType::U64 | LeafType::F64 => 8,
        }
    }

    fn from_leaf(classname: &str, is_unsigned: bool) -> Option<LeafType> {
        Some(match (classname, is_unsigned) {
            ("TLeafO", _) => LeafType::Bool,
            ("TLeafB", false) => LeafType::I8,
            ("TLeafB", true) => LeafType::U8,
            ("TLeafS", false) => LeafType::I16,
            ("TLeafS", true) => LeafType::U16,
            ("TLeafI", false) => LeafType::I32,
            ("TLeafI", true) => LeafType::U32,
            ("TLeafL", false) => LeafType::I64,
            ("TLeafL", true) => LeafType::U64,
            ("TLeafF", _) => LeafType::F32,
            ("TLeafD", _) => LeafType::F64,
            _ => return None,
        })
    }

    fn decode(&self, bytes: &[u8]) -> Value {
        macro_rules! decode {
            ($variant:ident, $ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                Value::$variant(
                    bytes
                        .chunks_exact(N)
                        .map(|raw| <$ty>::from_be_bytes(raw.try_into().unwrap()))
                        .collect(),
                )
            }};
        }
        match self {
            LeafType::Bool | LeafType::U8 => Value::ArrayU8(bytes.to_vec()),
            LeafType::I8 => decode!(ArrayI8, i8),
            LeafType::I16 => decode!(ArrayI16, i16),
            LeafType::U16 => decode!(ArrayU16, u16),
            LeafType::I32 => decode!(ArrayI32, i32),
            LeafType::U32 => decode!(ArrayU32, u32),
            LeafType::I64 => decode!(ArrayI64, i64),
            LeafType::U64 => decode!(ArrayU64, u64),
            LeafType::F32 => decode!(ArrayF32, f32),
            LeafType::F64 => decode!(ArrayF64, f64),
        }
    }
}

fn read_tleaf_specialized(
    classname: &'static str,
    min_max: LeafType,
) -> impl Fn(&Chunk, &mut Cursor, &mut ReadContext<'_>) -> Result<ObjectModel> {
    move |chunk, cursor, ctx| {
        let path = ctx.resolver.file_path().to_path_buf();
        let start = *cursor;
        let (num_bytes, version) = numbytes_version(chunk, cursor, ctx)?;
        let mut out = ObjectModel::new(classname, Some(version as i32));

        // TLeaf v2 base.
        let base_start = *cursor;
        let (base_num_bytes, base_version) = numbytes_version(chunk, cursor, ctx)?;
        let mut base = ObjectModel::new("TLeaf", Some(base_version as i32));
        base.bases.push(read_class("TNamed", chunk, cursor, ctx)?);
        base.set_member("fLen", Value::I32(cursor.read_i32(chunk, &path)?));
        base.set_member("fLenType", Value::I32(cursor.read_i32(chunk, &path)?));
        base.set_member("fOffset", Value::I32(cursor.read_i32(chunk, &path)?));
        base.set_member("fIsRange", Value::Bool(cursor.read_bool(chunk, &path)?));
        base.set_member("fIsUnsigned", Value::Bool(cursor.read_bool(chunk, &path)?));
        base.set_member("fLeafCount", read_object_any(chunk, cursor, ctx)?);
        check_numbytes(ctx, chunk, &base_start, cursor, "TLeaf", base_num_bytes)?;
        base.num_bytes = base_num_bytes;
        out.bases.push(base);

        let read_extreme = |cursor: &mut Cursor| -> Result<Value> {
            Ok(match min_max {
                LeafType::Bool => Value::Bool(cursor.read_bool(chunk, &path)?),
                LeafType::I8 => Value::I8(cursor.read_i8(chunk, &path)?),
                LeafType::U8 => Value::U8(cursor.read_u8(chunk, &path)?),
                LeafType::I16 | LeafType::U16 => Value::I16(cursor.read_i16(chunk, &path)?),
                LeafType::I32 | LeafType::U32 => Value::I32(cursor.read_i32(chunk, &path)?),
                LeafType::I64 | LeafType::U64 => Value::I64(cursor.read_i64(chunk, &path)?),
                LeafType::F32 => Value::F32(cursor.read_f32(chunk, &path)?),
                LeafType::F64 => Value::F64(cursor.read_f64(chunk, &path)?),
            })
        };
        let minimum = read_extreme(cursor)?;
        let maximum = read_extreme(cursor)?;
        out.set_member("fMinimum", minimum);
        out.set_member("fMaximum", maximum);

        check_numbytes(ctx, chunk, &start, cursor, classname, num_bytes)?;
        out.num_bytes = num_bytes;
        Ok(out)
    }
}

pub(crate) fn register(classes: &mut HashMap<String, ClassDef>) {
    classes.insert("TTree".into(), ClassDef::Bootstrap(Arc::new(read_ttree)));
    classes.insert("TBranch".into(), ClassDef::Bootstrap(Arc::new(read_tbranch)));
    for (classname, min_max) in [
        ("TLeafO", LeafType::Bool),
        ("TLeafB", LeafType::I8),
        ("TLeafS", LeafType::I16),
        ("TLeafI", LeafType::I32),
        ("TLeafL", LeafType::I64),
        ("TLeafF", LeafType::F32),
        ("TLeafD", LeafType::F64),
    ] {
        classes.insert(
            classname.into(),
            ClassDef::Bootstrap(Arc::new(read_tleaf_specialized(classname, min_max))),
        );
    }
}

/// Column data recovered from a branch: the flat values and, for
/// variable-length branches, per-entry offsets in item units (one more
/// offset than entries).
pub struct BranchColumn {
    pub leaf_type: LeafType,
    pub values: Value,
    pub entry_offsets: Option<Vec<i64>>,
}

fn branch_model<'t>(tree: &'t ObjectModel, name: &str) -> Option<&'t ObjectModel> {
    let branches = tree.member("fBranches")?.as_object()?;
    for item in branches.member("items")?.as_list()? {
        let branch = item.as_object()?;
        if branch.member("fName").and_then(Value::as_str) == Some(name) {
            return Some(branch);
        }
    }
    None
}

/// Reads every basket of `branch_name` and concatenates the column,
/// consulting the file's array cache.
pub fn read_branch(
    file: &ReadOnlyFile,
    tree: &ObjectModel,
    branch_name: &str,
) -> Result<Arc<BranchColumn>> {
    let path = file.file_path().to_path_buf();
    let tree_name = tree
        .member("fName")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let branch = branch_model(tree, branch_name).ok_or_else(|| {
        Error::format(&path, format!("tree has no branch named {branch_name:?}"))
    })?;
    let num_entries = tree.member("fEntries").and_then(Value::as_i64).unwrap_or(0);
    let cache_key = format!("{tree_name}/{branch_name}:0-{num_entries}:raw");
    if let Some(hit) = file.cached_array(&cache_key) {
        return Ok(hit);
    }

    let leaf = branch
        .member("fLeaves")
        .and_then(Value::as_object)
        .and_then(|leaves| leaves.member("items"))
        .and_then(Value::as_list)
        .and_then(|items| items.first())
        .and_then(Value::as_object)
        .ok_or_else(|| Error::format(&path, format!("branch {branch_name:?} has no leaf")))?;
    let is_unsigned = leaf
        .member("fIsUnsigned")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        != 0;
    let leaf_type = LeafType::from_leaf(&leaf.classname, is_unsigned).ok_or_else(|| {
        Error::not_implemented(&path, format!("reading leaves of class {}", leaf.classname))
    })?;
    let jagged = branch
        .member("fEntryOffsetLen")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        > 0;

    let num_baskets = branch
        .member("fWriteBasket")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0) as usize;
    let seeks = match branch.member("fBasketSeek") {
        Some(Value::ArrayI64(seeks)) => seeks.clone(),
        _ => Vec::new(),
    };

    let mut raw_values = Vec::new();
    let mut entry_offsets: Vec<i64> = if jagged { vec![0] } else { Vec::new() };
    let item_size = leaf_type.item_size() as i64;

    for &seek in seeks.iter().take(num_baskets) {
        let (values, offsets) = read_basket(file, seek as u64, jagged)?;
        if let Some(offsets) = offsets {
            let base = *entry_offsets.last().unwrap();
            for &byte_offset in &offsets[1..] {
                entry_offsets.push(base + byte_offset / item_size);
            }
        }
        raw_values.extend_from_slice(&values);
    }

    trace!(
        branch = branch_name,
        baskets = num_baskets,
        bytes = raw_values.len(),
        "read branch"
    );
    let column = Arc::new(BranchColumn {
        leaf_type,
        values: leaf_type.decode(&raw_values),
        entry_offsets: if jagged { Some(entry_offsets) } else { None },
    });
    file.cache_array(cache_key, Arc::clone(&column));
    Ok(column)
}

/// Reads one basket record: returns the raw big-endian value bytes and, for
/// jagged baskets, the per-entry byte offsets rebased to the start of the
/// basket's value region (entry count + 1 offsets).
fn read_basket(file: &ReadOnlyFile, seek: u64, jagged: bool) -> Result<(Vec<u8>, Option<Vec<i64>>)> {
    let path = file.file_path().to_path_buf();
    let header_chunk = file.chunk(seek, seek + 512)?;
    let mut cursor = Cursor::new(seek);
    let key = KeyRecord::read(&header_chunk, &mut cursor, &path, true)?;

    // The basket's own struct is part of the key region, after the strings.
    let basket: BasketRecord = crate::reading::read_record(&header_chunk, &mut cursor, &path)?;
    let num_entries = basket.nev_buf;
    let last = basket.last;

    let key_len = key.key_len as i64;
    let data_start = seek + key.key_len as u64;
    let data_stop = seek + key.total_bytes as u64;
    let compressed = key.total_bytes as u64 - key.key_len as u64;

    let data_chunk = file.chunk(data_start, data_stop)?;
    let uncompressed = if compressed == key.object_len as u64 {
        data_chunk.get(data_start, data_stop, &path)?.to_vec()
    } else {
        let mut data_cursor = Cursor::new(data_start);
        crate::compression::decompress(
            &data_chunk,
            &mut data_cursor,
            compressed,
            key.object_len as u64,
            &path,
        )?
    };

    let values_len = (last as i64 - key_len).max(0) as usize;
    if !jagged {
        return Ok((uncompressed, None));
    }

    if values_len + 4 > uncompressed.len() {
        return Err(Error::format(
            &path,
            format!("basket at seek {seek} is too short for its offset array"),
        ));
    }
    let mut tail = Cursor::new(values_len as u64);
    let tail_chunk = Chunk::wrap(uncompressed.clone());
    let num_offsets = tail.read_u32(&tail_chunk, &path)? as usize;
    let mut offsets = Vec::with_capacity(num_offsets);
    for _ in 0..num_offsets {
        offsets.push(tail.read_i32(&tail_chunk, &path)? as i64);
    }
    if offsets.len() != num_entries as usize + 1 {
        return Err(Error::format(
            &path,
            format!(
                "basket at seek {seek} declares {num_entries} entries but has {} offsets",
                offsets.len().saturating_sub(1)
            ),
        ));
    }

    // Offsets were written key-relative with the final entry zeroed; the true
    // final offset is the basket's fLast.
    let mut rebased = Vec::with_capacity(offsets.len());
    for &offset in &offsets[..offsets.len() - 1] {
        rebased.push(offset - key_len);
    }
    rebased.push(last as i64 - key_len);

    Ok((uncompressed[..values_len].to_vec(), Some(rebased)))
}
