//! The writable `TTree`: branches, baskets, and in-place growth.
//!
//! Trees are more like directories than like histograms: they allocate new
//! records (baskets) through the free-space map as they grow. The whole
//! metadata block is written by one function so the interrelated byte
//! offsets stay in one place; `extend` appends one basket per branch and
//! rewrites only the regions that changed.
//!
//! Class versions written: `TTree` v20, `TBranch` v13, `TLeaf` v2 with v1
//! specializations, `TBasket` v3.

use std::collections::HashMap;
use std::io::Cursor as IoCursor;

use binrw::BinWriterExt;
use tracing::debug;

use crate::compression::Compression;
use crate::errors::{Error, Result};
use crate::models::tree::BasketRecord;
use crate::reading::KeyRecordBig;
use crate::serialization;
use crate::writing::cascade::{Directory, FreeSegments, KeyLeaf, Shared, KEY_BIG_BYTES};
use crate::writing::sink::FileSink;
use crate::{BYTE_COUNT_MASK, NEW_CLASS_TAG};

const TBASKET_STRUCT_BYTES: u64 = 18;
const TBRANCH_FORMAT1_BYTES: u64 = 24;
const IOFEATURES_BYTES: u64 = 11;
const EMPTY_TOBJARRAY_BYTES: u64 = 25;

/// TAttLine v2, TAttFill v2, TAttMarker v2 with default values.
const ATTRIBUTE_BLOCKS: &[u8] = &[
    0x40, 0x00, 0x00, 0x08, 0x00, 0x02, 0x02, 0x5a, 0x00, 0x01, 0x00, 0x01, // line
    0x40, 0x00, 0x00, 0x06, 0x00, 0x02, 0x00, 0x00, 0x03, 0xe9, // fill
    0x40, 0x00, 0x00, 0x0a, 0x00, 0x02, 0x00, 0x01, 0x00, 0x01, 0x3f, 0x80, 0x00, 0x00, // marker
];

/// TAttFill v2 alone (for branches).
const FILL_BLOCK: &[u8] = &[0x40, 0x00, 0x00, 0x06, 0x00, 0x02, 0x00, 0x00, 0x03, 0xe9];

/// An empty TIOFeatures record.
const IOFEATURES_BLOCK: &[u8] = &[
    0x40, 0x00, 0x00, 0x07, 0x00, 0x00, 0x1a, 0xa1, 0x2f, 0x10, 0x00,
];

/// An empty, framed TObjArray.
const EMPTY_TOBJARRAY: &[u8] = &[
    0x40, 0x00, 0x00, 0x15, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The primitive types a branch can store, with their ROOT type letters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
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

impl Dtype {
    pub fn item_size(&self) -> usize {
        match self {
            Dtype::Bool | Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }

    /// The letter after the slash in a branch title, lowercase for unsigned.
    pub fn type_letter(&self) -> char {
        match self {
            Dtype::Bool => 'O',
            Dtype::I8 => 'B',
            Dtype::U8 => 'b',
            Dtype::I16 => 'S',
            Dtype::U16 => 's',
            Dtype::I32 => 'I',
            Dtype::U32 => 'i',
            Dtype::I64 => 'L',
            Dtype::U64 => 'l',
            Dtype::F32 => 'F',
            Dtype::F64 => 'D',
        }
    }

    fn leaf_classname(&self) -> &'static str {
        match self.type_letter().to_ascii_uppercase() {
            'O' => "TLeafO",
            'B' => "TLeafB",
            'S' => "TLeafS",
            'I' => "TLeafI",
            'L' => "TLeafL",
            'F' => "TLeafF",
            'D' => "TLeafD",
            _ => unreachable!(),
        }
    }

    fn is_unsigned(&self) -> bool {
        self.type_letter().is_ascii_lowercase()
    }

    /// Byte size of the specialized `fMinimum`/`fMaximum` pair.
    fn special_struct_bytes(&self) -> u64 {
        match self.type_letter().to_ascii_uppercase() {
            'O' | 'B' => 2,
            'S' => 4,
            'I' | 'F' => 8,
            'L' | 'D' => 16,
            _ => unreachable!(),
        }
    }

    fn write_special(&self, w: &mut IoCursor<Vec<u8>>, minimum: i64, maximum: i64) {
        match self.type_letter().to_ascii_uppercase() {
            'O' | 'B' => {
                w.write_be(&(minimum as i8)).unwrap();
                w.write_be(&(maximum as i8)).unwrap();
            }
            'S' => {
                w.write_be(&(minimum as i16)).unwrap();
                w.write_be(&(maximum as i16)).unwrap();
            }
            'I' => {
                w.write_be(&(minimum as i32)).unwrap();
                w.write_be(&(maximum as i32)).unwrap();
            }
            'L' => {
                w.write_be(&minimum).unwrap();
                w.write_be(&maximum).unwrap();
            }
            'F' => {
                w.write_be(&(minimum as f32)).unwrap();
                w.write_be(&(maximum as f32)).unwrap();
            }
            'D' => {
                w.write_be(&(minimum as f64)).unwrap();
                w.write_be(&(maximum as f64)).unwrap();
            }
            _ => unreachable!(),
        }
    }
}

/// The layout of one branch, requested at tree creation.
#[derive(Clone, Debug)]
pub enum BranchType {
    /// A rectangular branch; `shape` gives trailing fixed dimensions.
    Primitive { dtype: Dtype, shape: Vec<usize> },
    /// A variable-length branch counted by a synthesized sibling branch.
    Jagged { dtype: Dtype },
}

/// One column of data handed to [`Tree::extend`]. Values are stored flat;
/// jagged columns add an offsets array (`offsets[0] == 0`, one more offset
/// than entries).
#[derive(Clone, Debug)]
pub enum Column {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Jagged {
        offsets: Vec<i32>,
        values: Box<Column>,
    },
}

impl Column {
    pub fn dtype(&self) -> Dtype {
        match self {
            Column::Bool(_) => Dtype::Bool,
            Column::I8(_) => Dtype::I8,
            Column::U8(_) => Dtype::U8,
            Column::I16(_) => Dtype::I16,
            Column::U16(_) => Dtype::U16,
            Column::I32(_) => Dtype::I32,
            Column::U32(_) => Dtype::U32,
            Column::I64(_) => Dtype::I64,
            Column::U64(_) => Dtype::U64,
            Column::F32(_) => Dtype::F32,
            Column::F64(_) => Dtype::F64,
            Column::Jagged { values, .. } => values.dtype(),
        }
    }

    fn num_items(&self) -> usize {
        match self {
            Column::Bool(v) => v.len(),
            Column::I8(v) => v.len(),
            Column::U8(v) => v.len(),
            Column::I16(v) => v.len(),
            Column::U16(v) => v.len(),
            Column::I32(v) => v.len(),
            Column::U32(v) => v.len(),
            Column::I64(v) => v.len(),
            Column::U64(v) => v.len(),
            Column::F32(v) => v.len(),
            Column::F64(v) => v.len(),
            Column::Jagged { values, .. } => values.num_items(),
        }
    }

    fn to_big_endian(&self) -> Vec<u8> {
        macro_rules! encode {
            ($values:expr) => {
                $values.iter().flat_map(|v| v.to_be_bytes()).collect()
            };
        }
        match self {
            Column::Bool(v) => v.iter().map(|&b| b as u8).collect(),
            Column::I8(v) => encode!(v),
            Column::U8(v) => v.clone(),
            Column::I16(v) => encode!(v),
            Column::U16(v) => encode!(v),
            Column::I32(v) => encode!(v),
            Column::U32(v) => encode!(v),
            Column::I64(v) => encode!(v),
            Column::U64(v) => encode!(v),
            Column::F32(v) => encode!(v),
            Column::F64(v) => encode!(v),
            Column::Jagged { values, .. } => values.to_big_endian(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BranchKind {
    Normal,
    Counter,
}

struct BranchDatum {
    name: String,
    title: String,
    kind: BranchKind,
    /// Index of this branch's counter branch, for jagged branches.
    counter: Option<usize>,
    dtype: Dtype,
    shape: Vec<usize>,
    compression: Option<Compression>,
    basket_size: i32,
    entry_offset_len: i32,
    offset: i32,
    split_level: i32,
    first_entry: i64,
    tot_bytes: i64,
    zip_bytes: i64,
    basket_bytes: Vec<i32>,
    basket_entry: Vec<i64>,
    basket_seek: Vec<i64>,
    arrays_write_start: usize,
    arrays_write_stop: usize,
    metadata_start: Option<u64>,
    basket_metadata_start: Option<u64>,
    tleaf_reference_number: Option<u32>,
    tleaf_maximum_value: i64,
}

impl BranchDatum {
    fn new(
        name: &str,
        kind: BranchKind,
        counter: Option<usize>,
        dtype: Dtype,
        shape: Vec<usize>,
        compression: Option<Compression>,
        capacity: usize,
    ) -> BranchDatum {
        let dims: String = shape.iter().map(|d| format!("[{d}]")).collect();
        let title = format!("{name}{dims}/{}", dtype.type_letter());
        BranchDatum {
            name: name.to_string(),
            title,
            kind,
            counter,
            dtype,
            shape,
            compression,
            basket_size: 32000,
            entry_offset_len: if counter.is_some() { 1000 } else { 0 },
            offset: 0,
            split_level: 0,
            first_entry: 0,
            tot_bytes: 0,
            zip_bytes: 0,
            basket_bytes: vec![0; capacity],
            basket_entry: vec![0; capacity],
            basket_seek: vec![0; capacity],
            arrays_write_start: 0,
            arrays_write_stop: 0,
            metadata_start: None,
            basket_metadata_start: None,
            tleaf_reference_number: None,
            tleaf_maximum_value: 0,
        }
    }

    fn items_per_entry(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }
}

struct TreeMetadata {
    tot_bytes: i64,
    zip_bytes: i64,
    saved_bytes: i64,
    flushed_bytes: i64,
    weight: f64,
    timer_interval: i32,
    scan_field: i32,
    update: i32,
    default_entry_offset_len: i32,
    ncluster_range: u32,
    max_entries: i64,
    max_entry_loop: i64,
    max_virtual_size: i64,
    auto_save: i64,
    auto_flush: i64,
    estimate: i64,
}

impl Default for TreeMetadata {
    fn default() -> Self {
        TreeMetadata {
            tot_bytes: 0,
            zip_bytes: 0,
            saved_bytes: 0,
            flushed_bytes: 0,
            weight: 1.0,
            timer_interval: 0,
            scan_field: 25,
            update: 0,
            default_entry_offset_len: 1000,
            ncluster_range: 0,
            max_entries: 1_000_000_000_000,
            max_entry_loop: 1_000_000_000_000,
            max_virtual_size: 0,
            auto_save: -300_000_000,
            auto_flush: -30_000_000,
            estimate: 1_000_000,
        }
    }
}

/// A writable `TTree` bound to its directory and the file's free-space map.
pub struct Tree {
    directory: Shared<Directory>,
    freesegments: Shared<FreeSegments>,
    name: String,
    title: String,
    basket_capacity: usize,
    resize_factor: f64,
    branch_data: Vec<BranchDatum>,
    branch_lookup: HashMap<String, usize>,
    num_entries: i64,
    num_baskets: usize,
    metadata: TreeMetadata,
    metadata_start: Option<u64>,
    key: Option<KeyLeaf>,
}

/// The default name for a jagged branch's synthesized counter.
pub fn counter_name(branch_name: &str) -> String {
    format!("n{branch_name}")
}

impl Tree {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Shared<Directory>,
        freesegments: Shared<FreeSegments>,
        name: &str,
        title: &str,
        branch_types: &[(String, BranchType)],
        compression: Option<Compression>,
        initial_basket_capacity: usize,
        resize_factor: f64,
    ) -> Result<Tree> {
        if branch_types.is_empty() {
            return Err(Error::format(
                std::path::Path::new(""),
                "a TTree must have at least one branch",
            ));
        }
        let capacity = initial_basket_capacity.max(2);

        let mut branch_data: Vec<BranchDatum> = Vec::new();
        let mut branch_lookup = HashMap::new();
        for (branch_name, branch_type) in branch_types {
            match branch_type {
                BranchType::Primitive { dtype, shape } => {
                    if branch_lookup.contains_key(branch_name.as_str()) {
                        continue;
                    }
                    branch_lookup.insert(branch_name.clone(), branch_data.len());
                    branch_data.push(BranchDatum::new(
                        branch_name,
                        BranchKind::Normal,
                        None,
                        *dtype,
                        shape.clone(),
                        compression,
                        capacity,
                    ));
                }
                BranchType::Jagged { dtype } => {
                    let count_branch = counter_name(branch_name);
                    // Counters always replace ordinary branches of the same
                    // name.
                    if let Some(&existing) = branch_lookup.get(count_branch.as_str()) {
                        if branch_data[existing].kind != BranchKind::Counter {
                            branch_data.remove(existing);
                            branch_lookup.values_mut().for_each(|index| {
                                if *index > existing {
                                    *index -= 1;
                                }
                            });
                            branch_lookup.remove(count_branch.as_str());
                        }
                    }
                    let counter_index = branch_data.len();
                    branch_lookup.insert(count_branch.clone(), counter_index);
                    branch_data.push(BranchDatum::new(
                        &count_branch,
                        BranchKind::Counter,
                        None,
                        Dtype::I32,
                        Vec::new(),
                        compression,
                        capacity,
                    ));

                    if branch_lookup.contains_key(branch_name.as_str()) {
                        continue;
                    }
                    branch_lookup.insert(branch_name.clone(), branch_data.len());
                    branch_data.push(BranchDatum::new(
                        branch_name,
                        BranchKind::Normal,
                        Some(counter_index),
                        *dtype,
                        Vec::new(),
                        compression,
                        capacity,
                    ));
                }
            }
        }

        Ok(Tree {
            directory,
            freesegments,
            name: name.to_string(),
            title: title.to_string(),
            basket_capacity: capacity,
            resize_factor,
            branch_data,
            branch_lookup,
            num_entries: 0,
            num_baskets: 0,
            metadata: TreeMetadata::default(),
            metadata_start: None,
            key: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_entries(&self) -> i64 {
        self.num_entries
    }

    pub fn num_baskets(&self) -> usize {
        self.num_baskets
    }

    pub fn basket_capacity(&self) -> usize {
        self.basket_capacity
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.branch_data
            .iter()
            .map(|datum| datum.name.as_str())
            .collect()
    }

    /// Serializes the whole tree with its current (possibly zero) baskets and
    /// places it through the directory, replacing any previous incarnation.
    pub fn write_anew(&mut self, sink: &mut FileSink) -> Result<()> {
        let mut key_num_bytes = KEY_BIG_BYTES + serialization::string_size("TTree");
        key_num_bytes += serialization::string_size(&self.name);
        key_num_bytes += serialization::string_size(&self.title);

        // Segments of the record; `None` marks a header back-patched once
        // the bytes after it are known.
        let mut out: Vec<Option<Vec<u8>>> = Vec::new();
        let ttree_header_index = 0;
        out.push(None);

        out.push(Some(serialization::tnamed(
            &self.name,
            &self.title,
            crate::ObjectBits::MUST_CLEANUP.bits(),
        )));
        out.push(Some(ATTRIBUTE_BLOCKS.to_vec()));

        let metadata_out_index = out.len();
        out.push(Some(self.pack_tree_metadata()));

        // Speedbumps for the empty fClusterRangeEnd and fClusterSize arrays,
        // then an empty fIOFeatures.
        let mut cluster = vec![0u8, 0u8];
        cluster.extend_from_slice(IOFEATURES_BLOCK);
        out.push(Some(cluster));

        let mut tleaf_reference_numbers: Vec<u32> = Vec::new();

        let tobjarray_of_branches_index = out.len();
        out.push(None);

        let num_branches = self.branch_data.len() as i32;
        // TObjArray header with an empty fName.
        let mut array_head = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x40, 0x00, 0x00];
        {
            let mut w = IoCursor::new(Vec::new());
            w.write_be(&num_branches).unwrap();
            w.write_be(&0i32).unwrap();
            array_head.extend_from_slice(&w.into_inner());
        }
        out.push(Some(array_head));

        for index in 0..self.branch_data.len() {
            let any_tbranch_index = out.len();
            out.push(None);
            out.push(Some(b"TBranch\x00".to_vec()));

            let tbranch_index = out.len();
            out.push(None);

            {
                let datum = &self.branch_data[index];
                out.push(Some(serialization::tnamed(
                    &datum.name,
                    &datum.title,
                    0x0040_0000,
                )));
            }
            out.push(Some(FILL_BLOCK.to_vec()));

            debug_assert_eq!(out.iter().filter(|x| x.is_none()).count(), 4);
            let metadata_start = (6 + 6 + 8 + 6)
                + out
                    .iter()
                    .flatten()
                    .map(|x| x.len() as u64)
                    .sum::<u64>();
            self.branch_data[index].metadata_start = Some(metadata_start);

            // The branch's compression is written as 0 so readers re-check
            // whether small baskets were actually compressed.
            {
                let datum = &self.branch_data[index];
                let mut w = IoCursor::new(Vec::new());
                w.write_be(&0i32).unwrap(); // fCompress
                w.write_be(&datum.basket_size).unwrap();
                w.write_be(&datum.entry_offset_len).unwrap();
                w.write_be(&(self.num_baskets as i32)).unwrap(); // fWriteBasket
                w.write_be(&self.num_entries).unwrap(); // fEntryNumber
                out.push(Some(w.into_inner()));
            }
            out.push(Some(IOFEATURES_BLOCK.to_vec()));
            {
                let datum = &self.branch_data[index];
                let mut w = IoCursor::new(Vec::new());
                w.write_be(&datum.offset).unwrap();
                w.write_be(&(self.basket_capacity as u32)).unwrap(); // fMaxBaskets
                w.write_be(&datum.split_level).unwrap();
                w.write_be(&self.num_entries).unwrap(); // fEntries
                w.write_be(&datum.first_entry).unwrap();
                w.write_be(&datum.tot_bytes).unwrap();
                w.write_be(&datum.zip_bytes).unwrap();
                out.push(Some(w.into_inner()));
            }

            // Empty TObjArray of sub-branches.
            out.push(Some(EMPTY_TOBJARRAY.to_vec()));

            let subtobjarray_of_leaves_index = out.len();
            out.push(None);

            // TObjArray header: empty fName, fSize 1, fLowerBound 0.
            out.push(Some(vec![
                0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            ]));

            let absolute_location = key_num_bytes
                + out.iter().flatten().map(|x| x.len() as u64).sum::<u64>()
                + 8
                + 6 * (out.iter().filter(|x| x.is_none()).count() as u64 - 1);
            let reference_number = (absolute_location + 2) as u32;
            self.branch_data[index].tleaf_reference_number = Some(reference_number);
            tleaf_reference_numbers.push(reference_number);

            let subany_tleaf_index = out.len();
            out.push(None);

            let datum = &self.branch_data[index];
            let letter_upper = datum.dtype.type_letter().to_ascii_uppercase();
            out.push(Some(
                format!("TLeaf{letter_upper}\x00").into_bytes(),
            ));

            let len_type = datum.dtype.item_size() as i32;
            let is_unsigned = datum.dtype.is_unsigned();

            let mut dims: String = datum.shape.iter().map(|d| format!("[{d}]")).collect();
            if let Some(counter) = datum.counter {
                dims = format!("[{}]{dims}", self.branch_data[counter].name);
            }

            let leaf_name = serialization::string(&datum.name);
            let leaf_title = serialization::string(&format!("{}{dims}", datum.name));

            let special_bytes = datum.dtype.special_struct_bytes();
            let leaf_header = {
                let mut w = IoCursor::new(Vec::with_capacity(28));
                let name_title = (leaf_name.len() + leaf_title.len()) as u32;
                w.write_be(&((42 + name_title + special_bytes as u32) | BYTE_COUNT_MASK))
                    .unwrap();
                w.write_be(&1u16).unwrap(); // TLeafX version
                w.write_be(&((36 + name_title) | BYTE_COUNT_MASK)).unwrap();
                w.write_be(&2u16).unwrap(); // TLeaf version
                w.write_be(&((12 + name_title) | BYTE_COUNT_MASK)).unwrap();
                w.write_be(&1u16).unwrap(); // TNamed version
                w.write_be(&1u16).unwrap(); // TObject version
                w.write_be(&0u32).unwrap(); // fUniqueID
                w.write_be(&0x0300_0000u32).unwrap(); // fBits
                w.into_inner()
            };
            out.push(Some(leaf_header));
            out.push(Some(leaf_name));
            out.push(Some(leaf_title));

            let flen: i32 = datum.items_per_entry() as i32;
            {
                let mut w = IoCursor::new(Vec::new());
                w.write_be(&flen).unwrap();
                w.write_be(&len_type).unwrap();
                w.write_be(&0i32).unwrap(); // fOffset
                w.write_be(&((datum.kind == BranchKind::Counter) as u8))
                    .unwrap(); // fIsRange
                w.write_be(&(is_unsigned as u8)).unwrap();
                out.push(Some(w.into_inner()));
            }

            match datum.counter {
                None => out.push(Some(vec![0, 0, 0, 0])), // null fLeafCount
                Some(counter) => {
                    let reference = self.branch_data[counter]
                        .tleaf_reference_number
                        .unwrap_or(0);
                    out.push(Some(reference.to_be_bytes().to_vec()));
                }
            }

            // Specialized fMinimum/fMaximum, zero until updates.
            {
                let mut w = IoCursor::new(Vec::new());
                datum.dtype.write_special(&mut w, 0, 0);
                out.push(Some(w.into_inner()));
            }

            patch_object_any(&mut out, subany_tleaf_index);
            patch_numbytes_version(&mut out, subtobjarray_of_leaves_index, 3);

            // Empty TObjArray of fBaskets (embedded).
            out.push(Some(EMPTY_TOBJARRAY.to_vec()));

            debug_assert_eq!(out.iter().filter(|x| x.is_none()).count(), 4);
            let basket_metadata_start = (6 + 6 + 8 + 6)
                + out
                    .iter()
                    .flatten()
                    .map(|x| x.len() as u64)
                    .sum::<u64>();
            self.branch_data[index].basket_metadata_start = Some(basket_metadata_start);

            let datum = &self.branch_data[index];
            let mut arrays = Vec::new();
            arrays.push(1u8);
            for value in &datum.basket_bytes {
                arrays.extend_from_slice(&value.to_be_bytes());
            }
            arrays.push(1u8);
            for value in &datum.basket_entry {
                arrays.extend_from_slice(&value.to_be_bytes());
            }
            arrays.push(1u8);
            for value in &datum.basket_seek {
                arrays.extend_from_slice(&value.to_be_bytes());
            }
            arrays.push(0u8); // empty fFileName
            out.push(Some(arrays));

            patch_numbytes_version(&mut out, tbranch_index, 13);
            patch_object_any(&mut out, any_tbranch_index);
        }

        patch_numbytes_version(&mut out, tobjarray_of_branches_index, 3);

        // TObjArray of TLeaf back-references.
        {
            let reference_bytes = 4 * tleaf_reference_numbers.len() as u32;
            let mut block = Vec::with_capacity(25 + reference_bytes as usize);
            block.extend_from_slice(&((21 + reference_bytes) | BYTE_COUNT_MASK).to_be_bytes());
            block.extend_from_slice(&[
                0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00,
            ]);
            block.extend_from_slice(&(tleaf_reference_numbers.len() as u32).to_be_bytes());
            block.extend_from_slice(&[0, 0, 0, 0]);
            for reference in &tleaf_reference_numbers {
                block.extend_from_slice(&reference.to_be_bytes());
            }
            out.push(Some(block));
        }

        // Null fAliases, empty fIndexValues and fIndex, null fTreeIndex,
        // fFriends, fUserInfo, fBranchRef.
        out.push(Some(vec![0u8; 28]));

        patch_numbytes_version(&mut out, ttree_header_index, 20);

        self.metadata_start = Some(
            out[..metadata_out_index]
                .iter()
                .flatten()
                .map(|x| x.len() as u64)
                .sum(),
        );

        let raw_data: Vec<u8> = out
            .into_iter()
            .map(|x| x.expect("all headers patched"))
            .flatten()
            .collect();

        let replaces = self
            .key
            .as_ref()
            .map(|key| (key.name().to_string(), key.cycle()));
        let uncompressed = raw_data.len() as u32;
        let key = self.directory.borrow_mut().add_object(
            sink,
            "TTree",
            &self.name,
            &self.title,
            &raw_data,
            uncompressed,
            replaces
                .as_ref()
                .map(|(name, cycle)| (name.as_str(), *cycle)),
            Some(true),
        )?;
        self.key = Some(key);
        debug!(name = %self.name, branches = self.branch_data.len(), "wrote tree");
        Ok(())
    }

    fn pack_tree_metadata(&self) -> Vec<u8> {
        let mut w = IoCursor::new(Vec::with_capacity(116));
        w.write_be(&self.num_entries).unwrap();
        w.write_be(&self.metadata.tot_bytes).unwrap();
        w.write_be(&self.metadata.zip_bytes).unwrap();
        w.write_be(&self.metadata.saved_bytes).unwrap();
        w.write_be(&self.metadata.flushed_bytes).unwrap();
        w.write_be(&self.metadata.weight).unwrap();
        w.write_be(&self.metadata.timer_interval).unwrap();
        w.write_be(&self.metadata.scan_field).unwrap();
        w.write_be(&self.metadata.update).unwrap();
        w.write_be(&self.metadata.default_entry_offset_len).unwrap();
        w.write_be(&self.metadata.ncluster_range).unwrap();
        w.write_be(&self.metadata.max_entries).unwrap();
        w.write_be(&self.metadata.max_entry_loop).unwrap();
        w.write_be(&self.metadata.max_virtual_size).unwrap();
        w.write_be(&self.metadata.auto_save).unwrap();
        w.write_be(&self.metadata.auto_flush).unwrap();
        w.write_be(&self.metadata.estimate).unwrap();
        w.into_inner()
    }

    /// Appends one basket per branch.
    ///
    /// Every branch must receive a column of the same entry count; jagged
    /// branches take a [`Column::Jagged`] whose counter column is derived
    /// automatically. Validation happens before any byte is written, so a
    /// failed call leaves the file unchanged.
    pub fn extend(&mut self, sink: &mut FileSink, columns: &[(String, Column)]) -> Result<()> {
        let path = sink.path().to_path_buf();

        // Match provided columns against branches and derive counter columns
        // first: every error this call can raise happens before the file or
        // the in-memory tree is touched.
        let mut provided: HashMap<&str, &Column> = HashMap::new();
        for (name, column) in columns {
            if !self.branch_lookup.contains_key(name.as_str()) {
                return Err(Error::format(
                    &path,
                    format!("'extend' was given a column that matches no branch: {name:?}"),
                ));
            }
            provided.insert(name.as_str(), column);
        }

        let mut num_entries: Option<usize> = None;
        let mut tofill: Vec<(usize, Vec<u8>, Option<Vec<i32>>)> = Vec::new();
        let mut counter_values: HashMap<usize, Vec<i32>> = HashMap::new();

        for (index, datum) in self.branch_data.iter().enumerate() {
            if datum.kind == BranchKind::Counter {
                continue;
            }
            let column = provided.remove(datum.name.as_str()).ok_or_else(|| {
                Error::format(
                    &path,
                    format!("'extend' must be given a column for every branch; missing {:?}", datum.name),
                )
            })?;

            let (entries, offsets) = match (datum.counter, column) {
                (None, Column::Jagged { .. }) => {
                    return Err(Error::format(
                        &path,
                        format!("branch {:?} is rectangular but was given a jagged column", datum.name),
                    ));
                }
                (None, flat) => {
                    if flat.dtype() != datum.dtype {
                        return Err(Error::format(
                            &path,
                            format!("column for branch {:?} has the wrong type", datum.name),
                        ));
                    }
                    let per_entry = datum.items_per_entry();
                    if flat.num_items() % per_entry != 0 {
                        return Err(Error::format(
                            &path,
                            format!(
                                "column for branch {:?} does not divide into entries of shape {:?}",
                                datum.name, datum.shape
                            ),
                        ));
                    }
                    (flat.num_items() / per_entry, None)
                }
                (Some(counter), Column::Jagged { offsets, values }) => {
                    if values.dtype() != datum.dtype {
                        return Err(Error::format(
                            &path,
                            format!("column for branch {:?} has the wrong type", datum.name),
                        ));
                    }
                    if offsets.first() != Some(&0)
                        || offsets.windows(2).any(|w| w[1] < w[0])
                        || *offsets.last().unwrap_or(&0) as usize != values.num_items()
                    {
                        return Err(Error::format(
                            &path,
                            format!("offsets for branch {:?} are not a valid prefix sum", datum.name),
                        ));
                    }
                    let counts: Vec<i32> = offsets.windows(2).map(|w| w[1] - w[0]).collect();
                    counter_values.insert(counter, counts);
                    (offsets.len() - 1, Some(offsets.clone()))
                }
                (Some(_), _) => {
                    return Err(Error::format(
                        &path,
                        format!("branch {:?} is jagged and needs an offsets array", datum.name),
                    ));
                }
            };

            match num_entries {
                None => num_entries = Some(entries),
                Some(previous) if previous != entries => {
                    return Err(Error::format(
                        &path,
                        format!(
                            "'extend' must fill every branch with the same number of entries; \
                             {:?} has {entries}, expected {previous}",
                            datum.name
                        ),
                    ));
                }
                Some(_) => {}
            }

            tofill.push((index, column.to_big_endian(), offsets));
        }
        if let Some((name, _)) = provided.iter().next() {
            return Err(Error::format(
                &path,
                format!("'extend' was given data for a counter branch: {name:?}"),
            ));
        }
        let num_entries = num_entries.unwrap_or(0) as i64;
        for counts in counter_values.values() {
            if counts.len() as i64 != num_entries {
                return Err(Error::format(
                    &path,
                    "derived counter column disagrees with the entry count",
                ));
            }
        }

        // Growing the pointer arrays forces a whole-tree rewrite at a new
        // location. Growth triggers one basket early: a completely full
        // fBasketEntry would have nowhere to record the entry count of the
        // last basket.
        if self.num_baskets >= self.basket_capacity - 1 {
            self.basket_capacity = usize::max(
                self.basket_capacity + 1,
                (self.basket_capacity as f64 * self.resize_factor).ceil() as usize,
            );

            for datum in &mut self.branch_data {
                let old_len = datum.basket_entry.len();
                datum.basket_bytes.resize(self.basket_capacity, 0);
                datum.basket_entry.resize(self.basket_capacity, 0);
                datum.basket_seek.resize(self.basket_capacity, 0);
                if old_len < self.basket_capacity {
                    datum.basket_entry[old_len] = self.num_entries;
                }
            }

            let (old_start, old_stop) = match &self.key {
                Some(key) => {
                    let start = key.seek_location().or(key.location()).unwrap_or(0);
                    let stop = start
                        + key.num_bytes()
                        + key.compressed_bytes().unwrap_or(0) as u64;
                    (start, stop)
                }
                None => (0, 0),
            };

            self.write_anew(sink)?;

            if old_stop > old_start {
                self.freesegments.borrow_mut().release(old_start, old_stop)?;
            }
            let end = self.freesegments.borrow().fileheader.borrow().end();
            if let Some(end) = end {
                sink.set_file_length(end)?;
            }
            sink.flush()?;
        }

        // Counter branches fill from the derived counts.
        for (index, counts) in counter_values {
            let maximum = counts.iter().copied().max().unwrap_or(0) as i64;
            self.branch_data[index].tleaf_maximum_value =
                self.branch_data[index].tleaf_maximum_value.max(maximum);
            let bytes: Vec<u8> = counts.iter().flat_map(|v| v.to_be_bytes()).collect();
            tofill.push((index, bytes, None));
        }
        tofill.sort_by_key(|(index, _, _)| *index);

        // Write the baskets.
        let mut uncompressed_total = 0i64;
        let mut compressed_total = 0i64;
        for (index, big_endian, offsets) in tofill {
            let (totbytes, zipbytes, location) = match &offsets {
                None => self.write_basket(sink, index, &big_endian, None)?,
                Some(offsets) => {
                    let item_size = self.branch_data[index].dtype.item_size() as i32;
                    self.write_basket(sink, index, &big_endian, Some((offsets, item_size)))?
                }
            };
            if offsets.is_some() {
                let datum = &mut self.branch_data[index];
                datum.entry_offset_len = 4 * num_entries as i32;
            }

            uncompressed_total += totbytes;
            compressed_total += zipbytes;

            let datum = &mut self.branch_data[index];
            datum.tot_bytes += totbytes;
            datum.zip_bytes += zipbytes;
            datum.basket_bytes[self.num_baskets] = zipbytes as i32;
            if self.num_baskets + 1 < self.basket_capacity {
                datum.basket_entry[self.num_baskets + 1] =
                    datum.basket_entry[self.num_baskets] + num_entries;
            }
            datum.basket_seek[self.num_baskets] = location as i64;
            datum.arrays_write_stop = self.num_baskets + 1;
        }

        self.num_entries += num_entries;
        self.num_baskets += 1;
        self.metadata.tot_bytes += uncompressed_total;
        self.metadata.zip_bytes += compressed_total;

        self.write_updates(sink)
    }

    /// Writes one `TBasket` record: a big-form key whose class struct is part
    /// of the key region, then the (possibly compressed) payload.
    fn write_basket(
        &mut self,
        sink: &mut FileSink,
        index: usize,
        big_endian: &[u8],
        jagged: Option<(&[i32], i32)>,
    ) -> Result<(i64, i64, u64)> {
        let path = sink.path().to_path_buf();
        let datum = &self.branch_data[index];
        let branch_name = datum.name.clone();
        let compression = datum.compression;

        let classname = serialization::string("TBasket");
        let name = serialization::string(&branch_name);
        let title = serialization::string(&self.name);

        let key_len = KEY_BIG_BYTES
            + classname.len() as u64
            + name.len() as u64
            + title.len() as u64
            + TBASKET_STRUCT_BYTES
            + 1;

        let (uncompressed_data, nev_buf_size, nev_buf, last) = match jagged {
            None => {
                let item_bytes = datum.dtype.item_size() * datum.items_per_entry();
                let entries = if item_bytes == 0 {
                    0
                } else {
                    big_endian.len() / item_bytes
                };
                (
                    big_endian.to_vec(),
                    item_bytes as i32,
                    entries as i32,
                    (key_len as usize + big_endian.len()) as i32,
                )
            }
            Some((offsets, item_size)) => {
                // Offsets become absolute within the record (key bytes
                // included); the last one is zeroed on disk and carried in
                // fLast instead.
                let translated: Vec<i32> = offsets
                    .iter()
                    .map(|&offset| offset * item_size + key_len as i32)
                    .collect();
                let last = *translated.last().unwrap_or(&(key_len as i32));
                let mut data =
                    Vec::with_capacity(big_endian.len() + 4 + 4 * translated.len());
                data.extend_from_slice(big_endian);
                data.extend_from_slice(&(translated.len() as u32).to_be_bytes());
                for (i, &offset) in translated.iter().enumerate() {
                    if i + 1 == translated.len() {
                        data.extend_from_slice(&0i32.to_be_bytes());
                    } else {
                        data.extend_from_slice(&offset.to_be_bytes());
                    }
                }
                (
                    data,
                    offsets.len() as i32 + 1,
                    offsets.len() as i32 - 1,
                    last,
                )
            }
        };

        let compressed_data =
            crate::compression::compress(&uncompressed_data, compression, &path)?;
        let obj_len = uncompressed_data.len() as i32;
        let total_bytes = key_len + compressed_data.len() as u64;

        let parent_location = self.directory.borrow().key.location().unwrap_or(0);
        let location = self
            .freesegments
            .borrow_mut()
            .allocate(total_bytes, false);

        let mut w = IoCursor::new(Vec::with_capacity(total_bytes as usize));
        // Baskets always use the big key form, flagged by version 1004.
        w.write_be(&KeyRecordBig {
            total_bytes: total_bytes as i32,
            version: 1004,
            object_len: obj_len,
            datime: serialization::datime_now(),
            key_len: key_len as u16,
            cycle: 0,
            seek_key: location as i64,
            seek_pdir: parent_location as i64,
        })
        .unwrap();
        let mut out = w.into_inner();
        out.extend_from_slice(&classname);
        out.extend_from_slice(&name);
        out.extend_from_slice(&title);
        let mut w = IoCursor::new(Vec::with_capacity(TBASKET_STRUCT_BYTES as usize + 1));
        w.write_be(&BasketRecord {
            version: 3,
            buffer_size: 32000,
            nev_buf_size,
            nev_buf,
            last,
        })
        .unwrap();
        w.write_be(&0u8).unwrap();
        out.extend_from_slice(&w.into_inner());
        out.extend_from_slice(&compressed_data);

        sink.write(location, &out)?;
        self.freesegments.borrow_mut().write(sink)?;
        let end = self.freesegments.borrow().fileheader.borrow().end();
        if let Some(end) = end {
            sink.set_file_length(end)?;
        }
        sink.flush()?;

        Ok((
            key_len as i64 + obj_len as i64,
            total_bytes as i64,
            location,
        ))
    }

    /// Rewrites only the regions that change as baskets are added: the tree
    /// metadata, each branch's counters, the dirty slice of the pointer
    /// arrays, and counter-leaf maxima. Nothing moves.
    pub fn write_updates(&mut self, sink: &mut FileSink) -> Result<()> {
        let key = self.key.as_ref().ok_or_else(|| {
            Error::format(sink.path(), "tree has not been written yet")
        })?;
        let base = key.seek_location().or(key.location()).unwrap_or(0) + key.num_bytes();

        let metadata = self.pack_tree_metadata();
        let metadata_start = self.metadata_start.unwrap_or(0);
        sink.write(base + metadata_start, &metadata)?;

        for datum in &mut self.branch_data {
            let mut position = base + datum.metadata_start.unwrap_or(0);

            let mut w = IoCursor::new(Vec::new());
            w.write_be(&0i32).unwrap(); // fCompress, see write_anew
            w.write_be(&datum.basket_size).unwrap();
            w.write_be(&datum.entry_offset_len).unwrap();
            w.write_be(&(self.num_baskets as i32)).unwrap();
            w.write_be(&self.num_entries).unwrap();
            sink.write(position, &w.into_inner())?;

            position += TBRANCH_FORMAT1_BYTES + IOFEATURES_BYTES;
            let mut w = IoCursor::new(Vec::new());
            w.write_be(&datum.offset).unwrap();
            w.write_be(&(self.basket_capacity as u32)).unwrap();
            w.write_be(&datum.split_level).unwrap();
            w.write_be(&self.num_entries).unwrap();
            w.write_be(&datum.first_entry).unwrap();
            w.write_be(&datum.tot_bytes).unwrap();
            w.write_be(&datum.zip_bytes).unwrap();
            sink.write(position, &w.into_inner())?;

            let (start, stop) = (datum.arrays_write_start, datum.arrays_write_stop);
            let capacity = self.basket_capacity;

            let mut position = base + datum.basket_metadata_start.unwrap_or(0) + 1;
            position += 4 * start as u64;
            let bytes_part: Vec<u8> = datum.basket_bytes[start..stop]
                .iter()
                .flat_map(|v| v.to_be_bytes())
                .collect();
            sink.write(position, &bytes_part)?;
            position += bytes_part.len() as u64;
            position += 4 * (capacity - stop) as u64;

            position += 1;
            position += 8 * start as u64;
            let entry_part: Vec<u8> = datum.basket_entry[start..(stop + 1).min(capacity)]
                .iter()
                .flat_map(|v| v.to_be_bytes())
                .collect();
            sink.write(position, &entry_part)?;
            position += entry_part.len() as u64;
            position += 8 * (capacity - (stop + 1).min(capacity)) as u64;

            position += 1;
            position += 8 * start as u64;
            let seek_part: Vec<u8> = datum.basket_seek[start..stop]
                .iter()
                .flat_map(|v| v.to_be_bytes())
                .collect();
            sink.write(position, &seek_part)?;

            datum.arrays_write_start = datum.arrays_write_stop;

            if datum.kind == BranchKind::Counter {
                let special = datum.dtype.special_struct_bytes();
                let position = base + datum.basket_metadata_start.unwrap_or(0)
                    - EMPTY_TOBJARRAY_BYTES
                    - special;
                let mut w = IoCursor::new(Vec::new());
                datum
                    .dtype
                    .write_special(&mut w, 0, datum.tleaf_maximum_value);
                sink.write(position, &w.into_inner())?;
            }
        }

        sink.flush()
    }
}

/// Back-patches a num-bytes/version header over the placeholder at `index`.
fn patch_numbytes_version(out: &mut [Option<Vec<u8>>], index: usize, version: u16) {
    let num_bytes: usize = out[index + 1..]
        .iter()
        .flatten()
        .map(Vec::len)
        .sum();
    out[index] = Some(serialization::numbytes_version(num_bytes, version).to_vec());
}

/// Back-patches a read-any-object header (byte count + new-class tag) over
/// the placeholder at `index`.
fn patch_object_any(out: &mut [Option<Vec<u8>>], index: usize) {
    let num_bytes: usize = out[index + 1..]
        .iter()
        .flatten()
        .map(Vec::len)
        .sum();
    let mut header = Vec::with_capacity(8);
    header.extend_from_slice(&((num_bytes as u32 + 4) | BYTE_COUNT_MASK).to_be_bytes());
    header.extend_from_slice(&NEW_CLASS_TAG.to_be_bytes());
    out[index] = Some(header);
}
