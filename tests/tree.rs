use taproot::model::Value;
use taproot::models::tree::read_branch;
use taproot::writing::{BranchType, Column, Dtype};

#[test]
fn appending_across_the_capacity_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.root");

    {
        let mut file = taproot::create(&path).unwrap();
        file.mktree_with(
            "t",
            "",
            &[(
                "x".to_string(),
                BranchType::Primitive {
                    dtype: Dtype::I32,
                    shape: vec![],
                },
            )],
            2,
            1.1,
        )
        .unwrap();

        file.extend("t", &[("x".to_string(), Column::I32(vec![1, 2, 3]))])
            .unwrap();
        assert_eq!(file.tree("t").unwrap().basket_capacity(), 2);

        // The pointer arrays grow one basket early: a completely full
        // fBasketEntry could not record the final basket's entry count.
        file.extend("t", &[("x".to_string(), Column::I32(vec![4, 5]))])
            .unwrap();
        assert_eq!(file.tree("t").unwrap().basket_capacity(), 3);

        file.extend("t", &[("x".to_string(), Column::I32(vec![6]))])
            .unwrap();
        assert_eq!(file.tree("t").unwrap().basket_capacity(), 4);

        file.extend("t", &[("x".to_string(), Column::I32(vec![7, 7, 7, 7]))])
            .unwrap();

        assert_eq!(file.tree("t").unwrap().num_baskets(), 4);
        assert_eq!(file.tree("t").unwrap().num_entries(), 10);
        file.close().unwrap();
    }

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let tree = file.get_object("t").unwrap();
    assert_eq!(tree.member("fEntries").unwrap().as_i64(), Some(10));

    let column = read_branch(&file, &tree, "x").unwrap();
    match &column.values {
        Value::ArrayI32(values) => assert_eq!(values, &[1, 2, 3, 4, 5, 6, 7, 7, 7, 7]),
        other => panic!("branch read back as {other:?}"),
    }
    assert!(column.entry_offsets.is_none());

    // fBasketEntry partial sums match the extensions.
    let branches = tree.member("fBranches").unwrap().as_object().unwrap();
    let branch = branches.member("items").unwrap().as_list().unwrap()[0]
        .as_object()
        .unwrap();
    match branch.member("fBasketEntry") {
        Some(Value::ArrayI64(entries)) => {
            assert_eq!(&entries[..5], &[0, 3, 5, 6, 10]);
        }
        other => panic!("fBasketEntry was {other:?}"),
    }
}

#[test]
fn jagged_branch_with_synthesized_counter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jagged.root");

    {
        let mut file = taproot::create(&path).unwrap();
        file.mktree(
            "t",
            "",
            &[("x".to_string(), BranchType::Jagged { dtype: Dtype::F32 })],
        )
        .unwrap();
        file.extend(
            "t",
            &[(
                "x".to_string(),
                Column::Jagged {
                    offsets: vec![0, 2, 2, 3],
                    values: Box::new(Column::F32(vec![1.0, 2.0, 3.0])),
                },
            )],
        )
        .unwrap();
        file.close().unwrap();
    }

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let tree = file.get_object("t").unwrap();
    assert_eq!(tree.member("fEntries").unwrap().as_i64(), Some(3));

    let counter = read_branch(&file, &tree, "nx").unwrap();
    match &counter.values {
        Value::ArrayI32(counts) => assert_eq!(counts, &[2, 0, 1]),
        other => panic!("counter read back as {other:?}"),
    }

    let column = read_branch(&file, &tree, "x").unwrap();
    match &column.values {
        Value::ArrayF32(values) => assert_eq!(values, &[1.0, 2.0, 3.0]),
        other => panic!("values read back as {other:?}"),
    }
    assert_eq!(column.entry_offsets, Some(vec![0, 2, 2, 3]));
}

#[test]
fn every_branch_must_receive_the_same_entry_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mismatch.root");

    let mut file = taproot::create(&path).unwrap();
    file.mktree(
        "t",
        "",
        &[
            (
                "a".to_string(),
                BranchType::Primitive {
                    dtype: Dtype::I32,
                    shape: vec![],
                },
            ),
            (
                "b".to_string(),
                BranchType::Primitive {
                    dtype: Dtype::F64,
                    shape: vec![],
                },
            ),
        ],
    )
    .unwrap();

    let err = file
        .extend(
            "t",
            &[
                ("a".to_string(), Column::I32(vec![1, 2, 3])),
                ("b".to_string(), Column::F64(vec![1.0])),
            ],
        )
        .unwrap_err();
    assert!(err.to_string().contains("same number of entries"));

    // The failed call left nothing behind.
    assert_eq!(file.tree("t").unwrap().num_entries(), 0);
    assert_eq!(file.tree("t").unwrap().num_baskets(), 0);

    file.extend(
        "t",
        &[
            ("a".to_string(), Column::I32(vec![1, 2])),
            ("b".to_string(), Column::F64(vec![0.5, 1.5])),
        ],
    )
    .unwrap();
    file.close().unwrap();

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let tree = file.get_object("t").unwrap();
    let column = read_branch(&file, &tree, "b").unwrap();
    match &column.values {
        Value::ArrayF64(values) => assert_eq!(values, &[0.5, 1.5]),
        other => panic!("branch read back as {other:?}"),
    }
}

#[test]
fn multiple_extends_of_shaped_branches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shaped.root");

    {
        let mut file = taproot::create(&path).unwrap();
        file.mktree(
            "t",
            "",
            &[(
                "pair".to_string(),
                BranchType::Primitive {
                    dtype: Dtype::F64,
                    shape: vec![2],
                },
            )],
        )
        .unwrap();
        file.extend(
            "t",
            &[(
                "pair".to_string(),
                Column::F64(vec![1.0, 2.0, 3.0, 4.0]),
            )],
        )
        .unwrap();
        assert_eq!(file.tree("t").unwrap().num_entries(), 2);
        file.close().unwrap();
    }

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let tree = file.get_object("t").unwrap();
    let column = read_branch(&file, &tree, "pair").unwrap();
    match &column.values {
        Value::ArrayF64(values) => assert_eq!(values, &[1.0, 2.0, 3.0, 4.0]),
        other => panic!("branch read back as {other:?}"),
    }
}
