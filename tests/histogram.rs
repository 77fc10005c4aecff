use taproot::model::Value;
use taproot::writing::Histogram1D;

fn contents() -> Vec<f64> {
    vec![0.0, 3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0, 3.0, 0.0]
}

#[test]
fn small_file_with_one_histogram() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hist.root");

    {
        let mut file = taproot::create(&path).unwrap();
        let hist = Histogram1D::from_contents("test", contents(), 0.0, 10.0);
        file.add_histogram("h", &hist).unwrap();
        file.close().unwrap();
    }

    assert!(
        std::fs::metadata(&path).unwrap().len() < 2048,
        "one small histogram should fit in 2 KiB"
    );

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let root = file.root_directory().unwrap();
    assert_eq!(root.keys(), vec!["h;1"]);

    let hist = root.get_object(&file, "h").unwrap();
    assert!(hist.is_instance("TH1"));
    assert_eq!(hist.member("fEntries").unwrap().as_f64(), Some(39.0));
    assert_eq!(hist.member("fTitle").unwrap().as_str(), Some("test"));
    match hist.member("fArray") {
        Some(Value::ArrayF64(array)) => assert_eq!(array, &contents()),
        other => panic!("fArray was {other:?}"),
    }

    let xaxis = hist.member("fXaxis").unwrap().as_object().unwrap();
    assert_eq!(xaxis.member("fNbins").unwrap().as_i64(), Some(10));
    assert_eq!(xaxis.member("fXmin").unwrap().as_f64(), Some(0.0));
    assert_eq!(xaxis.member("fXmax").unwrap().as_f64(), Some(10.0));
}

#[test]
fn cycles_count_up_and_lookup_takes_the_latest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cycles.root");

    {
        let mut file = taproot::create(&path).unwrap();
        for entries in [1.0, 2.0, 3.0] {
            let mut contents = vec![0.0; 12];
            contents[1] = entries;
            let hist = Histogram1D::from_contents("test", contents, 0.0, 10.0);
            file.add_histogram("h", &hist).unwrap();
        }
        assert_eq!(file.keys(), vec!["h;1", "h;2", "h;3"]);
        file.close().unwrap();
    }

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let root = file.root_directory().unwrap();
    assert_eq!(root.keys(), vec!["h;1", "h;2", "h;3"]);

    // Without a cycle the highest wins.
    assert_eq!(root.key("h").unwrap().cycle(), 3);
    let latest = root.get_object(&file, "h").unwrap();
    assert_eq!(latest.member("fEntries").unwrap().as_f64(), Some(3.0));

    // An explicit cycle retrieves an older version.
    let oldest = root.get_object(&file, "h;1").unwrap();
    assert_eq!(oldest.member("fEntries").unwrap().as_f64(), Some(1.0));
}

#[test]
fn updating_a_file_preserves_existing_objects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("update.root");

    {
        let mut file = taproot::create(&path).unwrap();
        let hist = Histogram1D::from_contents("first", contents(), 0.0, 10.0);
        file.add_histogram("h", &hist).unwrap();
        file.close().unwrap();
    }
    {
        let mut file = taproot::update(&path).unwrap();
        let hist = Histogram1D::from_contents("second", vec![0.0, 7.0, 0.0], 0.0, 1.0);
        file.add_histogram("g", &hist).unwrap();
        file.close().unwrap();
    }

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let root = file.root_directory().unwrap();
    assert_eq!(root.keys(), vec!["h;1", "g;1"]);
    assert_eq!(
        root.get_object(&file, "h")
            .unwrap()
            .member("fEntries")
            .unwrap()
            .as_f64(),
        Some(39.0)
    );
    assert_eq!(
        root.get_object(&file, "g")
            .unwrap()
            .member("fEntries")
            .unwrap()
            .as_f64(),
        Some(7.0)
    );
}

#[test]
fn flush_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flush.root");

    let mut file = taproot::create(&path).unwrap();
    let hist = Histogram1D::from_contents("test", contents(), 0.0, 10.0);
    file.add_histogram("h", &hist).unwrap();
    file.flush().unwrap();
    let first = std::fs::read(&path).unwrap();
    file.flush().unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
    file.close().unwrap();
}

#[test]
fn subdirectories_nest_and_iterate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested.root");

    {
        let mut file = taproot::create(&path).unwrap();
        file.mkdir("sub/inner").unwrap();
        let hist = Histogram1D::from_contents("nested", contents(), 0.0, 10.0);
        file.add_histogram_in("sub/inner", "h", &hist).unwrap();
        file.close().unwrap();
    }

    let file = taproot::open(path.to_str().unwrap()).unwrap();
    let root = file.root_directory().unwrap();

    let hist = root.get_object(&file, "sub/inner/h").unwrap();
    assert_eq!(hist.member("fEntries").unwrap().as_f64(), Some(39.0));

    let everything = root.iterate(&file, true, None, None).unwrap();
    let paths: Vec<&str> = everything.iter().map(|(p, _)| p.as_str()).collect();
    assert!(paths.contains(&"sub;1"));
    assert!(paths.contains(&"sub/inner;1"));
    assert!(paths.contains(&"sub/inner/h;1"));

    let only_hists = root.iterate(&file, true, None, Some("TH1D")).unwrap();
    assert_eq!(only_hists.len(), 1);
    assert_eq!(only_hists[0].0, "sub/inner/h;1");
}
