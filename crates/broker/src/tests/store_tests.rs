use super::*;

fn sample() -> Grid {
    let mut grid = Grid::new(3, 2).expect("grid");
    grid.set(0, 0, true);
    grid.set(2, 1, true);
    grid
}

#[test]
fn decodes_header_with_comments() {
    let mut bytes = b"P5\n# made by hand\n3 2\n255\n".to_vec();
    bytes.extend([255, 0, 0, 0, 0, 255]);
    assert_eq!(decode_pgm(&bytes).expect("decode"), sample());
}

#[test]
fn rejects_short_raster_and_wrong_magic() {
    let mut short = b"P5 3 2 255\n".to_vec();
    short.extend([255, 0]);
    assert!(decode_pgm(&short).is_err());
    assert!(decode_pgm(b"P9 1 1 255\n0").is_err());
    assert!(decode_pgm(b"not an image").is_err());
}

#[test]
fn ascii_graymap_is_accepted() {
    let bytes = b"P2\n3 2\n255\n255 0 0\n0 0 255\n";
    assert_eq!(decode_pgm(bytes).expect("decode"), sample());
}

#[test]
fn oversized_header_is_an_error_not_a_panic() {
    assert!(decode_pgm(b"P5\n4294967296 4294967296\n255\n").is_err());
    assert!(decode_pgm(b"P5\n65535 65535\n255\n").is_err());
}

#[test]
fn encoded_grid_decodes_to_same_cells() {
    let grid = sample();
    let bytes = encode_pgm(&grid).expect("encode");
    assert!(bytes.starts_with(b"P5"));
    assert_eq!(decode_pgm(&bytes).expect("decode"), grid);
}

#[test]
fn output_name_includes_dimensions_and_turn() {
    assert_eq!(output_name(&sample(), 100), "3x2x100");
}

#[tokio::test]
async fn pgm_store_saves_into_output_dir_and_loads_from_input_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PgmStore::new(dir.path().join("images"), dir.path().join("out"));

    store.save("3x2x0", &sample()).await.expect("save");
    assert!(dir.path().join("out").join("3x2x0.pgm").exists());

    tokio::fs::create_dir_all(dir.path().join("images"))
        .await
        .expect("mkdir");
    tokio::fs::copy(
        dir.path().join("out").join("3x2x0.pgm"),
        dir.path().join("images").join("3x2.pgm"),
    )
    .await
    .expect("copy");
    assert_eq!(store.load("3x2").await.expect("load"), sample());
    assert_eq!(store.load("3x2.pgm").await.expect("load"), sample());
}

#[tokio::test]
async fn pgm_store_reports_missing_and_escaping_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PgmStore::new(dir.path(), dir.path());

    assert!(matches!(
        store.load("nope").await.expect_err("missing"),
        StoreError::NotFound(_)
    ));
    assert!(matches!(
        store.load("../etc/passwd").await.expect_err("escape"),
        StoreError::InvalidName(_)
    ));
    assert!(matches!(
        store.load("  ").await.expect_err("blank"),
        StoreError::InvalidName(_)
    ));
}

#[tokio::test]
async fn memory_store_round_trips_grids() {
    let store = MemoryStore::new();
    assert!(matches!(
        store.load("x").await.expect_err("missing"),
        StoreError::NotFound(_)
    ));
    store.save("x", &sample()).await.expect("save");
    assert_eq!(store.load("x").await.expect("load"), sample());
}
