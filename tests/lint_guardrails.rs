use std::path::Path;

#[test]
fn manifest_configures_expected_clippy_rules() {
    let manifest =
        std::fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml"))
            .expect("Cargo.toml");

    assert!(
        manifest.contains("[lints.clippy]"),
        "Cargo.toml must have a [lints.clippy] section"
    );
    assert!(
        manifest.contains("unwrap_used = \"deny\""),
        "Cargo.toml must deny unwrap_used"
    );
    assert!(
        manifest.contains("expect_used = \"warn\""),
        "Cargo.toml must warn on expect_used"
    );
}

#[test]
fn sources_avoid_unwrap() {
    let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    for entry in std::fs::read_dir(&src).expect("read src dir") {
        let path = entry.expect("dir entry").path();
        if path.extension().is_some_and(|ext| ext == "rs") {
            let text = std::fs::read_to_string(&path).expect("read source file");
            assert!(
                !text.contains(".unwrap()"),
                "{} calls unwrap(); propagate or handle the error instead",
                path.display()
            );
        }
    }
}
