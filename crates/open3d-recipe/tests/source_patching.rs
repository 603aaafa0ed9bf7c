use std::fs;
use std::path::Path;

use open3d_recipe::Error;
use open3d_recipe::patcher::{LEDGER_FILE, SourcePatcher};
use open3d_recipe::recipe;

const TOP_CMAKE: &str = "\
cmake_minimum_required(VERSION 3.12)
project(Open3D)
if (NOT MSVC)
    set(CMAKE_CXX_FLAGS \"${CMAKE_CXX_FLAGS} -Wall -Werror\")
endif()
add_subdirectory(src)
";

const UTILITY_CMAKE: &str = "\
file(GLOB UTILITY_SOURCE_FILES *.cpp)
set(UTILITY_SRC Console.cpp Eigen.cpp FileSystem.cpp)
add_library(utility OBJECT ${UTILITY_SRC})
";

fn reference_tree(root: &Path) {
    fs::write(root.join("CMakeLists.txt"), TOP_CMAKE).expect("write top");
    let util = root.join("src/Open3D/Utility");
    fs::create_dir_all(&util).expect("mkdir utility");
    fs::write(util.join("CMakeLists.txt"), UTILITY_CMAKE).expect("write utility");
    fs::write(util.join("Console.cpp"), "// console\n").expect("write console");
}

fn patcher() -> SourcePatcher {
    let recipe = recipe::builtin("open3d").expect("recipe");
    SourcePatcher::new(recipe.patches()).expect("patch list")
}

#[test]
fn reference_tree_is_patched_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    reference_tree(tmp.path());

    let report = patcher().apply(tmp.path()).expect("apply");
    assert_eq!(report.applied.len(), 3);
    assert!(report.skipped.is_empty());

    let top = fs::read_to_string(tmp.path().join("CMakeLists.txt")).expect("read top");
    assert!(!top.contains("-Werror"));
    assert!(top.contains("-Wall"));

    let stub = tmp.path().join("src/Open3D/Utility/MathFiniteStub.cpp");
    let stub_src = fs::read_to_string(&stub).expect("stub injected");
    assert!(stub_src.contains("__exp_finite"));

    let util_cmake = tmp.path().join("src/Open3D/Utility/CMakeLists.txt");
    let util = fs::read_to_string(&util_cmake).expect("read utility");
    assert_eq!(util.matches("MathFiniteStub.cpp").count(), 1);
    assert!(util.contains("Console.cpp MathFiniteStub.cpp"));
}

#[test]
fn second_application_changes_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    reference_tree(tmp.path());
    let patcher = patcher();
    patcher.apply(tmp.path()).expect("first");

    let util_cmake = tmp.path().join("src/Open3D/Utility/CMakeLists.txt");
    let before = fs::read_to_string(&util_cmake).expect("read");
    let report = patcher.apply(tmp.path()).expect("second");
    assert!(report.applied.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(fs::read_to_string(&util_cmake).expect("read"), before);

    let ledger = fs::read_to_string(tmp.path().join(LEDGER_FILE)).expect("ledger");
    assert_eq!(ledger.lines().count(), 3);
}

#[test]
fn upstream_drift_fails_loudly() {
    let tmp = tempfile::tempdir().expect("tempdir");
    reference_tree(tmp.path());
    fs::write(
        tmp.path().join("CMakeLists.txt"),
        "project(Open3D)\nadd_compile_options(-Wall)\n",
    )
    .expect("rewrite top");

    let err = patcher().apply(tmp.path()).expect_err("must fail");
    match err {
        Error::Patch { patch, path, .. } => {
            assert_eq!(patch, "relax-werror");
            assert!(path.ends_with("CMakeLists.txt"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!tmp.path().join(LEDGER_FILE).exists());
}

#[test]
fn missing_utility_listing_is_a_patch_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    fs::write(tmp.path().join("CMakeLists.txt"), TOP_CMAKE).expect("write top");

    let err = patcher().apply(tmp.path()).expect_err("must fail");
    assert!(
        matches!(err, Error::Patch { ref patch, .. } if patch == "compile-math-finite-stub"),
        "unexpected err: {err}"
    );
}

#[test]
fn second_anchor_mention_is_a_patch_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    reference_tree(tmp.path());
    let util_cmake = tmp.path().join("src/Open3D/Utility/CMakeLists.txt");
    let listing = format!(
        "{UTILITY_CMAKE}set_source_files_properties(Console.cpp PROPERTIES COMPILE_FLAGS -O0)\n"
    );
    fs::write(&util_cmake, &listing).expect("write utility");

    let err = patcher().apply(tmp.path()).expect_err("must fail");
    assert!(
        matches!(err, Error::Patch { ref patch, .. } if patch == "compile-math-finite-stub"),
        "unexpected err: {err}"
    );
    let util = fs::read_to_string(&util_cmake).expect("read utility");
    assert_eq!(util, listing);
    assert!(!util.contains("MathFiniteStub.cpp"));
}
