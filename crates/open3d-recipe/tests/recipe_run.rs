#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use open3d_recipe::config::ConfigDoc;
use open3d_recipe::driver::DriverState;
use open3d_recipe::executor::{self, ChannelSink, ExecCtx, ExecEvent};
use open3d_recipe::{Error, phases};

// Stands in for cmake: records the configure arguments, succeeds at build
// time and installs a small package.
const FAKE_CMAKE: &str = r#"#!/bin/sh
here="$(dirname "$0")"
case "$1" in
  --build)
    echo "[100%] Built target Open3D"
    exit 0 ;;
  --install)
    while [ $# -gt 0 ]; do
      if [ "$1" = "--prefix" ]; then prefix="$2"; fi
      shift
    done
    mkdir -p "$prefix/lib/cmake" "$prefix/bin" "$prefix/include/Open3D"
    : > "$prefix/lib/libOpen3D.so"
    : > "$prefix/lib/libOpen3D.so.0.10"
    : > "$prefix/lib/cmake/Open3DConfig.cmake"
    exit 0 ;;
  *)
    printf '%s\n' "$@" > "$here/configure.args"
    printf '\033[1;32m-- Configuring done\033[0m\n'
    exit 0 ;;
esac
"#;

const FAILING_CMAKE: &str = r#"#!/bin/sh
case "$1" in
  --build)
    echo "src/Open3D/Utility/Console.cpp:12: error: something broke" >&2
    exit 2 ;;
  *)
    exit 0 ;;
esac
"#;

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new(cmake_script: &str) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();

        let upstream = root.join("upstream");
        let util = upstream.join("src/Open3D/Utility");
        fs::create_dir_all(&util).expect("mkdir upstream");
        fs::write(
            upstream.join("CMakeLists.txt"),
            "project(Open3D)\nset(CMAKE_CXX_FLAGS \"-Wall -Werror\")\n",
        )
        .expect("write top");
        fs::write(util.join("CMakeLists.txt"), "set(SRC Console.cpp)\n").expect("write util");

        fs::write(root.join("cmake.sh"), cmake_script).expect("write script");
        Self { _tmp: tmp, root }
    }

    fn doc(&self, extra: &str) -> ConfigDoc {
        self.doc_from("upstream", extra)
    }

    fn doc_from(&self, source: &str, extra: &str) -> ConfigDoc {
        let src = format!(
            r#"
[recipe]
name = "open3d"

[workspace]
root_dir = '{root}'

[source]
path = '{source}'

[cmake]
command = ["sh", '{script}']
jobs = 2
{extra}
"#,
            root = self.root.display(),
            script = self.root.join("cmake.sh").display(),
        );
        ConfigDoc::parse(self.root.join("build.toml"), &src).expect("doc")
    }

    fn source_dir(&self) -> PathBuf {
        self.root.join("build/open3d-0.10.0/src/open3d")
    }

    fn run_dir(&self) -> PathBuf {
        self.root.join("out/open3d-0.10.0/recipe")
    }
}

fn run(doc: &ConfigDoc, dry_run: bool) -> (ExecCtx, open3d_recipe::Result<()>, Vec<ExecEvent>) {
    let plan = phases::plan_for(doc).expect("plan");
    let reg = executor::builtin_registry().expect("registry");
    let (tx, rx) = mpsc::channel();
    let mut ctx = ExecCtx::new(dry_run, Arc::new(ChannelSink::new(tx)));
    let res = executor::execute_plan(doc, &plan, &reg, &mut ctx);
    let events = rx.try_iter().collect();
    (ctx, res, events)
}

fn finished(events: &[ExecEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::StepFinished { id, ok, .. } => Some((id.clone(), *ok)),
            _ => None,
        })
        .collect()
}

fn read(p: &Path) -> String {
    fs::read_to_string(p).unwrap_or_else(|e| panic!("read {}: {e}", p.display()))
}

#[test]
fn full_run_publishes_package_info() {
    let fx = Fixture::new(FAKE_CMAKE);
    let doc = fx.doc("");
    let (ctx, res, events) = run(&doc, false);
    res.expect("run");

    let steps = finished(&events);
    assert_eq!(steps.len(), 7);
    assert!(steps.iter().all(|(_, ok)| *ok));
    assert!(matches!(
        events.last(),
        Some(ExecEvent::ExecutorDone { ok: true, .. })
    ));

    let driver = ctx.driver(&doc).expect("driver");
    assert_eq!(driver.state(), DriverState::Installed);

    let info = ctx.published().expect("published");
    assert_eq!(info.libs, vec!["Open3D".to_string()]);
    assert!(info.bin_path.ends_with("bin"));
    assert!(info.bin_path.starts_with(fx.root.join("out/open3d-0.10.0/package")));

    let top = read(&fx.source_dir().join("CMakeLists.txt"));
    assert!(!top.contains("-Werror"));
    assert!(fx.source_dir().join("src/Open3D/Utility/MathFiniteStub.cpp").is_file());

    let args = read(&fx.root.join("configure.args"));
    for flag in [
        "-DBUILD_SHARED_LIBS=ON",
        "-DEIGEN3_FOUND=ON",
        "-DGLFW3_FOUND=ON",
        "-DBUILD_LIBREALSENSE=OFF",
        "-DCMAKE_BUILD_TYPE=Release",
    ] {
        assert!(args.lines().any(|l| l == flag), "missing {flag} in:\n{args}");
    }
    assert!(!args.contains("GLEW_FOUND"));

    let configure_marker = read(&fx.run_dir().join("configure.marker"));
    let signature = ctx.resolved(&doc).expect("resolved").signature();
    assert!(configure_marker.contains(&format!("signature={signature}")));

    let published: serde_json::Value =
        serde_json::from_str(&read(&fx.run_dir().join("package_info.json"))).expect("json");
    assert_eq!(published["libs"], serde_json::json!(["Open3D"]));

    let reqs: serde_json::Value =
        serde_json::from_str(&read(&fx.run_dir().join("requirements.json"))).expect("json");
    let refs: Vec<_> = reqs["requires"]
        .as_array()
        .expect("requires")
        .iter()
        .filter_map(|r| r["reference"].as_str())
        .collect();
    assert_eq!(refs, vec!["eigen/[>=3.3.7]", "glfw/[>=3.3.2]"]);
}

#[test]
fn colored_tool_output_is_sanitized() {
    let fx = Fixture::new(FAKE_CMAKE);
    let (_ctx, res, events) = run(&fx.doc(""), false);
    res.expect("run");
    let configure_lines: Vec<_> = events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::StepLog { id, line } if id == "recipe.configure" => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert!(configure_lines.contains(&"-- Configuring done"));
}

#[test]
fn rerun_reuses_checkout_without_repatching() {
    let fx = Fixture::new(FAKE_CMAKE);
    let doc = fx.doc("");
    run(&doc, false).1.expect("first run");
    run(&doc, false).1.expect("second run");

    let marker = read(&fx.run_dir().join("source.marker"));
    assert!(marker.contains("origin=existing"));
    assert!(marker.contains("patches_applied=\n"));
    let util = read(&fx.source_dir().join("src/Open3D/Utility/CMakeLists.txt"));
    assert_eq!(util.matches("MathFiniteStub.cpp").count(), 1);
}

#[test]
fn interrupted_fetch_is_discarded_and_fetched_again() {
    let fx = Fixture::new(FAKE_CMAKE);
    fs::create_dir_all(fx.source_dir()).expect("mkdir checkout");
    fs::write(fx.source_dir().join("half-cloned.txt"), "partial\n").expect("write leftover");

    run(&fx.doc(""), false).1.expect("run");

    assert!(!fx.source_dir().join("half-cloned.txt").exists());
    let top = read(&fx.source_dir().join("CMakeLists.txt"));
    assert!(!top.contains("-Werror"));
    let marker = read(&fx.run_dir().join("source.marker"));
    assert!(marker.contains("origin=path:"), "unexpected marker:\n{marker}");
}

#[test]
fn checkout_from_another_origin_is_not_reused() {
    let fx = Fixture::new(FAKE_CMAKE);
    run(&fx.doc(""), false).1.expect("first run");

    let other = fx.root.join("upstream-next");
    fs::create_dir_all(other.join("src/Open3D/Utility")).expect("mkdir next");
    fs::copy(
        fx.root.join("upstream/CMakeLists.txt"),
        other.join("CMakeLists.txt"),
    )
    .expect("copy top");
    fs::copy(
        fx.root.join("upstream/src/Open3D/Utility/CMakeLists.txt"),
        other.join("src/Open3D/Utility/CMakeLists.txt"),
    )
    .expect("copy utility");
    fs::write(other.join("NEXT"), "next\n").expect("write next");

    run(&fx.doc_from("upstream-next", ""), false)
        .1
        .expect("second run");

    assert!(fx.source_dir().join("NEXT").is_file());
    let marker = read(&fx.run_dir().join("source.marker"));
    assert!(!marker.contains("origin=existing"));
    assert!(marker.contains("upstream-next"));
    let util = read(&fx.source_dir().join("src/Open3D/Utility/CMakeLists.txt"));
    assert_eq!(util.matches("MathFiniteStub.cpp").count(), 1);
}

#[test]
fn failing_build_stops_the_run() {
    let fx = Fixture::new(FAILING_CMAKE);
    let (_ctx, res, events) = run(&fx.doc(""), false);

    match res {
        Err(Error::Build {
            phase,
            code,
            output,
            ..
        }) => {
            assert_eq!(phase, "build");
            assert_eq!(code, Some(2));
            assert!(output.iter().any(|l| l.contains("something broke")));
        }
        other => panic!("expected build error, got {other:?}"),
    }

    let reported = events
        .iter()
        .filter(|ev| matches!(ev, ExecEvent::StepLog { line, .. } if line.contains("something broke")))
        .count();
    assert_eq!(reported, 1);

    let steps = finished(&events);
    assert_eq!(steps.last(), Some(&("recipe.build".to_string(), false)));
    assert!(!steps.iter().any(|(id, _)| id == "recipe.package"));
    assert!(!fx.run_dir().join("package_info.json").exists());
}

#[test]
fn dry_run_touches_nothing() {
    let fx = Fixture::new(FAKE_CMAKE);
    let (ctx, res, events) = run(&fx.doc(""), true);
    res.expect("dry run");

    assert_eq!(finished(&events).len(), 7);
    assert!(ctx.published().is_none());
    assert!(!fx.root.join("build").exists());
    assert!(!fx.root.join("configure.args").exists());
}

#[test]
fn invalid_option_aborts_before_fetching() {
    let fx = Fixture::new(FAKE_CMAKE);
    let (_ctx, res, events) = run(&fx.doc("\n[options]\nshared = \"maybe\"\n"), false);

    match res {
        Err(Error::Configuration { option, .. }) => assert_eq!(option, "shared"),
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert_eq!(
        finished(&events).last(),
        Some(&("recipe.source".to_string(), false))
    );
    assert!(!fx.source_dir().exists());
}
