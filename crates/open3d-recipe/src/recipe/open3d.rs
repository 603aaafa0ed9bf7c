//! Open3D: a modern library for 3D data processing.

use crate::descriptor::{PackageDescriptor, SettingAxis, Settings, SourceRef, SubmoduleMode};
use crate::error::Result;
use crate::options::{EffectiveOptions, OptionDecl, OptionSet, OptionValue};
use crate::patcher::PatchOperation;
use crate::recipe::Recipe;
use crate::resolver::{Definitions, Requirement};

pub const SHARED: &str = "shared";
pub const WITH_VISUALIZATION: &str = "with_visualization";
pub const LIBREALSENSE: &str = "librealsense";

pub const TOP_CMAKELISTS: &str = "CMakeLists.txt";
pub const UTILITY_CMAKELISTS: &str = "src/Open3D/Utility/CMakeLists.txt";
pub const STUB_TARGET: &str = "src/Open3D/Utility/MathFiniteStub.cpp";

pub const STRICT_WARNINGS: &str = "-Wall -Werror";
pub const RELAXED_WARNINGS: &str = "-Wall";
pub const STUB_ANCHOR: &str = "Console.cpp";
pub const STUB_FILE_NAME: &str = "MathFiniteStub.cpp";

const STUB_SOURCE: &str = include_str!("../../assets/MathFiniteStub.cpp");

// Upstream tag 0.10.0 has a broken imgui integration; this master commit
// (2020-08-05) does not.
const PINNED_REVISION: &str = "125458ad2f0";

// Dependencies taken from the package manager instead of the vendored copies.
const PREBUILT_DEPENDENCY_FLAGS: [(&str, bool); 9] = [
    ("BUILD_CPP_EXAMPLES", false),
    ("BUILD_GOOGLETEST", false),
    ("BUILD_EIGEN3", false),
    ("EIGEN3_FOUND", true),
    ("BUILD_PYTHON_MODULE", false),
    ("BUILD_PYBIND11", true),
    ("BUILD_GLFW", false),
    ("GLFW3_FOUND", true),
    ("GLIBCXX_USE_CXX11_ABI", true),
];

#[derive(Debug)]
pub struct Open3dRecipe {
    descriptor: PackageDescriptor,
    options: OptionSet,
}

impl Open3dRecipe {
    pub fn new() -> Result<Self> {
        let descriptor = PackageDescriptor {
            name: "open3d".into(),
            version: "0.10.0".into(),
            license_ref: "https://github.com/intel-isl/Open3D/blob/master/LICENSE".into(),
            description: "Open3D: A Modern Library for 3D Data Processing http://www.open3d.org"
                .into(),
            homepage: "https://github.com/intel-isl/Open3D.git".into(),
            source: SourceRef {
                url: "https://github.com/intel-isl/Open3D.git".into(),
                revision: PINNED_REVISION.into(),
                subfolder: Some("open3d".into()),
                submodules: SubmoduleMode::Recursive,
            },
            settings: vec![
                SettingAxis::Os,
                SettingAxis::Compiler,
                SettingAxis::BuildType,
                SettingAxis::Arch,
            ],
            supported_os: vec!["Linux".into(), "Macos".into(), "Windows".into()],
        };
        let options = OptionSet::new(vec![
            OptionDecl::boolean(SHARED, true, "Build shared libraries"),
            OptionDecl::boolean(
                WITH_VISUALIZATION,
                false,
                "Build against the package manager's GLEW for the visualization module",
            ),
            OptionDecl::boolean(LIBREALSENSE, false, "Build the RealSense sensor support"),
        ])?;
        Ok(Self {
            descriptor,
            options,
        })
    }
}

pub fn glew_options(options: &EffectiveOptions) -> Vec<(&'static str, OptionValue)> {
    if options.flag(WITH_VISUALIZATION) && options.flag(SHARED) {
        vec![(SHARED, OptionValue::Bool(true))]
    } else {
        Vec::new()
    }
}

impl Recipe for Open3dRecipe {
    fn descriptor(&self) -> &PackageDescriptor {
        &self.descriptor
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn requirements(&self, options: &EffectiveOptions) -> Result<Vec<Requirement>> {
        let mut reqs = vec![
            Requirement::new("eigen", ">=3.3.7")?,
            Requirement::new("glfw", ">=3.3.2")?,
        ];
        if options.flag(WITH_VISUALIZATION) {
            let glew = glew_options(options)
                .into_iter()
                .fold(Requirement::new("glew", "=2.1.0")?, |req, (k, v)| {
                    req.with_option(k, v)
                });
            reqs.push(glew);
        }
        Ok(reqs)
    }

    fn definitions(&self, options: &EffectiveOptions, _settings: &Settings) -> Result<Definitions> {
        let mut defs = Definitions::new();
        defs.insert("BUILD_SHARED_LIBS".into(), options.flag(SHARED).into());
        for (name, value) in PREBUILT_DEPENDENCY_FLAGS {
            defs.insert(name.into(), value.into());
        }

        // Only switches Open3D from its bundled GLEW to ours; the
        // visualization module itself stays enabled either way.
        if options.flag(WITH_VISUALIZATION) {
            defs.insert("BUILD_GLEW".into(), false.into());
            defs.insert("GLEW_FOUND".into(), true.into());
        }

        defs.insert(
            "BUILD_LIBREALSENSE".into(),
            options.flag(LIBREALSENSE).into(),
        );
        Ok(defs)
    }

    fn patches(&self) -> Vec<PatchOperation> {
        vec![
            PatchOperation::Replace {
                id: "relax-werror".into(),
                target: TOP_CMAKELISTS.into(),
                find: STRICT_WARNINGS.into(),
                replace: RELAXED_WARNINGS.into(),
                occurrences: None,
                requires: None,
            },
            PatchOperation::Inject {
                id: "inject-math-finite-stub".into(),
                target: STUB_TARGET.into(),
                contents: STUB_SOURCE.into(),
            },
            PatchOperation::Replace {
                id: "compile-math-finite-stub".into(),
                target: UTILITY_CMAKELISTS.into(),
                find: STUB_ANCHOR.into(),
                replace: format!("{STUB_ANCHOR} {STUB_FILE_NAME}"),
                occurrences: Some(1),
                requires: Some(STUB_TARGET.into()),
            },
        ]
    }
}
