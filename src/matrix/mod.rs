//! Build matrix: the declarative document and its expansion into targets.
//!
//! A [`MatrixDocument`] lists packages, platforms, CUDA versions and the
//! command templates to build each package. [`BuildMatrix::from_document`]
//! expands it into one [`BuildMatrixEntry`] per (package, platform, CUDA)
//! cell, rendering every template up front against a closed set of variables:
//!
//! | variable      | value                                           |
//! |---------------|-------------------------------------------------|
//! | `package`     | package name                                    |
//! | `branch`      | branch to build from (empty when unset)         |
//! | `os`, `arch`  | target platform parts                           |
//! | `platform`    | `<os>-<arch>`                                   |
//! | `subdir`      | conda subdirectory, e.g. `linux-64`             |
//! | `cuda`        | full CUDA version                               |
//! | `cuda_major`, `cuda_minor` | version components                 |
//! | `workdir`     | remote work directory of the target             |
//!
//! plus anything under `variables:` in the document. A `transmute:` section
//! appends a package conversion step to every target.

pub mod entry;
pub mod template;
pub mod transmute;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use entry::{slugify, BuildMatrixEntry, BuildStep, CudaVersion, Os, Platform};
pub use template::{Template, TemplateError};
pub use transmute::TransmuteDocument;

use crate::error::{Result, SisyphusError};
use crate::scheduler::policy::{ClassificationOverrides, ClassificationPolicy};

const BUILTIN_VARIABLES: &[&str] = &[
    "package",
    "branch",
    "os",
    "arch",
    "platform",
    "subdir",
    "cuda",
    "cuda_major",
    "cuda_minor",
    "workdir",
];

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("the matrix expands to zero targets")]
    NoTargets,

    #[error("package '{0}' has no build steps and the document defines no default steps")]
    NoSteps(String),

    #[error("invalid package name '{0}'")]
    InvalidPackage(String),

    #[error("{0}")]
    Platform(String),

    #[error("{0}")]
    Cuda(String),

    #[error("variable '{0}' shadows a built-in matrix variable")]
    ReservedVariable(String),

    #[error("package '{package}', step '{step}': {source}")]
    Template {
        package: String,
        step: String,
        #[source]
        source: TemplateError,
    },

    #[error("target '{0}' appears more than once")]
    DuplicateTarget(String),
}

/// Step as written in the document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    pub name: String,
    pub run: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageDocument {
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub platforms: Option<Vec<String>>,
    #[serde(default)]
    pub cuda: Option<Vec<String>>,
    /// Extra capability tags required on top of os/arch/cuda
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub classification: Option<ClassificationOverrides>,
    #[serde(default)]
    pub steps: Option<Vec<StepDocument>>,
}

/// Cells to drop from the cross product. Unset fields match anything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExcludeRule {
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub cuda: Option<String>,
}

impl ExcludeRule {
    fn matches(&self, package: &str, platform: &Platform, cuda: &CudaVersion) -> bool {
        self.package.as_deref().map_or(true, |p| p == package)
            && self
                .platform
                .as_deref()
                .map_or(true, |p| p == platform.to_string())
            && self.cuda.as_deref().map_or(true, |c| c == cuda.as_str())
    }
}

/// The build matrix document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixDocument {
    /// Remote top-level work directory; per-OS default when unset
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub cuda: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepDocument>,
    pub packages: Vec<PackageDocument>,
    #[serde(default)]
    pub exclude: Vec<ExcludeRule>,
    #[serde(default)]
    pub transmute: Option<TransmuteDocument>,
}

impl MatrixDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SisyphusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| SisyphusError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The expanded, validated set of build targets for one run.
#[derive(Debug, Clone)]
pub struct BuildMatrix {
    entries: Vec<Arc<BuildMatrixEntry>>,
}

impl BuildMatrix {
    /// Load and expand a matrix document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let doc = MatrixDocument::load(path)?;
        Ok(Self::from_document(&doc, &ClassificationPolicy::default())?)
    }

    pub fn from_document(
        doc: &MatrixDocument,
        defaults: &ClassificationPolicy,
    ) -> std::result::Result<Self, MatrixError> {
        if let Some(name) = doc
            .variables
            .keys()
            .find(|k| BUILTIN_VARIABLES.contains(&k.as_str()))
        {
            return Err(MatrixError::ReservedVariable(name.clone()));
        }
        let known: Vec<&str> = BUILTIN_VARIABLES
            .iter()
            .copied()
            .chain(doc.variables.keys().map(String::as_str))
            .collect();

        let transmute_dir = match &doc.transmute {
            Some(transmute) => {
                let dir = Template::parse(&transmute.dir)
                    .and_then(|t| t.validate(known.iter().copied()).map(|()| t))
                    .map_err(|source| MatrixError::Template {
                        package: String::new(),
                        step: transmute::STEP_NAME.to_string(),
                        source,
                    })?;
                Some((transmute, dir))
            }
            None => None,
        };

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for package in &doc.packages {
            if package.name.is_empty()
                || package.name.contains(|c: char| c.is_whitespace() || c == '/' || c == '\\')
            {
                return Err(MatrixError::InvalidPackage(package.name.clone()));
            }

            let steps = match &package.steps {
                Some(steps) if !steps.is_empty() => steps,
                _ if !doc.steps.is_empty() => &doc.steps,
                _ => return Err(MatrixError::NoSteps(package.name.clone())),
            };
            let templates = parse_steps(&package.name, steps, &known)?;

            let platforms = package.platforms.as_ref().unwrap_or(&doc.platforms);
            let platforms = platforms
                .iter()
                .map(|p| p.parse::<Platform>().map_err(MatrixError::Platform))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let cudas = package.cuda.as_ref().unwrap_or(&doc.cuda);
            let cudas = cudas
                .iter()
                .map(|c| c.parse::<CudaVersion>().map_err(MatrixError::Cuda))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let classification = match &package.classification {
                Some(overrides) => defaults.merged(overrides),
                None => defaults.clone(),
            };

            for platform in &platforms {
                for cuda in &cudas {
                    if doc
                        .exclude
                        .iter()
                        .any(|rule| rule.matches(&package.name, platform, cuda))
                    {
                        tracing::debug!(package = %package.name, %platform, %cuda, "Target excluded");
                        continue;
                    }

                    let key = BuildMatrixEntry::target_key(&package.name, platform, cuda);
                    if !seen.insert(key.clone()) {
                        return Err(MatrixError::DuplicateTarget(key));
                    }

                    let os = platform.os;
                    let workspace = doc
                        .workspace
                        .as_deref()
                        .unwrap_or_else(|| os.default_workspace());
                    let cell = format!("{}-cuda{}", platform, cuda);
                    let workdir = os.join_path(&[workspace, &package.name, &cell]);

                    let mut vars = doc.variables.clone();
                    vars.insert("package".into(), package.name.clone());
                    vars.insert("branch".into(), package.branch.clone().unwrap_or_default());
                    vars.insert("os".into(), os.to_string());
                    vars.insert("arch".into(), platform.arch.clone());
                    vars.insert("platform".into(), platform.to_string());
                    vars.insert("subdir".into(), platform.subdir());
                    vars.insert("cuda".into(), cuda.to_string());
                    vars.insert("cuda_major".into(), cuda.major().to_string());
                    vars.insert("cuda_minor".into(), cuda.minor().to_string());
                    vars.insert("workdir".into(), workdir.clone());

                    let mut steps = templates
                        .iter()
                        .map(|t| t.render(&package.name, &vars))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    if let Some((transmute, dir)) = &transmute_dir {
                        let dir = dir.render(&vars).map_err(|source| MatrixError::Template {
                            package: package.name.clone(),
                            step: transmute::STEP_NAME.to_string(),
                            source,
                        })?;
                        steps.push(transmute.step(os, &dir));
                    }

                    entries.push(Arc::new(BuildMatrixEntry {
                        key,
                        package: package.name.clone(),
                        branch: package.branch.clone(),
                        platform: platform.clone(),
                        cuda: cuda.clone(),
                        workdir,
                        steps,
                        required_tags: BuildMatrixEntry::capability_tags(
                            platform,
                            cuda,
                            package.tags.iter().cloned(),
                        ),
                        classification: classification.clone(),
                    }));
                }
            }
        }

        if entries.is_empty() {
            return Err(MatrixError::NoTargets);
        }
        Ok(Self { entries })
    }

    /// Build a matrix from already-resolved entries.
    pub fn from_entries(
        entries: Vec<BuildMatrixEntry>,
    ) -> std::result::Result<Self, MatrixError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.key.clone()) {
                return Err(MatrixError::DuplicateTarget(entry.key.clone()));
            }
            if entry.steps.is_empty() {
                return Err(MatrixError::NoSteps(entry.package.clone()));
            }
        }
        if entries.is_empty() {
            return Err(MatrixError::NoTargets);
        }
        Ok(Self {
            entries: entries.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn entries(&self) -> &[Arc<BuildMatrixEntry>] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&Arc<BuildMatrixEntry>> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct StepTemplate {
    name: String,
    command: Template,
    artifacts: Vec<Template>,
    timeout: Option<Duration>,
}

impl StepTemplate {
    fn render(
        &self,
        package: &str,
        vars: &BTreeMap<String, String>,
    ) -> std::result::Result<BuildStep, MatrixError> {
        let wrap = |source| MatrixError::Template {
            package: package.to_string(),
            step: self.name.clone(),
            source,
        };
        Ok(BuildStep {
            name: self.name.clone(),
            command: self.command.render(vars).map_err(wrap)?,
            artifacts: self
                .artifacts
                .iter()
                .map(|a| a.render(vars).map_err(wrap))
                .collect::<std::result::Result<_, _>>()?,
            timeout: self.timeout,
        })
    }
}

fn parse_steps(
    package: &str,
    steps: &[StepDocument],
    known: &[&str],
) -> std::result::Result<Vec<StepTemplate>, MatrixError> {
    steps
        .iter()
        .map(|step| {
            let wrap = |source| MatrixError::Template {
                package: package.to_string(),
                step: step.name.clone(),
                source,
            };
            let command = Template::parse(&step.run).map_err(wrap)?;
            command.validate(known.iter().copied()).map_err(wrap)?;
            let artifacts = step
                .artifacts
                .iter()
                .map(|a| {
                    let t = Template::parse(a).map_err(wrap)?;
                    t.validate(known.iter().copied()).map_err(wrap)?;
                    Ok(t)
                })
                .collect::<std::result::Result<Vec<_>, MatrixError>>()?;
            Ok(StepTemplate {
                name: step.name.clone(),
                command,
                artifacts,
                timeout: step.timeout_secs.map(Duration::from_secs),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> MatrixDocument {
        serde_yaml::from_str(yaml).unwrap()
    }

    const BASIC: &str = r#"
variables:
  channel: ai-staging
platforms: [linux-x86_64, windows-x86_64]
cuda: ["12.4", "11.8"]
steps:
  - name: build
    run: "conda build -c {channel} --croot {workdir}/build feedstock"
    timeout_secs: 3600
    artifacts: ["{workdir}/build/{subdir}/*.conda"]
packages:
  - name: numpy
  - name: pytorch
    branch: main
    tags: ["gpu:a100"]
    cuda: ["12.4"]
"#;

    #[test]
    fn expands_cross_product() {
        let matrix = BuildMatrix::from_document(&doc(BASIC), &ClassificationPolicy::default())
            .unwrap();
        // numpy: 2 platforms x 2 cuda, pytorch: 2 platforms x 1 cuda
        assert_eq!(matrix.len(), 6);
        assert!(matrix.get("numpy/linux-x86_64/cuda-11.8").is_some());
        assert!(matrix.get("pytorch/windows-x86_64/cuda-12.4").is_some());
        assert!(matrix.get("pytorch/windows-x86_64/cuda-11.8").is_none());
    }

    #[test]
    fn renders_commands_per_target() {
        let matrix = BuildMatrix::from_document(&doc(BASIC), &ClassificationPolicy::default())
            .unwrap();
        let entry = matrix.get("numpy/linux-x86_64/cuda-12.4").unwrap();
        assert_eq!(entry.workdir, "/tmp/sisyphus/numpy/linux-x86_64-cuda12.4");
        assert_eq!(
            entry.steps[0].command,
            "conda build -c ai-staging --croot /tmp/sisyphus/numpy/linux-x86_64-cuda12.4/build feedstock"
        );
        assert_eq!(
            entry.steps[0].artifacts,
            vec!["/tmp/sisyphus/numpy/linux-x86_64-cuda12.4/build/linux-64/*.conda".to_string()]
        );
        assert_eq!(entry.steps[0].timeout, Some(Duration::from_secs(3600)));

        let win = matrix.get("numpy/windows-x86_64/cuda-12.4").unwrap();
        assert_eq!(win.workdir, "\\sisyphus\\numpy\\windows-x86_64-cuda12.4");
    }

    #[test]
    fn entries_carry_capability_tags() {
        let matrix = BuildMatrix::from_document(&doc(BASIC), &ClassificationPolicy::default())
            .unwrap();
        let entry = matrix.get("pytorch/linux-x86_64/cuda-12.4").unwrap();
        assert!(entry.required_tags.contains("gpu:a100"));
        assert!(entry.required_tags.contains("os:linux"));
        assert!(entry.required_tags.contains("arch:x86_64"));
        assert!(entry.required_tags.contains("cuda:12.4"));
    }

    #[test]
    fn transmute_step_is_appended_to_every_target() {
        let mut d = doc(BASIC);
        d.transmute = Some(TransmuteDocument {
            dir: "{workdir}/build/{subdir}".to_string(),
            prefix: Some("conda activate sisyphus".to_string()),
            timeout_secs: None,
        });
        let matrix = BuildMatrix::from_document(&d, &ClassificationPolicy::default()).unwrap();
        for entry in matrix.entries() {
            assert_eq!(entry.steps.len(), 2);
            assert_eq!(entry.steps[1].name, "transmute");
        }

        let linux = matrix.get("numpy/linux-x86_64/cuda-12.4").unwrap();
        assert!(linux.steps[1].command.starts_with(
            "conda activate sisyphus && cd '/tmp/sisyphus/numpy/linux-x86_64-cuda12.4/build/linux-64'"
        ));
        let win = matrix.get("numpy/windows-x86_64/cuda-12.4").unwrap();
        assert_eq!(
            win.steps[1].artifacts[0],
            "\\sisyphus\\numpy\\windows-x86_64-cuda12.4\\build\\win-64\\*.conda"
        );
    }

    #[test]
    fn transmute_dir_with_unknown_placeholder_fails_fast() {
        let mut d = doc(BASIC);
        d.transmute = Some(TransmuteDocument {
            dir: "{pkgdir}".to_string(),
            prefix: None,
            timeout_secs: None,
        });
        let err = BuildMatrix::from_document(&d, &ClassificationPolicy::default()).unwrap_err();
        assert!(matches!(err, MatrixError::Template { ref step, .. } if step == "transmute"));
    }

    #[test]
    fn exclude_rules_drop_cells() {
        let mut d = doc(BASIC);
        d.exclude.push(ExcludeRule {
            package: Some("numpy".into()),
            platform: Some("windows-x86_64".into()),
            cuda: None,
        });
        let matrix = BuildMatrix::from_document(&d, &ClassificationPolicy::default()).unwrap();
        assert_eq!(matrix.len(), 4);
        assert!(matrix.get("numpy/windows-x86_64/cuda-12.4").is_none());
    }

    #[test]
    fn unknown_placeholder_fails_fast() {
        let d = doc(
            r#"
platforms: [linux-x86_64]
cuda: ["12.4"]
packages:
  - name: numpy
    steps:
      - name: build
        run: "make {target_triple}"
"#,
        );
        let err = BuildMatrix::from_document(&d, &ClassificationPolicy::default()).unwrap_err();
        match err {
            MatrixError::Template { package, step, source } => {
                assert_eq!(package, "numpy");
                assert_eq!(step, "build");
                assert_eq!(source, TemplateError::UnknownVariable("target_triple".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_placeholder_in_artifact_fails_fast() {
        let d = doc(
            r#"
platforms: [linux-x86_64]
cuda: ["12.4"]
packages:
  - name: numpy
    steps:
      - name: build
        run: "make"
        artifacts: ["{outdir}/*.conda"]
"#,
        );
        assert!(matches!(
            BuildMatrix::from_document(&d, &ClassificationPolicy::default()),
            Err(MatrixError::Template { .. })
        ));
    }

    #[test]
    fn duplicate_targets_rejected() {
        let d = doc(
            r#"
platforms: [linux-x86_64]
cuda: ["12.4"]
steps:
  - name: build
    run: make
packages:
  - name: numpy
  - name: numpy
"#,
        );
        assert!(matches!(
            BuildMatrix::from_document(&d, &ClassificationPolicy::default()),
            Err(MatrixError::DuplicateTarget(key)) if key == "numpy/linux-x86_64/cuda-12.4"
        ));
    }

    #[test]
    fn reserved_variable_rejected() {
        let mut d = doc(BASIC);
        d.variables.insert("cuda".into(), "10.2".into());
        assert!(matches!(
            BuildMatrix::from_document(&d, &ClassificationPolicy::default()),
            Err(MatrixError::ReservedVariable(name)) if name == "cuda"
        ));
    }

    #[test]
    fn missing_steps_rejected() {
        let d = doc(
            r#"
platforms: [linux-x86_64]
cuda: ["12.4"]
packages:
  - name: numpy
"#,
        );
        assert!(matches!(
            BuildMatrix::from_document(&d, &ClassificationPolicy::default()),
            Err(MatrixError::NoSteps(_))
        ));
    }

    #[test]
    fn empty_matrix_rejected() {
        let d = doc(
            r#"
platforms: []
cuda: ["12.4"]
steps:
  - name: build
    run: make
packages:
  - name: numpy
"#,
        );
        assert!(matches!(
            BuildMatrix::from_document(&d, &ClassificationPolicy::default()),
            Err(MatrixError::NoTargets)
        ));
    }

    #[test]
    fn invalid_platform_rejected() {
        let mut d = doc(BASIC);
        d.platforms.push("plan9-mips".into());
        assert!(matches!(
            BuildMatrix::from_document(&d, &ClassificationPolicy::default()),
            Err(MatrixError::Platform(_))
        ));
    }

    #[test]
    fn custom_workspace_is_used() {
        let mut d = doc(BASIC);
        d.workspace = Some("/scratch/builds/".into());
        let matrix = BuildMatrix::from_document(&d, &ClassificationPolicy::default()).unwrap();
        let entry = matrix.get("numpy/linux-x86_64/cuda-11.8").unwrap();
        assert_eq!(entry.workdir, "/scratch/builds/numpy/linux-x86_64-cuda11.8");
    }

    #[test]
    fn package_classification_overrides_merge() {
        let d = doc(
            r#"
platforms: [linux-x86_64]
cuda: ["12.4"]
steps:
  - name: build
    run: make
packages:
  - name: numpy
    classification:
      transient_exit_codes: [75]
  - name: scipy
"#,
        );
        let matrix = BuildMatrix::from_document(&d, &ClassificationPolicy::default()).unwrap();
        let numpy = matrix.get("numpy/linux-x86_64/cuda-12.4").unwrap();
        let scipy = matrix.get("scipy/linux-x86_64/cuda-12.4").unwrap();
        assert!(numpy.classification.is_transient_exit(75));
        assert!(!scipy.classification.is_transient_exit(75));
    }
}
