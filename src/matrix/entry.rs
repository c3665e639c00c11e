use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::policy::ClassificationPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Windows,
    Macos,
}

impl Os {
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Windows => "windows",
            Os::Macos => "macos",
        }
    }

    pub fn separator(&self) -> char {
        match self {
            Os::Windows => '\\',
            Os::Linux | Os::Macos => '/',
        }
    }

    /// Top-level work directory used when the matrix does not set one. Must be
    /// a directory, not the root of a device.
    pub fn default_workspace(&self) -> &'static str {
        match self {
            Os::Windows => "\\sisyphus",
            Os::Linux | Os::Macos => "/tmp/sisyphus",
        }
    }

    /// Join path components with this OS's separator, collapsing repeats.
    pub fn join_path(&self, parts: &[&str]) -> String {
        let sep = self.separator();
        let mut out = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(part);
        }
        let mut cleaned = String::with_capacity(out.len());
        for c in out.chars() {
            if c == sep && cleaned.ends_with(sep) {
                continue;
            }
            cleaned.push(c);
        }
        cleaned
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Os {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Os::Linux),
            "windows" | "win" => Ok(Os::Windows),
            "macos" | "osx" | "darwin" => Ok(Os::Macos),
            other => Err(format!("unknown operating system '{}'", other)),
        }
    }
}

/// Operating system and CPU architecture of a build target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Platform {
    pub os: Os,
    pub arch: String,
}

impl Platform {
    pub fn new(os: Os, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }

    /// Conda platform subdirectory where built packages land.
    pub fn subdir(&self) -> String {
        match (self.os, self.arch.as_str()) {
            (Os::Linux, "x86_64") => "linux-64".to_string(),
            (Os::Windows, "x86_64") => "win-64".to_string(),
            (Os::Macos, "x86_64") => "osx-64".to_string(),
            (Os::Macos, "arm64") | (Os::Macos, "aarch64") => "osx-arm64".to_string(),
            (Os::Windows, arch) => format!("win-{}", arch),
            (Os::Macos, arch) => format!("osx-{}", arch),
            (Os::Linux, arch) => format!("linux-{}", arch),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = String;

    /// Parses `<os>-<arch>`, e.g. `linux-x86_64` or `windows-x86_64`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once('-')
            .ok_or_else(|| format!("platform '{}' is not of the form <os>-<arch>", s))?;
        let os: Os = os.parse()?;
        if arch.is_empty() || arch.contains(char::is_whitespace) {
            return Err(format!("platform '{}' has an invalid architecture", s));
        }
        Ok(Self::new(os, arch))
    }
}

/// A CUDA toolkit version such as `12.4` or `11.8.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CudaVersion {
    major: u32,
    minor: u32,
    raw: String,
}

impl CudaVersion {
    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for CudaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let mut parts = raw.split('.');
        let parse = |part: Option<&str>| -> Result<u32, String> {
            part.ok_or_else(|| format!("CUDA version '{}' needs major.minor", raw))?
                .parse::<u32>()
                .map_err(|_| format!("CUDA version '{}' is not numeric", raw))
        };
        let major = parse(parts.next())?;
        let minor = parse(parts.next())?;
        for patch in parts {
            patch
                .parse::<u32>()
                .map_err(|_| format!("CUDA version '{}' is not numeric", raw))?;
        }
        Ok(Self {
            major,
            minor,
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for CudaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for CudaVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// A resolved build step: the command is fully rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub name: String,
    pub command: String,
    /// Remote glob patterns that must match at least one file after the step
    pub artifacts: Vec<String>,
    pub timeout: Option<Duration>,
}

/// One cell of the build matrix. Immutable after construction.
#[derive(Debug, Clone)]
pub struct BuildMatrixEntry {
    /// `<package>/<os>-<arch>/cuda-<version>`, unique within a matrix
    pub key: String,
    pub package: String,
    pub branch: Option<String>,
    pub platform: Platform,
    pub cuda: CudaVersion,
    /// Remote work directory, wiped at the start of every attempt
    pub workdir: String,
    pub steps: Vec<BuildStep>,
    pub required_tags: BTreeSet<String>,
    pub classification: ClassificationPolicy,
}

impl BuildMatrixEntry {
    pub fn target_key(package: &str, platform: &Platform, cuda: &CudaVersion) -> String {
        format!("{}/{}/cuda-{}", package, platform, cuda)
    }

    /// Tags a host must carry to build this target.
    pub fn capability_tags(
        platform: &Platform,
        cuda: &CudaVersion,
        extra: impl IntoIterator<Item = String>,
    ) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = extra.into_iter().collect();
        tags.insert(format!("os:{}", platform.os));
        tags.insert(format!("arch:{}", platform.arch));
        tags.insert(format!("cuda:{}", cuda));
        tags
    }

    /// Key with path separators replaced, usable as a local directory name.
    pub fn slug(&self) -> String {
        slugify(&self.key)
    }
}

/// Replace everything but ASCII alphanumerics, `.` and `-` with `_`.
pub fn slugify(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_and_displays() {
        let p: Platform = "linux-x86_64".parse().unwrap();
        assert_eq!(p.os, Os::Linux);
        assert_eq!(p.arch, "x86_64");
        assert_eq!(p.to_string(), "linux-x86_64");

        let w: Platform = "windows-x86_64".parse().unwrap();
        assert_eq!(w.os, Os::Windows);

        assert!("linux".parse::<Platform>().is_err());
        assert!("beos-x86".parse::<Platform>().is_err());
        assert!("linux-".parse::<Platform>().is_err());
    }

    #[test]
    fn conda_subdirs() {
        assert_eq!(Platform::new(Os::Linux, "x86_64").subdir(), "linux-64");
        assert_eq!(Platform::new(Os::Linux, "aarch64").subdir(), "linux-aarch64");
        assert_eq!(Platform::new(Os::Windows, "x86_64").subdir(), "win-64");
        assert_eq!(Platform::new(Os::Macos, "arm64").subdir(), "osx-arm64");
    }

    #[test]
    fn cuda_version_parsing() {
        let v: CudaVersion = "12.4".parse().unwrap();
        assert_eq!((v.major(), v.minor()), (12, 4));
        assert_eq!(v.to_string(), "12.4");

        let v: CudaVersion = "11.8.0".parse().unwrap();
        assert_eq!((v.major(), v.minor()), (11, 8));
        assert_eq!(v.as_str(), "11.8.0");

        assert!("12".parse::<CudaVersion>().is_err());
        assert!("twelve.4".parse::<CudaVersion>().is_err());
        assert!("12.4.x".parse::<CudaVersion>().is_err());
    }

    #[test]
    fn join_path_collapses_separators() {
        assert_eq!(
            Os::Linux.join_path(&["/tmp/sisyphus/", "/numpy", "build"]),
            "/tmp/sisyphus/numpy/build"
        );
        assert_eq!(
            Os::Windows.join_path(&["\\sisyphus\\", "numpy"]),
            "\\sisyphus\\numpy"
        );
    }

    #[test]
    fn capability_tags_cover_platform_and_cuda() {
        let platform = Platform::new(Os::Linux, "x86_64");
        let cuda: CudaVersion = "12.4".parse().unwrap();
        let tags = BuildMatrixEntry::capability_tags(&platform, &cuda, vec!["gpu:a100".to_string()]);
        let expected: BTreeSet<String> = ["os:linux", "arch:x86_64", "cuda:12.4", "gpu:a100"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn target_key_format() {
        let platform = Platform::new(Os::Windows, "x86_64");
        let cuda: CudaVersion = "11.8".parse().unwrap();
        assert_eq!(
            BuildMatrixEntry::target_key("pytorch", &platform, &cuda),
            "pytorch/windows-x86_64/cuda-11.8"
        );
    }
}
