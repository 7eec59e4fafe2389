//! Build and API server version information

use k8s_openapi::apimachinery::pkg::version::Info;
use std::fmt;

/// First Kubernetes minor release serving `apiextensions.k8s.io/v1`
const MIN_CRD_V1_MINOR: u32 = 16;

/// Information baked in at build time
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub branch: &'static str,
    pub build_time: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            commit: option_env!("DGRAPH_OPERATOR_COMMIT").unwrap_or("unknown"),
            branch: option_env!("DGRAPH_OPERATOR_BRANCH").unwrap_or("unknown"),
            build_time: option_env!("DGRAPH_OPERATOR_BUILD_TIME").unwrap_or("unknown"),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dgraph Operator")?;
        writeln!(f, "Version    : {}", self.version)?;
        writeln!(f, "Commit SHA : {}", self.commit)?;
        writeln!(f, "Branch     : {}", self.branch)?;
        write!(f, "Build time : {}", self.build_time)
    }
}

/// Leading digits of a version component; providers report e.g. `"16+"`
fn leading_number(value: &str) -> Option<u32> {
    let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Whether the API server can serve a `v1` CustomResourceDefinition
pub fn supports_crd_v1(info: &Info) -> bool {
    match (leading_number(&info.major), leading_number(&info.minor)) {
        (Some(major), _) if major > 1 => true,
        (Some(1), Some(minor)) => minor >= MIN_CRD_V1_MINOR,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(major: &str, minor: &str) -> Info {
        Info {
            major: major.to_string(),
            minor: minor.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_supports_crd_v1() {
        assert!(supports_crd_v1(&info("1", "16")));
        assert!(supports_crd_v1(&info("1", "30")));
        assert!(supports_crd_v1(&info("1", "21+")));
        assert!(!supports_crd_v1(&info("1", "15")));
        assert!(!supports_crd_v1(&info("", "")));
    }

    #[test]
    fn test_build_info_display() {
        let text = BuildInfo::current().to_string();
        assert!(text.contains(env!("CARGO_PKG_VERSION")));
        assert!(text.contains("Commit SHA"));
    }
}
