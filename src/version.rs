//! Build and version information
//!
//! Branch, commit and summary can be stamped at build time through the
//! `FIDES_BRANCH`, `FIDES_COMMIT` and `FIDES_SUMMARY` environment variables.

use std::fmt;

/// Product name, also the first half of the outbound `User-Agent`
pub const NAME: &str = "fides";

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const BRANCH: Option<&str> = option_env!("FIDES_BRANCH");
const COMMIT: Option<&str> = option_env!("FIDES_COMMIT");
const SUMMARY: Option<&str> = option_env!("FIDES_SUMMARY");

/// Version details of the running binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersion {
    pub name: &'static str,
    pub version: &'static str,
    pub branch: &'static str,
    pub commit: &'static str,
    pub summary: String,
}

impl AppVersion {
    pub fn current() -> Self {
        Self {
            name: NAME,
            version: VERSION,
            branch: BRANCH.unwrap_or("dev"),
            commit: COMMIT.unwrap_or("dirty"),
            summary: SUMMARY
                .map(str::to_string)
                .unwrap_or_else(|| format!("v{}", VERSION)),
        }
    }

    /// `User-Agent` sent on every registry call, e.g. `fides/v0.1.0`
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.name, self.summary)
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name:    {}", self.name)?;
        writeln!(f, "version: {}", self.version)?;
        writeln!(f, "branch:  {}", self.branch)?;
        write!(f, "commit:  {}", self.commit)
    }
}
