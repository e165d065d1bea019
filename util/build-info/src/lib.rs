//! Build-time metadata for the orchestrator binary: crate version plus, when
//! available, the git commit it was built from.

use std::fmt;

/// Version information assembled at build time and printed in logs on startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
    pub code_name: Option<&'static str>,
    pub commit_describe: Option<&'static str>,
    pub commit_date: Option<&'static str>,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(name) = self.code_name {
            write!(f, " {}", name)?;
        }
        if let Some(commit) = self.commit_describe {
            write!(f, " ({})", commit)?;
        }
        Ok(())
    }
}

impl Version {
    pub fn long(&self) -> String {
        let mut s = self.to_string();
        if let Some(date) = self.commit_date {
            s.push_str(&format!(", built on {}", date));
        }
        s
    }
}

/// Constructs the [`Version`] for this build from `CARGO_PKG_*` and, if the
/// environment variables were exported by a build script, commit metadata.
/// The core does not ship a build script (no git dependency), so the commit
/// fields are populated only if the embedding binary sets them via `env!`.
pub fn get_version(
    major: u8,
    minor: u8,
    patch: u16,
    code_name: Option<&'static str>,
    commit_describe: Option<&'static str>,
    commit_date: Option<&'static str>,
) -> Version {
    Version {
        major,
        minor,
        patch,
        code_name,
        commit_describe,
        commit_date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_without_optional_fields() {
        let v = get_version(0, 1, 0, None, None, None);
        assert_eq!(v.to_string(), "0.1.0");
    }

    #[test]
    fn formats_with_code_name_and_commit() {
        let v = get_version(0, 1, 0, Some("orchestrator"), Some("abc1234"), Some("2026-01-01"));
        assert_eq!(v.to_string(), "0.1.0 orchestrator (abc1234)");
        assert_eq!(v.long(), "0.1.0 orchestrator (abc1234), built on 2026-01-01");
    }
}
