//! OS hosts-file rewriting for Host mode.
//!
//! Every line this proxy writes carries a `Chameleon-<endpoint>` remark, so
//! removal only touches our own entries.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::error::AppError;

const REMARK_TAG: &str = "Chameleon-";

pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn system() -> Self {
        #[cfg(target_os = "windows")]
        let path = PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts");
        #[cfg(not(target_os = "windows"))]
        let path = PathBuf::from("/etc/hosts");
        Self { path }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append a redirect line per endpoint. Requires elevation; failure
    /// aborts Host-mode startup.
    pub fn add_hosts(&self, hosts: &[String]) -> Result<(), AppError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| AppError::HostsWriteFailed(e.to_string()))?;
        for host in hosts {
            writeln!(file, "127.0.0.1\t{}\t# {}{}", host, REMARK_TAG, host)
                .map_err(|e| AppError::HostsWriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove every line containing the remark tag, leaving the rest intact.
    pub fn remove_hosts(&self) -> Result<(), AppError> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| AppError::HostsWriteFailed(e.to_string()))?;
        let kept: Vec<&str> = contents
            .lines()
            .filter(|line| !line.contains(REMARK_TAG))
            .collect();
        fs::write(&self.path, kept.join("\n") + "\n")
            .map_err(|e| AppError::HostsWriteFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_then_remove_restores_prior_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();

        let hosts = HostsFile::at(&path);
        hosts
            .add_hosts(&["api.anthropic.com".into(), "api.openai.com".into()])
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("127.0.0.1\tapi.anthropic.com\t# Chameleon-api.anthropic.com"));
        assert!(contents.contains("127.0.0.1\tapi.openai.com\t# Chameleon-api.openai.com"));
        assert!(contents.contains("localhost"));

        hosts.remove_hosts().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("Chameleon-"));
        assert!(contents.contains("localhost"));
    }

    #[test]
    fn remove_only_touches_tagged_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            "# comment\n127.0.0.1\tlocalhost\n127.0.0.1\tapi.x.com\t# Chameleon-api.x.com\n",
        )
        .unwrap();

        HostsFile::at(&path).remove_hosts().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "# comment\n127.0.0.1\tlocalhost\n");
    }

    #[test]
    fn missing_file_reports_hosts_write_failed() {
        let dir = TempDir::new().unwrap();
        let hosts = HostsFile::at(dir.path().join("missing"));
        let err = hosts.add_hosts(&["api.x.com".into()]).unwrap_err();
        assert!(matches!(err, AppError::HostsWriteFailed(_)));
    }
}
