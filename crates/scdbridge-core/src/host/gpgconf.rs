//! `gpgconf` queries.

use std::path::PathBuf;

use super::path::decode_gpgconf_path;
use super::{QueryError, run_output};

/// A gpgconf executable, local or on the host.
#[derive(Debug, Clone)]
pub struct GpgConf {
    program: String,
}

impl GpgConf {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Directory reported by `gpgconf --list-dirs` for `key`
    /// (e.g. `socketdir`, `homedir`).
    ///
    /// The value is returned in the namespace of the gpgconf that reported
    /// it; host paths still need translating.
    pub async fn resolve_directory(&self, key: &str) -> Result<String, QueryError> {
        let output = run_output(&self.program, &["--list-dirs"]).await?;
        self.lookup(&output, key)
    }

    /// Binary path of component `name` from the gpgconf component listing.
    pub async fn resolve_binary(&self, name: &str) -> Result<String, QueryError> {
        let output = run_output(&self.program, &[]).await?;
        self.lookup(&output, name)
    }

    /// Directory lookup for this machine's gpgconf, decoded into a path.
    pub async fn local_directory(&self, key: &str) -> Result<PathBuf, QueryError> {
        let raw = self.resolve_directory(key).await?;
        Ok(PathBuf::from(decode_gpgconf_path(&raw)))
    }

    fn lookup(&self, output: &str, key: &str) -> Result<String, QueryError> {
        parse_key(output, key).ok_or_else(|| QueryError::KeyNotFound {
            program: self.program.clone(),
            key: key.to_string(),
        })
    }
}

/// Find `key` in colon-separated gpgconf output.
///
/// Lines split into at most three fields and the last one is the value.
/// Colons inside values are percent-escaped by gpgconf.
pub fn parse_key(output: &str, key: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.splitn(3, ':').collect();
        match fields.as_slice() {
            [first, .., last] if *first == key => {
                Some((*last).trim_end_matches('\r').to_string())
            }
            _ => None,
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LIST_DIRS: &str = "sysconfdir:/etc/gnupg\n\
        bindir:/usr/bin\n\
        homedir:/home/u/.gnupg\n\
        socketdir:/run/user/1000/gnupg\n\
        agent-socket:/run/user/1000/gnupg/S.gpg-agent\n";

    const WINDOWS_COMPONENTS: &str = "gpg:OpenPGP:C%3a\\Program Files (x86)\\GnuPG\\bin\\gpg.exe\r\n\
        gpg-agent:Private Keys:C%3a\\Program Files (x86)\\GnuPG\\bin\\gpg-agent.exe\r\n\
        scdaemon:Smartcards:C%3a\\Program Files (x86)\\GnuPG\\bin\\scdaemon.exe\r\n";

    #[test]
    fn parses_list_dirs() {
        assert_eq!(
            parse_key(LIST_DIRS, "socketdir").as_deref(),
            Some("/run/user/1000/gnupg")
        );
        assert_eq!(
            parse_key(LIST_DIRS, "homedir").as_deref(),
            Some("/home/u/.gnupg")
        );
    }

    #[test]
    fn component_listing_takes_last_field() {
        let value = parse_key(WINDOWS_COMPONENTS, "scdaemon").unwrap();
        assert_eq!(value, "C%3a\\Program Files (x86)\\GnuPG\\bin\\scdaemon.exe");
        assert_eq!(
            decode_gpgconf_path(&value),
            "C:\\Program Files (x86)\\GnuPG\\bin\\scdaemon.exe"
        );
    }

    #[test]
    fn key_must_match_whole_first_field() {
        assert_eq!(parse_key(LIST_DIRS, "socket"), None);
        assert_eq!(
            parse_key(LIST_DIRS, "agent-socket").as_deref(),
            Some("/run/user/1000/gnupg/S.gpg-agent")
        );
        assert_eq!(parse_key("", "socketdir"), None);
    }

    #[test]
    fn lookup_reports_missing_key() {
        let gpgconf = GpgConf::new("gpgconf");
        let err = gpgconf.lookup(LIST_DIRS, "scdaemon").unwrap_err();
        assert!(matches!(err, QueryError::KeyNotFound { ref key, .. } if key == "scdaemon"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_directory_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("gpgconf");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ \"$1\" = --list-dirs ] || exit 1\necho 'socketdir:/tmp/gnupg%3ahere'\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let gpgconf = GpgConf::new(script.to_string_lossy());
        assert_eq!(
            gpgconf.resolve_directory("socketdir").await.unwrap(),
            "/tmp/gnupg%3ahere"
        );
        assert_eq!(
            gpgconf.local_directory("socketdir").await.unwrap(),
            PathBuf::from("/tmp/gnupg:here")
        );
    }
}
