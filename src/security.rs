#![forbid(unsafe_code)]

//! Guards shared by the grabtube binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

use crate::extractor::ExtractorError;

/// Refuses to start as root. The backend spawns an external tool on behalf
/// of remote callers and writes into the download directory, so it must run
/// under an unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}

/// Accepts only absolute `http`/`https` URLs with a host.
///
/// Source URLs end up on the extraction tool's command line, so anything that
/// could be read as an option (`-o`, `--exec`) or a local path is rejected
/// before a process is spawned.
pub fn validate_source_url(raw: &str) -> Result<Url, ExtractorError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ExtractorError::InvalidUrl("url is required".into()));
    }
    if trimmed.starts_with('-') {
        return Err(ExtractorError::InvalidUrl(trimmed.to_owned()));
    }
    let parsed =
        Url::parse(trimmed).map_err(|err| ExtractorError::InvalidUrl(format!("{trimmed}: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractorError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ExtractorError::InvalidUrl(format!("{trimmed}: missing host")));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        assert!(ensure_not_root_for(Uid::from_raw(1000), "backend").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let err = ensure_not_root_for(Uid::from_raw(0), "backend").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn validate_source_url_accepts_web_urls() {
        let url = validate_source_url("  https://www.youtube.com/watch?v=abc ").unwrap();
        assert_eq!(url.host_str(), Some("www.youtube.com"));
        assert!(validate_source_url("http://example.com/clip.mp4").is_ok());
    }

    #[test]
    fn validate_source_url_rejects_options_and_local_paths() {
        for raw in [
            "",
            "   ",
            "--exec=rm",
            "-o/tmp/x",
            "file:///etc/passwd",
            "/etc/passwd",
            "ftp://example.com/a",
            "not a url",
        ] {
            assert!(
                matches!(
                    validate_source_url(raw),
                    Err(ExtractorError::InvalidUrl(_))
                ),
                "{raw:?} should be rejected"
            );
        }
    }
}
