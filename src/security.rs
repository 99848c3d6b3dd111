#![forbid(unsafe_code)]

//! Process and path guards shared by the library and the backend binary.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the backend is started as root. yt-dlp runs arbitrary
/// extractors against remote content, so it should never inherit root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}

/// True when `value` is exactly one normal path component, i.e. joining it
/// onto a directory can never escape that directory.
pub fn is_safe_path_segment(value: &str) -> bool {
    if value.is_empty() || value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn safe_segments_accept_plain_names() {
        assert!(is_safe_path_segment("0b6f1c2e-1d7a-4c55-9a0e-6ad2f0c1f6a1"));
        assert!(is_safe_path_segment("My_Video.mp4"));
    }

    #[test]
    fn safe_segments_reject_traversal() {
        for value in ["", ".", "..", "../x", "a/b", "/etc", r"a\b", "dir/"] {
            assert!(!is_safe_path_segment(value), "accepted {value:?}");
        }
    }
}
