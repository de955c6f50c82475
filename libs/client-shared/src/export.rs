//! Ingress-side export of the active mapping set.
//!
//! Overwritten on every poll cycle even when nothing changed: downstream
//! consumers use the file's mtime as a liveness signal and expire entries if
//! it stops moving.

use mnat_model::{Sg, sg_file};
use std::path::Path;

pub fn write_assignments(path: &Path, sgs: &[Sg]) {
    if let Err(e) = std::fs::write(path, sg_file::render(sgs)) {
        tracing::warn!(path = %path.display(), "Failed to write assignment export: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assigned.txt");

        write_assignments(&path, &["10.1.1.1,232.1.1.1".parse().unwrap()]);
        write_assignments(&path, &["10.1.1.1,232.1.1.2".parse().unwrap()]);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "10.1.1.1,232.1.1.2\n"
        );
    }
}
