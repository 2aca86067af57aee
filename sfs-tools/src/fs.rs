use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{format_err, Error};

/// Atomically replace the contents of `path` by writing to a sibling temp
/// file and renaming it over the target. A crash can never leave a torn
/// file behind.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp_path = tmp_sibling(path);

    let mut file = File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create temp file {tmp_path:?} - {err}"))?;

    let result = (|| {
        file.write_all(data)?;
        if fsync {
            file.sync_all()?;
        }
        Ok::<_, std::io::Error>(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(format_err!("unable to write {tmp_path:?} - {err}"));
    }

    std::fs::rename(&tmp_path, path).map_err(|err| {
        let _ = std::fs::remove_file(&tmp_path);
        format_err!("unable to rename {tmp_path:?} to {path:?} - {err}")
    })?;

    Ok(())
}

/// Temp-file name next to `path` so the final rename stays on one file system.
pub fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(format!(".tmp_{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        replace_file(&path, b"first", false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        replace_file(&path, b"second", true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // no temp file left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
