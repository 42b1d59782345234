use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("failed to read {path}: {err}")]
    Read { err: std::io::Error, path: PathBuf },
}

/// Writes to a cgroup control file. The file is never created: control files
/// exist exactly when the kernel provides them, so a missing file is an error
/// worth surfacing as-is.
#[inline]
pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(
    path: P,
    data: T,
) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    let data = data.to_string();

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| WrappedIoError::Open {
            err,
            path: path.to_path_buf(),
        })?
        .write_all(data.as_bytes())
        .map_err(|err| WrappedIoError::Write {
            err,
            path: path.to_path_buf(),
            data,
        })?;

    Ok(())
}

#[inline]
pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String, WrappedIoError> {
    let path = path.as_ref();
    let mut content = String::new();

    fs::OpenOptions::new()
        .create(false)
        .read(true)
        .open(path)
        .map_err(|err| WrappedIoError::Open {
            err,
            path: path.to_path_buf(),
        })?
        .read_to_string(&mut content)
        .map_err(|err| WrappedIoError::Read {
            err,
            path: path.to_path_buf(),
        })?;

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("freezer.state");
        fs::write(&file, "").unwrap();

        write_cgroup_file(&file, "FROZEN").unwrap();
        assert_eq!(read_cgroup_file(&file).unwrap(), "FROZEN");
    }

    #[test]
    fn test_write_never_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");

        let err = write_cgroup_file(&missing, "FROZEN").unwrap_err();
        assert!(matches!(err, WrappedIoError::Open { .. }));
        assert!(!missing.exists());
    }
}
