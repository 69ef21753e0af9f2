use crate::error::Result;
use std::fs;
use std::io;
use std::path::Path;

/// Replace `path` with whatever `write` produces, via a temp file in the same
/// directory that is fsynced and renamed over the destination. Readers see
/// either the old file or the new one.
pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<()>,
) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name.to_string_lossy()))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    // Dropping the temp file on any error above removes it.
    tmp.persist(path).map_err(|err| err.error)?;

    sync_dir_best_effort(parent);
    Ok(())
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;

        static REPORTED: OnceLock<()> = OnceLock::new();
        if let Err(err) = fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            if err.kind() != io::ErrorKind::NotFound && REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "disk_cache",
                    dir = %dir.display(),
                    error = %err,
                    "failed to sync cache directory"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

/// Create `dir` (and parents) with owner-only permissions on Unix.
pub(crate) fn create_private_dir_all(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;

        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Recursively delete `path` without following symlinks. A missing path is
/// not an error.
pub(crate) fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() {
        return remove_file_if_exists(path);
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err)
                if err
                    .io_error()
                    .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound) =>
            {
                continue;
            }
            Err(err) => return Err(io::Error::other(err)),
        };
        if entry.file_type().is_dir() {
            match fs::remove_dir(entry.path()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        } else {
            remove_file_if_exists(entry.path())?;
        }
    }
    Ok(())
}

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
