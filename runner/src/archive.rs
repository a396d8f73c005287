use ignore::WalkBuilder;
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};
use zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to access {0}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Invalid zip archive")]
    Zip(#[from] ZipError),
    #[error("Archive entry {0:?} escapes the target directory")]
    IllegalPath(String),
    #[error("Failed to walk directory")]
    Walk(#[from] ignore::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |error| ArchiveError::Io(path.to_path_buf(), error)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_error(path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ArchiveError> {
    Ok(())
}

/// Extract `archive` into `dest`, entries pointing outside of `dest` are rejected
pub fn unpack(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(archive).map_err(io_error(archive))?;
    let mut zip = ZipArchive::new(file)?;

    fs::create_dir_all(dest).map_err(io_error(dest))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| ArchiveError::IllegalPath(entry.name().to_owned()))?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let mut out = File::create(&target).map_err(io_error(&target))?;
        io::copy(&mut entry, &mut out).map_err(io_error(&target))?;

        if let Some(mode) = entry.unix_mode().filter(|mode| mode & 0o777 != 0) {
            set_mode(&target, mode)?;
        }

        trace!(path = ?target, "Extracted");
    }

    debug!(archive = ?archive, dest = ?dest, entries = zip.len(), "Unpacked archive");

    Ok(zip.len())
}

/// Zip `dir` into `archive`, entries are stored below the name of `dir` itself (`7/output.txt`)
pub fn pack(dir: &Path, archive: &Path) -> Result<usize, ArchiveError> {
    let file = File::create(archive).map_err(io_error(archive))?;
    let mut writer = ZipWriter::new(file);
    let base = dir.parent().unwrap_or(dir);
    let mut counter = 0;

    // hidden and ignored files are results too
    for entry in WalkBuilder::new(dir).standard_filters(false).build() {
        let entry = entry?;
        let path = entry.path();
        let name = match path.strip_prefix(base) {
            Ok(relative) => relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;

            entry
                .metadata()
                .map(|metadata| metadata.permissions().mode())
                .unwrap_or(0o644)
        };
        #[cfg(not(unix))]
        let mode = 0o644;

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode);

        if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut source = File::open(path).map_err(io_error(path))?;
            io::copy(&mut source, &mut writer).map_err(io_error(path))?;
        }

        counter += 1;
    }

    writer.finish()?;
    debug!(dir = ?dir, archive = ?archive, entries = counter, "Packed directory");

    Ok(counter)
}
