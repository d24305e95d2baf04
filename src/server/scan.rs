//! Directory scan: build the ordered replay queue for one target.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::ServerError;
use super::protocol::{SEGMENT_HEADER_LEN, SegmentHeader, SegmentState};

/// Prefix given to consumed segments when preservation is on instead of
/// deleting them.
pub const PRESERVED_PREFIX: &str = "~";

/// What to scan and how to treat what is found.
#[derive(Clone, Copy, Debug)]
pub struct ScanOptions<'a> {
    pub directory: &'a Path,
    /// Expected source identity; `None` accepts any.
    pub source_guid: Option<Uuid>,
    /// Target name used in verbose log lines.
    pub db_name: &'a str,
    pub verbose: bool,
    /// Consumed segments are renamed out of the way instead of deleted, and
    /// previously renamed ones are skipped.
    pub preserve_segments: bool,
    /// Delete segments the primary left in the FREE state. The driver does;
    /// read-only diagnostics must not.
    pub delete_free: bool,
}

impl ScanOptions<'_> {
    fn verbose(&self, message: impl FnOnce() -> String) {
        if self.verbose {
            tracing::info!(db = %self.db_name, "{}", message());
        }
    }
}

/// One replayable segment found by the scan.
#[derive(Clone, Debug)]
pub struct LogSegment {
    pub path: PathBuf,
    pub header: SegmentHeader,
    /// Exact header bytes seen during the scan; replay re-reads the header
    /// and requires byte-for-byte equality.
    pub(crate) raw_header: [u8; SEGMENT_HEADER_LEN],
}

impl LogSegment {
    /// Consume the segment file: delete it, or rename it out of the
    /// scanner's way when preservation is on.
    pub(crate) fn remove(&self, preserve: bool) -> Result<(), ServerError> {
        let io_err = |source| ServerError::Io {
            path: self.path.clone(),
            source,
        };

        if preserve {
            let name = self.path.file_name().unwrap_or_default();
            let mut preserved = std::ffi::OsString::from(PRESERVED_PREFIX);
            preserved.push(name);
            let renamed = self.path.with_file_name(preserved);
            fs::rename(&self.path, &renamed).map_err(io_err)
        } else {
            fs::remove_file(&self.path).map_err(io_err)
        }
    }
}

/// Sharing violations mean the primary still has the file open for writing;
/// the segment is skipped this pass and picked up on the next one.
pub(crate) fn is_sharing_violation(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock
    )
}

/// Enumerate the source directory and build the replay queue, sorted
/// ascending by segment sequence.
pub fn scan_directory(options: &ScanOptions<'_>) -> Result<Vec<LogSegment>, ServerError> {
    let dir_err = |source| ServerError::Io {
        path: options.directory.to_path_buf(),
        source,
    };

    let mut queue = Vec::new();

    for entry in fs::read_dir(options.directory).map_err(dir_err)? {
        let entry = entry.map_err(dir_err)?;
        let path = entry.path();

        let file_type = entry.file_type().map_err(dir_err)?;
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();

        if options.preserve_segments && name.starts_with(PRESERVED_PREFIX) {
            continue;
        }

        // The primary's in-progress files carry brace-and-dash names.
        if name.contains('{') && name.contains('}') && name.contains('-') {
            continue;
        }

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if is_sharing_violation(&err) => {
                options.verbose(|| {
                    format!("Skipping file ({}) due to sharing violation", path.display())
                });
                continue;
            }
            Err(source) => return Err(ServerError::Io { path, source }),
        };

        let file_size = file
            .metadata()
            .map_err(|source| ServerError::Io {
                path: path.clone(),
                source,
            })?
            .len();

        if file_size < SEGMENT_HEADER_LEN as u64 {
            options.verbose(|| {
                format!(
                    "Skipping file ({}) as being too small (at least {} bytes expected, {} bytes detected)",
                    path.display(),
                    SEGMENT_HEADER_LEN,
                    file_size
                )
            });
            continue;
        }

        let mut raw_header = [0u8; SEGMENT_HEADER_LEN];
        file.read_exact(&mut raw_header)
            .map_err(|source| ServerError::Io {
                path: path.clone(),
                source,
            })?;

        let header = match SegmentHeader::decode(&raw_header) {
            Ok(header) => header,
            Err(err) => {
                options.verbose(|| {
                    format!(
                        "Skipping file ({}) due to unknown format: {err}",
                        path.display()
                    )
                });
                continue;
            }
        };

        if file_size < u64::from(header.length) {
            options.verbose(|| {
                format!(
                    "Skipping file ({}) as being too small (at least {} bytes expected, {} bytes detected)",
                    path.display(),
                    header.length,
                    file_size
                )
            });
            continue;
        }

        if header.state == SegmentState::Free {
            if options.delete_free {
                options.verbose(|| {
                    format!(
                        "Deleting file ({}) due to incorrect state (expected either USED, FULL or ARCH, found FREE)",
                        path.display()
                    )
                });
                drop(file);
                fs::remove_file(&path).map_err(|source| ServerError::Io {
                    path: path.clone(),
                    source,
                })?;
            } else {
                options.verbose(|| {
                    format!(
                        "Skipping file ({}) due to incorrect state (found FREE)",
                        path.display()
                    )
                });
            }
            continue;
        }

        if let Some(expected) = options.source_guid {
            if header.guid != expected {
                options.verbose(|| {
                    format!(
                        "Skipping file ({}) due to GUID mismatch (found {})",
                        path.display(),
                        header.guid
                    )
                });
                continue;
            }
        }

        queue.push(LogSegment {
            path,
            header,
            raw_header,
        });
    }

    queue.sort_by_key(|segment| segment.header.sequence);
    Ok(queue)
}
