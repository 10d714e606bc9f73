use std::io::{self, BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::store::Snapshot;

/// Writes `snapshot` to `path` as a JSON object of
/// `key -> {count, min, max, mean}`, keys in sorted order.
///
/// The JSON goes to a temporary file next to `path` first and is renamed over
/// `path` only once it is complete, so a failed write never leaves something
/// that looks like a finished result.
pub fn write_json(snapshot: &Snapshot, path: &Path) -> Result<()> {
    let output_err = |source: io::Error| Error::Output {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(output_err)?;
    write_to(snapshot, BufWriter::new(tmp.as_file_mut())).map_err(|err| match err {
        WriteError::Serialize(err) => Error::Serialize(err),
        WriteError::Io(source) => output_err(source),
    })?;
    tmp.persist(path).map_err(|e| output_err(e.error))?;
    Ok(())
}

enum WriteError {
    Serialize(serde_json::Error),
    Io(io::Error),
}

/// Renders the whole document before touching `writer`, so encoding failures
/// and write failures stay apart.
fn write_to<W: Write>(
    snapshot: &Snapshot,
    mut writer: W,
) -> std::result::Result<(), WriteError> {
    let json = serde_json::to_vec(snapshot).map_err(WriteError::Serialize)?;
    writer.write_all(&json).map_err(WriteError::Io)?;
    writer.flush().map_err(WriteError::Io)
}
