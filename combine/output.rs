use crate::error::CombineError;
use crate::matrix::Matrix;
use flate2::Compression;
use flate2::write::GzEncoder;
use log::info;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes the combined matrix as gzip text:
///
/// ```text
/// <identity_label> <col_1> ... <col_N>
/// <row_label> <v_1> ... <v_N>
/// ```
///
/// Values carry exactly six digits after the decimal point. The stream is written
/// to a sibling temporary file and renamed into place once complete, so a failed
/// run never leaves a truncated output behind.
pub fn write_matrix(
    path: &Path,
    identity_label: &str,
    columns: &[String],
    rows: &[String],
    matrix: &Matrix,
) -> Result<(), CombineError> {
    debug_assert_eq!(columns.len(), matrix.ncols());
    debug_assert_eq!(rows.len(), matrix.nrows());
    info!("Writing gzipped output to {}", path.display());

    let temp_path = temp_path_for(path);
    let file = File::create(&temp_path).map_err(|source| CombineError::Create {
        path: path.to_path_buf(),
        source,
    })?;

    let write_result = (|| -> io::Result<()> {
        let mut writer = BufWriter::with_capacity(
            1 << 20,
            GzEncoder::new(file, Compression::default()),
        );
        write_body(&mut writer, identity_label, columns, rows, matrix)?;
        let encoder = writer.into_inner().map_err(|e| e.into_error())?;
        let file = encoder.finish()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(source) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(CombineError::Write {
            path: path.to_path_buf(),
            source,
        });
    }

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        CombineError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn write_body<W: Write>(
    writer: &mut W,
    identity_label: &str,
    columns: &[String],
    rows: &[String],
    matrix: &Matrix,
) -> io::Result<()> {
    writer.write_all(identity_label.as_bytes())?;
    for name in columns {
        writer.write_all(b" ")?;
        writer.write_all(name.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    for (r, label) in rows.iter().enumerate() {
        writer.write_all(label.as_bytes())?;
        for value in matrix.row(r) {
            write!(writer, " {value:.6}")?;
        }
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
