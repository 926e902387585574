//! Readers for the auxiliary `.bin` matrix format.
//!
//! Every auxiliary file (PQ codes, pivots, centroids, norms, sample
//! queries) is a row-major matrix prefixed by two little-endian `i32`
//! fields: row count, then column count.

use crate::distance::VectorElement;
use crate::error::{PqFlashError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Parsed `.bin` header.
#[derive(Debug)]
pub(crate) struct BinShape {
    pub rows: usize,
    pub cols: usize,
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PqFlashError::MissingFile(path.to_path_buf()),
        _ => PqFlashError::Io(e),
    })
}

fn read_header(file: &mut File, path: &Path) -> Result<BinShape> {
    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(|_| PqFlashError::FormatMismatch {
            file: path.display().to_string(),
            reason: "truncated bin header".to_string(),
        })?;
    let rows = i32::from_le_bytes(header[0..4].try_into().unwrap());
    let cols = i32::from_le_bytes(header[4..8].try_into().unwrap());
    if rows < 0 || cols < 0 {
        return Err(PqFlashError::FormatMismatch {
            file: path.display().to_string(),
            reason: format!("negative bin shape {rows}x{cols}"),
        });
    }
    Ok(BinShape {
        rows: rows as usize,
        cols: cols as usize,
    })
}

fn read_payload(file: &mut File, path: &Path, bytes: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; bytes];
    file.read_exact(&mut buf)
        .map_err(|_| PqFlashError::FormatMismatch {
            file: path.display().to_string(),
            reason: "bin payload shorter than its header claims".to_string(),
        })?;
    Ok(buf)
}

/// Read a whole `.bin` file of element type `E`.
pub(crate) fn read_bin<E: VectorElement>(path: &Path) -> Result<(BinShape, Vec<E>)> {
    let mut file = open(path)?;
    let (shape, data) = read_bin_section::<E>(&mut file, path)?;
    Ok((shape, data))
}

/// Read one `.bin` section from an already-open file. Files such as the PQ
/// pivot file concatenate several sections.
pub(crate) fn read_bin_section<E: VectorElement>(
    file: &mut File,
    path: &Path,
) -> Result<(BinShape, Vec<E>)> {
    let shape = read_header(file, path)?;
    let count = shape.rows * shape.cols;
    let raw = read_payload(file, path, count * E::BYTES)?;
    let mut data = Vec::with_capacity(count);
    for i in 0..count {
        data.push(E::read_le(&raw[i * E::BYTES..]));
    }
    Ok((shape, data))
}

/// Read a `.bin` section of `u32` values (chunk offset tables).
pub(crate) fn read_bin_section_u32(file: &mut File, path: &Path) -> Result<(BinShape, Vec<u32>)> {
    let shape = read_header(file, path)?;
    let count = shape.rows * shape.cols;
    let raw = read_payload(file, path, count * 4)?;
    let data = (0..count)
        .map(|i| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap()))
        .collect();
    Ok((shape, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_bin(path: &Path, rows: i32, cols: i32, payload: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(&rows.to_le_bytes()).unwrap();
        f.write_all(&cols.to_le_bytes()).unwrap();
        f.write_all(payload).unwrap();
    }

    #[test]
    fn test_read_f32_bin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        let payload: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        write_bin(&path, 2, 3, &payload);
        let (shape, data) = read_bin::<f32>(&path).unwrap();
        assert_eq!((shape.rows, shape.cols), (2, 3));
        assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_truncated_payload_is_format_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        write_bin(&path, 4, 4, &[0u8; 8]);
        let err = read_bin::<f32>(&path).unwrap_err();
        assert!(matches!(err, PqFlashError::FormatMismatch { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = read_bin::<u8>(Path::new("/no/such.bin")).unwrap_err();
        assert!(matches!(err, PqFlashError::MissingFile(_)));
    }
}
