//! Minimal reader/writer for the NumPy `.npy` array format.
//!
//! Only what embedding shards need is supported: little-endian float vectors
//! (`<f4`, `<f8`) as 1-D or 2-D C-order arrays, and integer identifier arrays
//! of any width as 0-D or 1-D arrays. Layout:
//!
//! ```text
//! \x93NUMPY | major u8 | minor u8 | header_len (u16 LE for v1, u32 LE for v2/v3)
//! header: ASCII python dict literal, space padded, '\n' terminated
//! data:   rows * cols little-endian scalars
//! ```

use std::io::{self, Write};

use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

/// Reasons an `.npy` buffer is rejected.
#[derive(Debug, Error)]
pub enum NpyError {
    /// File does not start with the `.npy` magic string.
    #[error("missing .npy magic prefix")]
    BadMagic,
    /// Unknown format version.
    #[error("unsupported .npy version {0}.{1}")]
    Version(u8, u8),
    /// Buffer ended early.
    #[error("truncated .npy data: {0}")]
    Truncated(&'static str),
    /// Header dictionary could not be parsed.
    #[error("malformed .npy header: {0}")]
    Header(String),
    /// Element type not supported for this array role.
    #[error("unsupported dtype {0}")]
    Dtype(String),
    /// Fortran-ordered arrays are not supported.
    #[error("fortran-ordered arrays are not supported")]
    FortranOrder,
    /// Array rank is wrong for this role.
    #[error("expected an array of rank <= {expected}, found shape {shape:?}")]
    Rank {
        /// Highest accepted rank.
        expected: usize,
        /// Shape found in the header.
        shape: Vec<usize>,
    },
    /// Identifier arrays cannot hold negative values.
    #[error("negative identifier {0}")]
    NegativeId(i64),
    /// Write-side IO failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A dense row-major float matrix decoded from `.npy`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    /// Row count.
    pub rows: usize,
    /// Column count (vector dimension).
    pub cols: usize,
    /// `rows * cols` values, row-major.
    pub values: Vec<f32>,
}

impl Matrix {
    /// Iterates over the rows as slices.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact(0) panics, and a zero-width matrix has no meaningful rows
        self.values.chunks_exact(self.cols.max(1)).take(self.rows)
    }
}

struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Decodes a float32/float64 vector array. A 1-D array is treated as one row.
pub fn read_matrix(bytes: &[u8]) -> Result<Matrix, NpyError> {
    let (header, data) = split_header(bytes)?;
    if header.fortran_order {
        return Err(NpyError::FortranOrder);
    }
    let (rows, cols) = match header.shape.as_slice() {
        [cols] => (1, *cols),
        [rows, cols] => (*rows, *cols),
        _ => {
            return Err(NpyError::Rank {
                expected: 2,
                shape: header.shape.clone(),
            })
        }
    };
    let count = rows
        .checked_mul(cols)
        .ok_or_else(|| NpyError::Header(format!("shape {rows}x{cols} overflows")))?;
    let values = match header.descr.as_str() {
        "<f4" | "=f4" => decode::<4, f32>(data, count, f32::from_le_bytes)?,
        "<f8" | "=f8" => decode::<8, f64>(data, count, f64::from_le_bytes)?
            .into_iter()
            .map(|v| v as f32)
            .collect(),
        other => return Err(NpyError::Dtype(other.to_string())),
    };
    Ok(Matrix { rows, cols, values })
}

/// Decodes a 0-D or 1-D integer identifier array.
pub fn read_ids(bytes: &[u8]) -> Result<Vec<u64>, NpyError> {
    let (header, data) = split_header(bytes)?;
    let count = match header.shape.as_slice() {
        [] => 1,
        [n] => *n,
        _ => {
            return Err(NpyError::Rank {
                expected: 1,
                shape: header.shape.clone(),
            })
        }
    };
    let signed: Vec<i64> = match header.descr.trim_start_matches(['<', '=', '|']) {
        "i1" => decode::<1, i8>(data, count, i8::from_le_bytes)?
            .into_iter()
            .map(i64::from)
            .collect(),
        "i2" => decode::<2, i16>(data, count, i16::from_le_bytes)?
            .into_iter()
            .map(i64::from)
            .collect(),
        "i4" => decode::<4, i32>(data, count, i32::from_le_bytes)?
            .into_iter()
            .map(i64::from)
            .collect(),
        "i8" => decode::<8, i64>(data, count, i64::from_le_bytes)?,
        "u1" => return Ok(data_as_u64::<1, u8>(data, count, u8::from_le_bytes)?),
        "u2" => return Ok(data_as_u64::<2, u16>(data, count, u16::from_le_bytes)?),
        "u4" => return Ok(data_as_u64::<4, u32>(data, count, u32::from_le_bytes)?),
        "u8" => return decode::<8, u64>(data, count, u64::from_le_bytes),
        _ => return Err(NpyError::Dtype(header.descr.clone())),
    };
    signed
        .into_iter()
        .map(|v| u64::try_from(v).map_err(|_| NpyError::NegativeId(v)))
        .collect()
}

/// Encodes a row-major float32 matrix as a v1.0 `.npy` file.
pub fn write_matrix<W: Write>(
    writer: &mut W,
    rows: usize,
    cols: usize,
    values: &[f32],
) -> Result<(), NpyError> {
    if rows.checked_mul(cols) != Some(values.len()) {
        return Err(NpyError::Header(format!(
            "{} values do not fill a {rows}x{cols} matrix",
            values.len()
        )));
    }
    write_header(writer, "<f4", &format!("({rows}, {cols})"))?;
    for value in values {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Encodes identifiers as a 1-D int64 `.npy` file.
pub fn write_ids<W: Write>(writer: &mut W, ids: &[u64]) -> Result<(), NpyError> {
    write_header(writer, "<i8", &format!("({},)", ids.len()))?;
    for id in ids {
        let signed = i64::try_from(*id)
            .map_err(|_| NpyError::Header(format!("identifier {id} exceeds int64")))?;
        writer.write_all(&signed.to_le_bytes())?;
    }
    Ok(())
}

fn write_header<W: Write>(writer: &mut W, descr: &str, shape: &str) -> Result<(), NpyError> {
    let mut dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
    // magic(6) + version(2) + len(2) + dict + '\n' must be 64-byte aligned
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');
    let len = u16::try_from(dict.len())
        .map_err(|_| NpyError::Header("header exceeds 65535 bytes".to_string()))?;
    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;
    Ok(())
}

fn split_header(bytes: &[u8]) -> Result<(Header, &[u8]), NpyError> {
    if bytes.len() < MAGIC.len() + 2 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(NpyError::BadMagic);
    }
    let major = bytes[6];
    let minor = bytes[7];
    let (header_len, header_start) = match major {
        1 => {
            let raw = bytes.get(8..10).ok_or(NpyError::Truncated("header length"))?;
            (usize::from(u16::from_le_bytes([raw[0], raw[1]])), 10)
        }
        2 | 3 => {
            let raw = bytes.get(8..12).ok_or(NpyError::Truncated("header length"))?;
            let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            (len as usize, 12)
        }
        _ => return Err(NpyError::Version(major, minor)),
    };
    let header_end = header_start + header_len;
    let raw_header = bytes
        .get(header_start..header_end)
        .ok_or(NpyError::Truncated("header"))?;
    let text = std::str::from_utf8(raw_header)
        .map_err(|err| NpyError::Header(format!("header is not utf-8: {err}")))?;
    Ok((parse_header(text)?, &bytes[header_end..]))
}

fn parse_header(text: &str) -> Result<Header, NpyError> {
    let descr = dict_value(text, "descr")?
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    let fortran_order = match dict_value(text, "fortran_order")?.trim() {
        "True" => true,
        "False" => false,
        other => return Err(NpyError::Header(format!("fortran_order={other}"))),
    };
    let shape_raw = dict_value(text, "shape")?;
    let inner = shape_raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| NpyError::Header(format!("shape={shape_raw}")))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::Header(format!("shape component {part}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

/// Returns the raw text of `key`'s value inside the header dict literal.
fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let needle_single = format!("'{key}'");
    let needle_double = format!("\"{key}\"");
    let start = text
        .find(&needle_single)
        .map(|pos| pos + needle_single.len())
        .or_else(|| text.find(&needle_double).map(|pos| pos + needle_double.len()))
        .ok_or_else(|| NpyError::Header(format!("missing key {key}")))?;
    let rest = text[start..]
        .trim_start()
        .strip_prefix(':')
        .ok_or_else(|| NpyError::Header(format!("missing ':' after {key}")))?
        .trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')').map(|pos| pos + 1)
    } else {
        rest.find([',', '}'])
    }
    .ok_or_else(|| NpyError::Header(format!("unterminated value for {key}")))?;
    Ok(&rest[..end])
}

fn decode<const N: usize, T>(
    data: &[u8],
    count: usize,
    from_le: fn([u8; N]) -> T,
) -> Result<Vec<T>, NpyError> {
    let needed = count
        .checked_mul(N)
        .ok_or(NpyError::Truncated("element count overflows"))?;
    let payload = data.get(..needed).ok_or(NpyError::Truncated("array data"))?;
    Ok(payload
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            from_le(buf)
        })
        .collect())
}

fn data_as_u64<const N: usize, T: Into<u64>>(
    data: &[u8],
    count: usize,
    from_le: fn([u8; N]) -> T,
) -> Result<Vec<u64>, NpyError> {
    Ok(decode::<N, T>(data, count, from_le)?
        .into_iter()
        .map(Into::into)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode_matrix(rows: usize, cols: usize, values: &[f32]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_matrix(&mut buf, rows, cols, values).expect("encode");
        buf
    }

    #[test]
    fn header_is_64_byte_aligned() {
        let buf = encode_matrix(2, 3, &[0.0; 6]);
        let header_len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(buf.len(), 10 + header_len + 6 * 4);
    }

    #[test]
    fn reads_back_matrix_and_ids() {
        let buf = encode_matrix(2, 2, &[1.0, 0.0, 0.25, 0.75]);
        let matrix = read_matrix(&buf).expect("decode");
        assert_eq!(matrix.rows, 2);
        assert_eq!(matrix.cols, 2);
        assert_eq!(matrix.rows().nth(1).unwrap(), &[0.25, 0.75]);

        let mut ids = Vec::new();
        write_ids(&mut ids, &[7, 42]).unwrap();
        assert_eq!(read_ids(&ids).unwrap(), vec![7, 42]);
    }

    #[test]
    fn parses_numpy_written_headers() {
        // numpy >= 1.x writes this exact layout for np.save(np.arange(3, dtype=np.int32))
        let dict = "{'descr': '<i4', 'fortran_order': False, 'shape': (3,), }";
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[1, 0]);
        let padded = format!("{dict:<117}\n");
        buf.extend_from_slice(&(padded.len() as u16).to_le_bytes());
        buf.extend_from_slice(padded.as_bytes());
        for v in [0i32, 1, 2] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(read_ids(&buf).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn one_dimensional_vector_is_a_single_row() {
        let mut buf = Vec::new();
        write_header(&mut buf, "<f8", "(3,)").unwrap();
        for v in [1.0f64, 2.0, 3.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        let matrix = read_matrix(&buf).unwrap();
        assert_eq!((matrix.rows, matrix.cols), (1, 3));
        assert_eq!(matrix.values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(matches!(read_matrix(b"not numpy"), Err(NpyError::BadMagic)));

        let mut truncated = encode_matrix(4, 4, &[0.5; 16]);
        truncated.truncate(truncated.len() - 3);
        assert!(matches!(read_matrix(&truncated), Err(NpyError::Truncated(_))));

        let mut negative = Vec::new();
        write_header(&mut negative, "<i8", "(1,)").unwrap();
        negative.extend_from_slice(&(-5i64).to_le_bytes());
        assert!(matches!(read_ids(&negative), Err(NpyError::NegativeId(-5))));

        let mut huge = Vec::new();
        write_header(&mut huge, "<f4", &format!("({}, 2)", usize::MAX)).unwrap();
        match read_matrix(&huge) {
            Err(NpyError::Header(message)) => assert!(message.contains("overflows")),
            other => panic!("expected overflow error, got {other:?}"),
        }

        let mut ints = Vec::new();
        write_header(&mut ints, "<i4", "(2, 2)").unwrap();
        ints.extend_from_slice(&[0u8; 16]);
        assert!(matches!(read_matrix(&ints), Err(NpyError::Dtype(_))));
    }
}
