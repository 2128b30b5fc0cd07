//! Kaldi-style tagged object streams.
//!
//! Every model and enrollment file is a sequence of tokens, integers,
//! vectors and matrices. Binary streams start with `\0B`; anything else is
//! read as text.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

const BINARY_HEADER: [u8; 2] = [0, b'B'];

/// Floating point element type of a serialized vector or matrix.
pub trait Real: Copy + Default + std::fmt::Display {
    const VECTOR_TOKEN: &'static str;
    const MATRIX_TOKEN: &'static str;
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Self;
    fn to_le_vec(self) -> Vec<u8>;
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Real for f32 {
    const VECTOR_TOKEN: &'static str = "FV";
    const MATRIX_TOKEN: &'static str = "FM";
    const SIZE: usize = 4;

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        f32::from_le_bytes(buf)
    }

    fn to_le_vec(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    const VECTOR_TOKEN: &'static str = "DV";
    const MATRIX_TOKEN: &'static str = "DM";
    const SIZE: usize = 8;

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        f64::from_le_bytes(buf)
    }

    fn to_le_vec(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Precision {
    Single,
    Double,
}

pub struct TaggedReader<R> {
    inner: R,
    binary: bool,
}

impl<R: BufRead> TaggedReader<R> {
    /// Sniffs the binary header and positions the reader on the first object.
    pub fn new(mut inner: R) -> Result<Self> {
        let binary = {
            let buf = inner.fill_buf()?;
            buf.starts_with(&BINARY_HEADER)
        };
        if binary {
            inner.consume(BINARY_HEADER.len());
        }
        Ok(Self { inner, binary })
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(());
            }
            let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
            let done = skip < buf.len();
            self.inner.consume(skip);
            if done {
                return Ok(());
            }
        }
    }

    fn read_word(&mut self) -> Result<String> {
        self.skip_whitespace()?;
        let mut word = Vec::new();
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let take = buf.iter().take_while(|b| !b.is_ascii_whitespace()).count();
            word.extend_from_slice(&buf[..take]);
            let done = take < buf.len();
            self.inner.consume(take);
            if done {
                break;
            }
        }
        if word.is_empty() {
            return Err(Error::Format("unexpected end of stream".into()));
        }
        String::from_utf8(word).map_err(|_| Error::Format("token is not valid UTF-8".into()))
    }

    /// Reads one token. In binary mode the single trailing space is consumed.
    pub fn read_token(&mut self) -> Result<String> {
        let word = self.read_word()?;
        if self.binary {
            let mut space = [0u8; 1];
            self.inner.read_exact(&mut space)?;
        }
        Ok(word)
    }

    pub fn expect_token(&mut self, expected: &str) -> Result<()> {
        let token = self.read_token()?;
        if token != expected {
            return Err(Error::Format(format!(
                "expected token {expected}, got {token}"
            )));
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        if self.binary {
            let mut size = [0u8; 1];
            self.inner.read_exact(&mut size)?;
            if size[0] != 4 {
                return Err(Error::Format(format!(
                    "expected a 4-byte integer, size marker is {}",
                    size[0]
                )));
            }
            let mut buf = [0u8; 4];
            self.inner.read_exact(&mut buf)?;
            Ok(i32::from_le_bytes(buf))
        } else {
            let word = self.read_word()?;
            word.parse()
                .map_err(|_| Error::Format(format!("expected an integer, got {word}")))
        }
    }

    fn read_count(&mut self, what: &str) -> Result<usize> {
        let value = self.read_i32()?;
        usize::try_from(value).map_err(|_| Error::Format(format!("negative {what}: {value}")))
    }

    fn read_binary_precision(&mut self, single: &str, double: &str) -> Result<Precision> {
        let token = self.read_token()?;
        if token == single {
            Ok(Precision::Single)
        } else if token == double {
            Ok(Precision::Double)
        } else {
            Err(Error::Format(format!(
                "expected {single} or {double}, got {token}"
            )))
        }
    }

    fn read_binary_values<T: Real>(&mut self, precision: Precision, len: usize) -> Result<Vec<T>> {
        let width = match precision {
            Precision::Single => 4,
            Precision::Double => 8,
        };
        let num_bytes = len
            .checked_mul(width)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::Format(format!("{len} values overflow the stream size")))?;
        // Bounded by what the stream actually holds, not by the header.
        let mut bytes = Vec::new();
        Read::take(&mut self.inner, num_bytes).read_to_end(&mut bytes)?;
        if bytes.len() as u64 != num_bytes {
            return Err(Error::Format(format!(
                "expected {len} values, stream ends after {} bytes",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(width)
            .map(|raw| match precision {
                Precision::Single => T::from_f64(f32::from_le_slice(raw) as f64),
                Precision::Double => T::from_f64(f64::from_le_slice(raw)),
            })
            .collect();
        Ok(values)
    }

    /// Reads the text between `[` and `]`, returned as lines of numbers.
    fn read_text_bracket<T: Real>(&mut self) -> Result<Vec<Vec<T>>> {
        let open = self.read_word()?;
        if open == "[]" {
            return Ok(Vec::new());
        }
        if open != "[" {
            return Err(Error::Format(format!("expected [, got {open}")));
        }
        let mut body = Vec::new();
        self.inner.read_until(b']', &mut body)?;
        if body.last() != Some(&b']') {
            return Err(Error::Format("unterminated [ ... ] block".into()));
        }
        body.pop();
        let body =
            String::from_utf8(body).map_err(|_| Error::Format("block is not valid UTF-8".into()))?;

        let mut rows = Vec::new();
        for line in body.lines() {
            let row = line
                .split_whitespace()
                .map(|word| {
                    word.parse::<f64>()
                        .map(T::from_f64)
                        .map_err(|_| Error::Format(format!("expected a number, got {word}")))
                })
                .collect::<Result<Vec<T>>>()?;
            if !row.is_empty() {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub fn read_vector<T: Real>(&mut self) -> Result<Array1<T>> {
        if self.binary {
            let precision = self.read_binary_precision("FV", "DV")?;
            let dim = self.read_count("vector dimension")?;
            let values = self.read_binary_values(precision, dim)?;
            Ok(Array1::from_vec(values))
        } else {
            let values: Vec<T> = self.read_text_bracket()?.into_iter().flatten().collect();
            Ok(Array1::from_vec(values))
        }
    }

    pub fn read_matrix<T: Real>(&mut self) -> Result<Array2<T>> {
        if self.binary {
            let precision = self.read_binary_precision("FM", "DM")?;
            let rows = self.read_count("matrix rows")?;
            let cols = self.read_count("matrix columns")?;
            let len = rows
                .checked_mul(cols)
                .ok_or_else(|| Error::Format(format!("matrix of {rows}x{cols} is too large")))?;
            let values = self.read_binary_values(precision, len)?;
            Array2::from_shape_vec((rows, cols), values)
                .map_err(|e| Error::Format(format!("matrix shape: {e}")))
        } else {
            let rows = self.read_text_bracket::<T>()?;
            let num_rows = rows.len();
            let num_cols = rows.first().map_or(0, Vec::len);
            if rows.iter().any(|row| row.len() != num_cols) {
                return Err(Error::Format("matrix rows have different lengths".into()));
            }
            let values: Vec<T> = rows.into_iter().flatten().collect();
            Array2::from_shape_vec((num_rows, num_cols), values)
                .map_err(|e| Error::Format(format!("matrix shape: {e}")))
        }
    }
}

pub struct TaggedWriter<W: Write> {
    inner: W,
    binary: bool,
}

impl<W: Write> TaggedWriter<W> {
    pub fn new(mut inner: W, binary: bool) -> Result<Self> {
        if binary {
            inner.write_all(&BINARY_HEADER)?;
        }
        Ok(Self { inner, binary })
    }

    pub fn write_token(&mut self, token: &str) -> Result<()> {
        write!(self.inner, "{token} ")?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        if self.binary {
            self.inner.write_all(&[4])?;
            self.inner.write_all(&value.to_le_bytes())?;
        } else {
            write!(self.inner, "{value} ")?;
        }
        Ok(())
    }

    fn write_count(&mut self, value: usize) -> Result<()> {
        let value = i32::try_from(value)
            .map_err(|_| Error::InvalidArgument(format!("{value} does not fit in an i32")))?;
        self.write_i32(value)
    }

    pub fn write_vector<T: Real>(&mut self, vector: ArrayView1<T>) -> Result<()> {
        if self.binary {
            self.write_token(T::VECTOR_TOKEN)?;
            self.write_count(vector.len())?;
            for &value in vector.iter() {
                self.inner.write_all(&value.to_le_vec())?;
            }
        } else {
            write!(self.inner, " [ ")?;
            for value in vector.iter() {
                write!(self.inner, "{value} ")?;
            }
            writeln!(self.inner, "]")?;
        }
        Ok(())
    }

    pub fn write_matrix<T: Real>(&mut self, matrix: ArrayView2<T>) -> Result<()> {
        if self.binary {
            self.write_token(T::MATRIX_TOKEN)?;
            self.write_count(matrix.nrows())?;
            self.write_count(matrix.ncols())?;
            for &value in matrix.iter() {
                self.inner.write_all(&value.to_le_vec())?;
            }
        } else {
            write!(self.inner, " [")?;
            for row in matrix.rows() {
                write!(self.inner, "\n  ")?;
                for value in row.iter() {
                    write!(self.inner, "{value} ")?;
                }
            }
            writeln!(self.inner, "]")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub fn open<P: AsRef<Path>>(path: P) -> Result<TaggedReader<BufReader<File>>> {
    TaggedReader::new(BufReader::new(File::open(path)?))
}

pub fn create<P: AsRef<Path>>(path: P, binary: bool) -> Result<TaggedWriter<BufWriter<File>>> {
    TaggedWriter::new(BufWriter::new(File::create(path)?), binary)
}

/// Writes a complete stream next to `path` and renames it into place, so
/// `path` holds either its old contents or the new ones.
pub fn replace<P, F>(path: P, binary: bool, write: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut TaggedWriter<BufWriter<File>>) -> Result<()>,
{
    let path = path.as_ref();
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let result = write_and_sync(&tmp_path, binary, write)
        .and_then(|()| std::fs::rename(&tmp_path, path).map_err(Error::from));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_sync<F>(path: &Path, binary: bool, write: F) -> Result<()>
where
    F: FnOnce(&mut TaggedWriter<BufWriter<File>>) -> Result<()>,
{
    let mut writer = create(path, binary)?;
    write(&mut writer)?;
    let file = writer
        .into_inner()
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

pub fn read_vector_file<T: Real, P: AsRef<Path>>(path: P) -> Result<Array1<T>> {
    open(path)?.read_vector()
}

pub fn read_matrix_file<T: Real, P: AsRef<Path>>(path: P) -> Result<Array2<T>> {
    open(path)?.read_matrix()
}

pub fn write_vector_file<T: Real, P: AsRef<Path>>(path: P, vector: ArrayView1<T>) -> Result<()> {
    let mut writer = create(path, true)?;
    writer.write_vector(vector)?;
    writer.flush()
}

pub fn write_matrix_file<T: Real, P: AsRef<Path>>(path: P, matrix: ArrayView2<T>) -> Result<()> {
    let mut writer = create(path, true)?;
    writer.write_matrix(matrix)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Cursor;

    fn reader(bytes: &[u8]) -> TaggedReader<Cursor<&[u8]>> {
        TaggedReader::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn binary_layout_matches_kaldi() {
        let mut writer = TaggedWriter::new(Vec::new(), true).unwrap();
        writer.write_token("<Tag>").unwrap();
        writer.write_i32(2).unwrap();
        writer.write_vector(array![1.5f32].view()).unwrap();
        let bytes = writer.into_inner();

        let mut expected = vec![0, b'B'];
        expected.extend_from_slice(b"<Tag> ");
        expected.extend_from_slice(&[4, 2, 0, 0, 0]);
        expected.extend_from_slice(b"FV ");
        expected.extend_from_slice(&[4, 1, 0, 0, 0]);
        expected.extend_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn text_stream_is_parsed() {
        let text = b"<Tag> 3 [ 1 2.5 -3 ]\n [\n  1 2 \n  3 4 ]\n</Tag> ";
        let mut r = reader(text);
        assert!(!r.is_binary());
        r.expect_token("<Tag>").unwrap();
        assert_eq!(r.read_i32().unwrap(), 3);
        assert_eq!(r.read_vector::<f64>().unwrap(), array![1.0, 2.5, -3.0]);
        assert_eq!(r.read_matrix::<f32>().unwrap(), array![[1.0, 2.0], [3.0, 4.0]]);
        r.expect_token("</Tag>").unwrap();
    }

    #[test]
    fn text_writer_round_trips() {
        let matrix = array![[0.1f64, -2.0, 3.25], [4.0, 5.5, 1e-7]];
        let vector = array![0.3f64, 1.0 / 3.0];
        let mut writer = TaggedWriter::new(Vec::new(), false).unwrap();
        writer.write_token("<M>").unwrap();
        writer.write_matrix(matrix.view()).unwrap();
        writer.write_vector(vector.view()).unwrap();
        let bytes = writer.into_inner();

        let mut r = reader(&bytes);
        r.expect_token("<M>").unwrap();
        assert_eq!(r.read_matrix::<f64>().unwrap(), matrix);
        assert_eq!(r.read_vector::<f64>().unwrap(), vector);
    }

    #[test]
    fn single_precision_widens_on_read() {
        let mut writer = TaggedWriter::new(Vec::new(), true).unwrap();
        writer.write_matrix(array![[0.5f32, 2.0]].view()).unwrap();
        let bytes = writer.into_inner();
        let matrix: Array2<f64> = reader(&bytes).read_matrix().unwrap();
        assert_eq!(matrix, array![[0.5, 2.0]]);
    }

    #[test]
    fn empty_vectors_are_allowed() {
        for binary in [true, false] {
            let mut writer = TaggedWriter::new(Vec::new(), binary).unwrap();
            writer.write_vector(Array1::<f64>::zeros(0).view()).unwrap();
            let bytes = writer.into_inner();
            assert_eq!(reader(&bytes).read_vector::<f64>().unwrap().len(), 0);
        }
    }

    #[test]
    fn wrong_token_is_an_error() {
        let mut writer = TaggedWriter::new(Vec::new(), true).unwrap();
        writer.write_token("<Plda>").unwrap();
        let bytes = writer.into_inner();
        let err = reader(&bytes).expect_token("<Other>").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    fn binary_header(token: &str, counts: &[i32]) -> Vec<u8> {
        let mut writer = TaggedWriter::new(Vec::new(), true).unwrap();
        writer.write_token(token).unwrap();
        for &count in counts {
            writer.write_i32(count).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn oversized_matrix_header_is_a_format_error() {
        let bytes = binary_header("DM", &[i32::MAX, i32::MAX]);
        let err = reader(&bytes).read_matrix::<f64>().unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn vector_longer_than_stream_is_a_format_error() {
        let mut bytes = binary_header("DV", &[i32::MAX]);
        bytes.extend_from_slice(&1.0f64.to_le_bytes());
        let err = reader(&bytes).read_vector::<f64>().unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn replace_keeps_old_contents_when_writing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        write_vector_file(&path, array![1.0f64, 2.0].view()).unwrap();

        let result = replace(&path, true, |writer| {
            writer.write_vector(array![9.0f64].view())?;
            Err(Error::InvalidArgument("interrupted".into()))
        });
        assert!(result.is_err());
        assert_eq!(read_vector_file::<f64, _>(&path).unwrap(), array![1.0, 2.0]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        replace(&path, true, |writer| writer.write_vector(array![3.0f64].view())).unwrap();
        assert_eq!(read_vector_file::<f64, _>(&path).unwrap(), array![3.0]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut writer = TaggedWriter::new(Vec::new(), true).unwrap();
        writer.write_vector(array![1.0f64, 2.0, 3.0].view()).unwrap();
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 4);
        assert!(reader(&bytes).read_vector::<f64>().is_err());
    }
}
