//! Byte sources feeding the transfer engine.
//!
//! A [`ByteSource`] is a description of a finite byte stream with a size known
//! up front: a raw image file, an Amiga ADF image or a synthetic run of zeros.
//! Nothing is held open until [`ByteSource::open`] is called, so the same
//! source can be opened again from the start for verification.
//!
//! Compressed images (`.gz`, `.xz`, `.zst`) are unpacked into a temporary file
//! first. The temporary file lives as long as the `ByteSource` does.
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::TransferError;
use crate::floppy::{AMIGA_ADF_1760K, AMIGA_ADF_880K, FloppyFormat};

/// What a [`ByteSource`] reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    ImageFile { path: PathBuf, size: u64 },
    /// Experimental: Amiga disk image, transferred byte for byte.
    AmigaAdf { path: PathBuf, size: u64 },
    ZeroFill { size: u64 },
}

#[derive(Debug)]
pub struct ByteSource {
    kind: SourceKind,
    warnings: Vec<String>,
    _temp: Option<TempPath>,
}

impl ByteSource {
    /// A raw image file, transferred as-is.
    pub fn image_file(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let size = image_len(&path)?;
        let mut warnings = Vec::new();
        if FloppyFormat::from_size(size).is_none() {
            warnings.push(format!(
                "image is {size} bytes, which is not a standard floppy size"
            ));
        }
        Ok(Self {
            kind: SourceKind::ImageFile { path, size },
            warnings,
            _temp: None,
        })
    }

    /// An Amiga ADF image. The size must match an ADF geometry.
    pub fn amiga_adf(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let size = image_len(&path)?;
        if !FloppyFormat::from_size(size).is_some_and(FloppyFormat::is_amiga) {
            return Err(TransferError::invalid(format!(
                "{} is {size} bytes; ADF images are {AMIGA_ADF_880K} or {AMIGA_ADF_1760K} bytes",
                path.display()
            )));
        }

        let mut warnings = vec![
            "ADF writing is experimental; many USB floppy drives only handle PC formats".to_string(),
        ];
        let mut signature = [0u8; 3];
        let has_dos = File::open(&path)
            .and_then(|mut f| f.read_exact(&mut signature))
            .map(|_| &signature == b"DOS")
            .unwrap_or(false);
        if !has_dos {
            warnings.push("image has no AmigaDOS boot block signature".to_string());
        }

        Ok(Self {
            kind: SourceKind::AmigaAdf { path, size },
            warnings,
            _temp: None,
        })
    }

    /// `size` zero bytes, generated without any I/O.
    pub fn zero_fill(size: u64) -> Self {
        Self {
            kind: SourceKind::ZeroFill { size },
            warnings: Vec::new(),
            _temp: None,
        }
    }

    /// Picks a source for an image path by its extension, unpacking
    /// compressed images into a temporary file first.
    ///
    /// `disk.adf` and `disk.adf.gz` become ADF sources; anything else is a raw
    /// image.
    pub fn from_image_path(path: &Path) -> Result<Self, TransferError> {
        if !path.is_file() {
            return Err(TransferError::invalid(format!(
                "{} is not a readable image file",
                path.display()
            )));
        }

        let temp = decompress_image(path).map_err(|e| TransferError::SourceIo {
            offset: 0,
            source: e,
        })?;
        let (data_path, inner_name) = match &temp {
            Some(temp_path) => (temp_path.to_path_buf(), path.with_extension("")),
            None => (path.to_path_buf(), path.to_path_buf()),
        };

        let mut source = if extension_of(&inner_name) == "adf" {
            Self::amiga_adf(data_path)?
        } else {
            Self::image_file(data_path)?
        };
        source._temp = temp;
        Ok(source)
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            SourceKind::ImageFile { size, .. }
            | SourceKind::AmigaAdf { size, .. }
            | SourceKind::ZeroFill { size } => size,
        }
    }

    /// Non-fatal observations about the source, surfaced as log lines when a
    /// job starts.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            SourceKind::ImageFile { path, size } => {
                format!("image {} ({size} bytes)", path.display())
            }
            SourceKind::AmigaAdf { path, size } => {
                format!("ADF image {} ({size} bytes)", path.display())
            }
            SourceKind::ZeroFill { size } => format!("zero fill ({size} bytes)"),
        }
    }

    /// Opens the source from its first byte.
    pub fn open(&self) -> io::Result<SourceReader> {
        let inner = match &self.kind {
            SourceKind::ImageFile { path, .. } | SourceKind::AmigaAdf { path, .. } => {
                ReaderKind::File(File::open(path)?)
            }
            SourceKind::ZeroFill { .. } => ReaderKind::Zero,
        };
        let size = self.size();
        Ok(SourceReader {
            inner,
            declared: size,
            remaining: size,
        })
    }
}

enum ReaderKind {
    File(File),
    Zero,
}

/// An open [`ByteSource`]. Dropping it closes the underlying file.
pub struct SourceReader {
    inner: ReaderKind,
    declared: u64,
    remaining: u64,
}

impl SourceReader {
    /// Fills up to `buf.len()` bytes. `Ok(0)` is end of stream.
    ///
    /// Never reads past the declared size. A file that ends before its
    /// declared size yields an `UnexpectedEof` error.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = std::cmp::min(buf.len() as u64, self.remaining) as usize;

        match &mut self.inner {
            ReaderKind::Zero => buf[..want].fill(0),
            ReaderKind::File(file) => {
                let mut filled = 0;
                while filled < want {
                    match file.read(&mut buf[filled..want]) {
                        Ok(0) => {
                            let got = self.declared - self.remaining + filled as u64;
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                format!(
                                    "image truncated: {got} of {} bytes available",
                                    self.declared
                                ),
                            ));
                        }
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        self.remaining -= want as u64;
        Ok(want)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Fills `buf` completely. `offset` is the position of `buf[0]` in the
    /// stream and is only used to report where a failure happened.
    pub(crate) fn fill(&mut self, buf: &mut [u8], offset: u64) -> Result<(), TransferError> {
        let mut filled = 0;
        while filled < buf.len() {
            let at = offset + filled as u64;
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(TransferError::ShortSource {
                        offset: at,
                        expected: self.declared,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(TransferError::ShortSource {
                        offset: at,
                        expected: self.declared,
                    });
                }
                Err(e) => return Err(TransferError::SourceIo { offset: at, source: e }),
            }
        }
        Ok(())
    }
}

fn image_len(path: &Path) -> Result<u64, TransferError> {
    let size = std::fs::metadata(path)
        .map_err(|e| TransferError::SourceIo {
            offset: 0,
            source: e,
        })?
        .len();
    if size == 0 {
        return Err(TransferError::invalid(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(size)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Unpacks a compressed image into a temporary file. Returns `None` for
/// images that are not compressed.
fn decompress_image(input_path: &Path) -> io::Result<Option<TempPath>> {
    let input_file = File::open(input_path)?;
    let mut reader: Box<dyn Read> = match extension_of(input_path).as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input_file))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input_file))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(input_file))?),
        _ => return Ok(None),
    };

    let mut temp_file = NamedTempFile::new()?;
    let total = {
        let mut writer = BufWriter::new(&mut temp_file);
        let total = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        total
    };
    debug!(path = %input_path.display(), bytes = total, "decompressed image");

    Ok(Some(temp_file.into_temp_path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    fn read_all(source: &ByteSource, chunk: usize) -> io::Result<Vec<u8>> {
        let mut reader = source.open()?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    #[test]
    fn zero_fill_yields_exact_size() {
        let source = ByteSource::zero_fill(10_000);
        let data = read_all(&source, 4096).unwrap();
        assert_eq!(data.len(), 10_000);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn image_file_reads_content_and_warns_on_odd_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, b"hello floppy").unwrap();

        let source = ByteSource::image_file(&path).unwrap();
        assert_eq!(source.size(), 12);
        assert_eq!(source.warnings().len(), 1);
        assert_eq!(read_all(&source, 5).unwrap(), b"hello floppy");
    }

    #[test]
    fn empty_image_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.img");
        std::fs::write(&path, b"").unwrap();

        let err = ByteSource::image_file(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidJob);
    }

    #[test]
    fn truncated_image_fails_with_unexpected_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shrink.img");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let source = ByteSource::image_file(&path).unwrap();

        std::fs::write(&path, vec![7u8; 1000]).unwrap();
        let err = read_all(&source, 512).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn adf_requires_adf_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game.adf");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        assert!(ByteSource::amiga_adf(&path).is_err());
        // A PC geometry is still not an ADF.
        std::fs::write(&path, vec![0u8; crate::floppy::FLOPPY_1440K as usize]).unwrap();
        assert!(ByteSource::amiga_adf(&path).is_err());

        let mut data = vec![0u8; AMIGA_ADF_880K as usize];
        data[..3].copy_from_slice(b"DOS");
        std::fs::write(&path, &data).unwrap();
        let source = ByteSource::amiga_adf(&path).unwrap();
        assert!(matches!(source.kind(), SourceKind::AmigaAdf { .. }));
        assert!(
            !source
                .warnings()
                .iter()
                .any(|w| w.contains("boot block"))
        );
    }

    #[test]
    fn gzip_image_is_unpacked_and_dispatched_by_inner_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workbench.adf.gz");
        let payload = vec![0xA5u8; AMIGA_ADF_880K as usize];
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&payload).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let source = ByteSource::from_image_path(&path).unwrap();
        assert_eq!(source.size(), AMIGA_ADF_880K);
        assert!(matches!(source.kind(), SourceKind::AmigaAdf { .. }));
        assert_eq!(read_all(&source, 65_536).unwrap(), payload);
    }
}
