use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tablevault_core::CompressionFormat;

const ZSTD_LEVEL: i32 = 3;

/// True for filenames the store treats as dumps.
pub fn is_dump_file(filename: &str) -> bool {
    filename.ends_with(".sql") || compression_for(filename).is_some()
}

/// Compressor implied by a dump filename's suffix.
pub fn compression_for(filename: &str) -> Option<CompressionFormat> {
    if filename.ends_with(".sql.gz") {
        Some(CompressionFormat::Gzip)
    } else if filename.ends_with(".sql.zst") {
        Some(CompressionFormat::Zstd)
    } else {
        None
    }
}

/// Streaming sink for dump text, compressing on the way to disk.
pub enum DumpWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
}

impl DumpWriter {
    pub fn create(path: &Path, compression: Option<CompressionFormat>) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create dump file: {}", path.display()))?;
        let file = BufWriter::new(file);
        let writer = match compression {
            None => DumpWriter::Plain(file),
            Some(CompressionFormat::Gzip) => DumpWriter::Gzip(GzEncoder::new(file, Compression::default())),
            Some(CompressionFormat::Zstd) => DumpWriter::Zstd(
                zstd::Encoder::new(file, ZSTD_LEVEL).context("initialize zstd encoder")?,
            ),
        };
        Ok(writer)
    }

    /// Writes compressor trailers and syncs the file to disk.
    pub fn finish(self) -> Result<()> {
        let mut file = match self {
            DumpWriter::Plain(w) => w,
            DumpWriter::Gzip(w) => w.finish().context("finish gzip stream")?,
            DumpWriter::Zstd(w) => w.finish().context("finish zstd stream")?,
        };
        file.flush().context("flush dump file")?;
        file.get_ref().sync_all().context("sync dump file")?;
        Ok(())
    }
}

impl Write for DumpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DumpWriter::Plain(w) => w.write(buf),
            DumpWriter::Gzip(w) => w.write(buf),
            DumpWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DumpWriter::Plain(w) => w.flush(),
            DumpWriter::Gzip(w) => w.flush(),
            DumpWriter::Zstd(w) => w.flush(),
        }
    }
}

/// Reads a whole dump back as text, undoing the given compression.
pub fn read_dump_text(path: &Path, compression: Option<CompressionFormat>) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open dump file: {}", path.display()))?;
    let mut reader: Box<dyn Read> = match compression {
        None => Box::new(BufReader::new(file)),
        Some(CompressionFormat::Gzip) => Box::new(GzDecoder::new(BufReader::new(file))),
        Some(CompressionFormat::Zstd) => {
            Box::new(zstd::Decoder::new(file).context("initialize zstd decoder")?)
        }
    };
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .with_context(|| format!("read dump file: {}", path.display()))?;
    Ok(text)
}
