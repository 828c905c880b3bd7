use std::io::Read;
#[cfg(any(feature = "flate2", feature = "lzma-rs"))]
use std::io::Write;

#[cfg(feature = "flate2")]
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

#[cfg(feature = "lzma-rs")]
use lzma_rs::{xz_compress, xz_decompress};

#[cfg(feature = "ruzstd")]
use ruzstd::decoding::StreamingDecoder;
#[cfg(feature = "ruzstd")]
use ruzstd::encoding::{compress_to_vec, CompressionLevel};

use super::error::{Error, Result};
use super::superblock::Compressor;

/// Block compression capability used by the meta-data reader/writer and the data reader.
///
/// Implementations are stateless from the caller's point of view; either direction may fail
/// independently of the input size.
pub trait Compress {
    /// Compress a whole block. The caller decides whether the result is worth keeping.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress a whole block, producing at most `max_len` bytes.
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>>;
}

impl<C: Compress + ?Sized> Compress for &C {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).compress(data)
    }

    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        (**self).decompress(data, max_len)
    }
}

fn codec_error<E: std::fmt::Display>(e: E) -> Error {
    Error::Compression(e.to_string())
}

// Reads a decoder to the end, failing if it produces more than max_len bytes
fn read_bounded<R: Read>(r: R, max_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(max_len);
    r.take(max_len as u64 + 1).read_to_end(&mut out).map_err(codec_error)?;
    if out.len() > max_len {
        return Err(Error::Compression(format!("decompressed data exceeds {max_len} bytes")));
    }
    Ok(out)
}

impl Compress for Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            #[cfg(feature = "flate2")]
            Compressor::Gzip => {
                let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::best());
                enc.write_all(data).map_err(codec_error)?;
                enc.finish().map_err(codec_error)
            },
            #[cfg(feature = "lzma-rs")]
            Compressor::Xz => {
                let mut out = Vec::with_capacity(data.len());
                xz_compress(&mut &data[..], &mut out).map_err(codec_error)?;
                out.flush().map_err(codec_error)?;
                Ok(out)
            },
            #[cfg(feature = "ruzstd")]
            Compressor::Zstd => Ok(compress_to_vec(data, CompressionLevel::Fastest)),
            c => Err(Error::Unsupported(*c)),
        }
    }

    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        match self {
            Compressor::None => read_bounded(data, max_len),
            #[cfg(feature = "flate2")]
            Compressor::Gzip => read_bounded(ZlibDecoder::new(data), max_len),
            #[cfg(feature = "lzma-rs")]
            Compressor::Xz => {
                // The xz decompressor doesn't support incremental reading, so decode the whole
                // block and check the size afterwards.
                let mut out = Vec::with_capacity(max_len);
                xz_decompress(&mut &data[..], &mut out).map_err(codec_error)?;
                if out.len() > max_len {
                    return Err(Error::Compression(format!("decompressed data exceeds {max_len} bytes")));
                }
                Ok(out)
            },
            #[cfg(feature = "ruzstd")]
            Compressor::Zstd => {
                let dec = StreamingDecoder::new(data).map_err(codec_error)?;
                read_bounded(dec, max_len)
            },
            c => Err(Error::Unsupported(*c)),
        }
    }
}
