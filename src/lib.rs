//! # tarstream
//!
//! A lightweight library for sequential reading of tar archives, optionally
//! wrapped in a gzip envelope, through seekable byte streams.
//!
//! The archive is never materialized in memory: headers are decoded one
//! 512-byte block at a time and every entry's payload is exposed as a bounded
//! stream over the archive's own underlying stream.
//!
//! ## Features
//!
//! - A small [`Stream`] contract (read, absolute seek, tell, length, duplicate)
//!   with in-memory and file-backed implementations
//! - Transparent gzip decompression behind the same contract (requires the
//!   default `gzip` feature)
//! - ustar and legacy (pre-POSIX) tar headers, including the ustar filename
//!   prefix and the legacy "trailing slash means directory" convention
//! - Tolerance of zero padding blocks anywhere in the archive, so
//!   concatenated tarballs enumerate as one
//! - Optional header checksum validation (on by default)
//!
//! ## Example
//!
//! ```rust,no_run
//! use tarstream::{EntryKind, FileStream, Stream, TarArchive};
//!
//! fn main() -> eyre::Result<()> {
//!     let mut archive = TarArchive::open(FileStream::open("data.tar.gz")?)?;
//!
//!     archive.enumerate();
//!     while let Some(entry) = archive.enum_next()? {
//!         println!("{} ({} bytes)", entry.filename, entry.size);
//!         if entry.kind == EntryKind::File {
//!             let mut stream = archive.open_current_entry();
//!             let contents = stream.read_to_vec()?;
//!             assert_eq!(Some(contents.len() as u64), stream.length());
//!         }
//!     }
//!
//!     // Or look a single file up by name.
//!     if let Some(data) = archive.read_entry("docs/README")? {
//!         println!("{}", String::from_utf8_lossy(&data));
//!     }
//!
//!     Ok(())
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "gzip")]
use eyre::eyre;
use eyre::{Report, Result, WrapErr};
#[cfg(feature = "gzip")]
use flate2::bufread::MultiGzDecoder;
#[cfg(feature = "gzip")]
use std::io::BufReader;
use tracing::{debug, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Size of a tar header block, and the alignment unit of entry payloads.
pub const BLOCK_SIZE: usize = 512;

/// gzip envelope signature: ID1, ID2 and the deflate compression method (RFC 1952).
pub const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Magic values marking a ustar (extended) header. GNU tar writes the first,
/// POSIX writers the second.
pub const USTAR_MAGICS: [&[u8; 6]; 2] = [b"ustar ", b"ustar\0"];

/// Default size of the compressed read-ahead buffer used by [`GzipStream`].
pub const DEFAULT_GZIP_BUFFER_SIZE: usize = 128 * 1024;

/// Upper bound on the buffer reserved up front by [`Stream::read_to_vec`].
pub const MAX_PREALLOC: u64 = 1 << 20;

/// Typeflag values this crate classifies. Everything else is [`EntryKind::Unknown`].
pub const TYPE_FILE: u8 = b'0';
pub const TYPE_HARDLINK: u8 = b'1';
pub const TYPE_SYMLINK: u8 = b'2';
pub const TYPE_CHARDEV: u8 = b'3';
pub const TYPE_BLOCKDEV: u8 = b'4';
pub const TYPE_DIRECTORY: u8 = b'5';
pub const TYPE_FIFO: u8 = b'6';

// ============================================================================
// Errors
// ============================================================================

/// Root causes produced by this crate.
///
/// Public functions return [`eyre::Result`]; use [`ArchiveError::find`] to
/// recover the typed cause from a report.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The input is neither a ustar archive nor a gzip envelope around one.
    #[error("not a tar archive")]
    NotTar,

    /// A header block could not be decoded.
    #[error("malformed tar header at offset {offset}: {reason}")]
    MalformedHeader { offset: u64, reason: &'static str },

    /// The stored header checksum does not match the header contents.
    #[error("tar header checksum mismatch at offset {offset}: stored {stored:#o}, computed {computed:#o}")]
    ChecksumMismatch {
        offset: u64,
        stored: u64,
        computed: u64,
    },

    /// A seek target lies beyond the end of the stream.
    #[error("seek to offset {offset} is out of range")]
    SeekOutOfRange { offset: u64 },

    /// The stream cannot produce an independent duplicate.
    #[error("stream does not support duplication")]
    DuplicateUnsupported,

    /// The decompression engine rejected the compressed bytes.
    #[error("gzip decode failed: {0}")]
    Decompression(#[source] io::Error),

    /// Reading from or repositioning the backing medium failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification of an [`ArchiveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input is not a recognized (optionally compressed) tar stream, or a
    /// header inside it is invalid.
    Format,
    /// Underlying read or seek failure, including out-of-range seeks.
    Io,
    /// Corrupt or truncated compressed data.
    Decompression,
    /// The requested operation is not supported by this stream kind.
    Unsupported,
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::NotTar
            | ArchiveError::MalformedHeader { .. }
            | ArchiveError::ChecksumMismatch { .. } => ErrorKind::Format,
            ArchiveError::SeekOutOfRange { .. } | ArchiveError::Io(_) => ErrorKind::Io,
            ArchiveError::Decompression(_) => ErrorKind::Decompression,
            ArchiveError::DuplicateUnsupported => ErrorKind::Unsupported,
        }
    }

    /// Find the first `ArchiveError` in a report's cause chain.
    pub fn find(report: &Report) -> Option<&ArchiveError> {
        report
            .chain()
            .find_map(|cause| cause.downcast_ref::<ArchiveError>())
    }
}

// ============================================================================
// Stream Trait
// ============================================================================

/// A seekable source of bytes.
///
/// Every layer of this crate both implements and consumes this trait: raw
/// sources ([`MemoryStream`], [`FileStream`]), the decompression adapter
/// ([`GzipStream`]) and the bounded per-entry view ([`TarEntryStream`]).
///
/// Dropping a stream releases everything it owns exclusively, including any
/// stream it wraps.
pub trait Stream {
    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Returns `Ok(0)` at the end of data and never reads past the logical
    /// end of the stream. A short read before the end is allowed only for
    /// raw sources; use [`Stream::fill`] to insist on a full buffer.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move the logical cursor to an absolute offset.
    ///
    /// Fails with [`ArchiveError::SeekOutOfRange`] when the offset lies past
    /// the end. No rollback is promised when a seek fails midway.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Current logical position.
    fn tell(&self) -> u64;

    /// Total logical size, or `None` when it cannot be known without
    /// decoding the whole stream.
    fn length(&self) -> Option<u64>;

    /// Produce a fully independent stream positioned identically.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::DuplicateUnsupported`] for stream kinds that
    /// cannot be duplicated.
    fn duplicate(&self) -> Result<Self>
    where
        Self: Sized;

    /// Read until `buf` is full or the stream ends. Returns the byte count.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read every remaining byte into a vector.
    fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let hint = self
            .length()
            .map(|len| len.saturating_sub(self.tell()))
            .unwrap_or(0);
        // Declared lengths come from untrusted headers.
        let hint = hint.min(MAX_PREALLOC);
        let mut out = Vec::with_capacity(usize::try_from(hint).unwrap_or(0));
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Adapts a [`Stream`] to `std::io::Read` and `std::io::Seek`.
///
/// Errors from the stream are surfaced as `io::Error`s; the original report
/// is kept and can be recovered with [`StreamReader::take_error`].
pub struct StreamReader<S> {
    inner: S,
    error: Option<Report>,
}

impl<S: Stream> StreamReader<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, error: None }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Take the report behind the most recent failed `read` or `seek`.
    pub fn take_error(&mut self) -> Option<Report> {
        self.error.take()
    }

    fn stash(&mut self, report: Report) -> io::Error {
        let err = io::Error::other(format!("{report:#}"));
        self.error = Some(report);
        err
    }
}

impl<S: Stream> io::Read for StreamReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|report| self.stash(report))
    }
}

impl<S: Stream> io::Seek for StreamReader<S> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::Current(delta) => self.inner.tell().checked_add_signed(delta),
            io::SeekFrom::End(delta) => match self.inner.length() {
                Some(len) => len.checked_add_signed(delta),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "stream length is unknown",
                    ));
                }
            },
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        self.inner
            .seek(target)
            .map_err(|report| self.stash(report))?;
        Ok(target)
    }
}

// ============================================================================
// Raw Streams
// ============================================================================

/// A stream over bytes held in memory.
///
/// Duplicates share the bytes but not the cursor.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    data: Arc<[u8]>,
    pos: u64,
}

impl MemoryStream {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl Stream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len();
        let start = usize::try_from(self.pos).map_or(len, |pos| pos.min(len));
        let n = buf.len().min(len - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.data.len() as u64 {
            return Err(ArchiveError::SeekOutOfRange { offset }.into());
        }
        self.pos = offset;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn duplicate(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

/// A stream over a file, read with positional I/O.
///
/// Each `FileStream` keeps its own cursor, so duplicates never disturb one
/// another even though they share the open file.
#[derive(Debug, Clone)]
pub struct FileStream {
    file: Arc<File>,
    len: u64,
    pos: u64,
}

impl FileStream {
    /// Open a file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(ArchiveError::from)
            .wrap_err_with(|| format!("opening {}", path.display()))?;
        Self::from_file(file)
    }

    /// Wrap an already open file. The stream starts at offset 0.
    pub fn from_file(file: File) -> Result<Self> {
        let len = file.metadata().map_err(ArchiveError::from)?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            pos: 0,
        })
    }
}

impl Stream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        let n = loop {
            match read_at(&self.file, &mut buf[..want], self.pos) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other.map_err(ArchiveError::from)?,
            }
        };
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len {
            return Err(ArchiveError::SeekOutOfRange { offset }.into());
        }
        self.pos = offset;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Option<u64> {
        Some(self.len)
    }

    fn duplicate(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(not(any(unix, windows)))]
fn read_at(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek};
    file.seek(io::SeekFrom::Start(offset))?;
    file.read(buf)
}

// ============================================================================
// Gzip Decompression
// ============================================================================

#[cfg(feature = "gzip")]
type Inflater<S> = MultiGzDecoder<BufReader<StreamReader<S>>>;

/// Check whether `header` starts with the gzip envelope signature.
pub fn is_gzip_magic(header: &[u8]) -> bool {
    header.starts_with(&GZIP_MAGIC)
}

/// A stream yielding the decompressed bytes of a gzip-wrapped origin stream.
///
/// Concatenated gzip members decode as one continuous stream.
///
/// # Seeking
///
/// Seeking forward decodes and discards bytes up to the target. Seeking
/// backward restarts decoding from the origin's offset 0 and then seeks
/// forward, so its cost is proportional to the target offset rather than the
/// distance moved.
///
/// # Errors
///
/// Once the decoder rejects the compressed data, every further read fails
/// until a backward seek restarts decoding.
#[cfg(feature = "gzip")]
pub struct GzipStream<S> {
    // `None` only while `rewind` swaps in a fresh decoder.
    dec: Option<Inflater<S>>,
    buffer_size: usize,
    position: u64,
    failed: bool,
}

#[cfg(feature = "gzip")]
impl<S: Stream> GzipStream<S> {
    /// Wrap `origin`, decoding from its current position.
    pub fn new(origin: S) -> Self {
        Self::with_capacity(origin, DEFAULT_GZIP_BUFFER_SIZE)
    }

    /// Like [`GzipStream::new`] with an explicit read-ahead buffer size.
    pub fn with_capacity(origin: S, buffer_size: usize) -> Self {
        Self {
            dec: Some(Self::inflater(origin, buffer_size)),
            buffer_size,
            position: 0,
            failed: false,
        }
    }

    fn inflater(origin: S, buffer_size: usize) -> Inflater<S> {
        MultiGzDecoder::new(BufReader::with_capacity(
            buffer_size.max(1),
            StreamReader::new(origin),
        ))
    }

    /// The wrapped origin stream.
    pub fn get_ref(&self) -> Result<&S> {
        self.dec
            .as_ref()
            .map(|dec| dec.get_ref().get_ref().get_ref())
            .ok_or_else(|| eyre!("gzip stream lost its origin"))
    }

    fn rewind(&mut self) -> Result<()> {
        debug!(from = self.position, "rewinding gzip stream to its start");
        let dec = self
            .dec
            .take()
            .ok_or_else(|| eyre!("gzip stream lost its origin"))?;
        let mut reader = dec.into_inner().into_inner();
        let rewound = reader.get_mut().seek(0);
        self.dec = Some(Self::inflater(reader.into_inner(), self.buffer_size));
        self.position = 0;
        self.failed = rewound.is_err();
        rewound.wrap_err("rewinding compressed origin stream")
    }

    fn skip_to(&mut self, offset: u64) -> Result<()> {
        let mut scratch = [0u8; 8192];
        while self.position < offset {
            let want = usize::try_from(offset - self.position)
                .unwrap_or(usize::MAX)
                .min(scratch.len());
            if Stream::read(self, &mut scratch[..want])? == 0 {
                return Err(ArchiveError::SeekOutOfRange { offset }.into());
            }
        }
        Ok(())
    }
}

#[cfg(feature = "gzip")]
impl<S: Stream> Stream for GzipStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.failed {
            return Err(ArchiveError::Decompression(io::Error::other(
                "stream is unusable after an earlier failure",
            ))
            .into());
        }
        let dec = self
            .dec
            .as_mut()
            .ok_or_else(|| eyre!("gzip stream lost its origin"))?;

        let mut total = 0;
        while total < buf.len() {
            match io::Read::read(dec, &mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.failed = true;
                    self.position += total as u64;
                    if let Some(origin_err) = dec.get_mut().get_mut().take_error() {
                        return Err(origin_err.wrap_err("reading compressed bytes"));
                    }
                    return Err(ArchiveError::Decompression(e).into());
                }
            }
        }
        self.position += total as u64;
        Ok(total)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset < self.position {
            self.rewind()?;
        }
        self.skip_to(offset)
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn length(&self) -> Option<u64> {
        None
    }

    /// Duplicate the origin, then decode a fresh copy up to this stream's
    /// position.
    fn duplicate(&self) -> Result<Self> {
        let mut origin = self.get_ref()?.duplicate()?;
        origin.seek(0)?;
        let mut dup = Self::with_capacity(origin, self.buffer_size);
        dup.skip_to(self.position)
            .wrap_err("fast-forwarding duplicated gzip stream")?;
        Ok(dup)
    }
}

// ============================================================================
// Header Layout
// ============================================================================

/// Location of a fixed-width field inside a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderField {
    pub offset: usize,
    pub len: usize,
}

impl HeaderField {
    pub const NAME: Self = Self::new(0, 100);
    pub const MODE: Self = Self::new(100, 8);
    pub const UID: Self = Self::new(108, 8);
    pub const GID: Self = Self::new(116, 8);
    pub const SIZE: Self = Self::new(124, 12);
    pub const MTIME: Self = Self::new(136, 12);
    pub const CHECKSUM: Self = Self::new(148, 8);
    pub const TYPEFLAG: Self = Self::new(156, 1);
    pub const LINKNAME: Self = Self::new(157, 100);
    pub const MAGIC: Self = Self::new(257, 6);
    pub const VERSION: Self = Self::new(263, 2);
    pub const UNAME: Self = Self::new(265, 32);
    pub const GNAME: Self = Self::new(297, 32);
    pub const DEVMAJOR: Self = Self::new(329, 8);
    pub const DEVMINOR: Self = Self::new(337, 8);
    pub const PREFIX: Self = Self::new(345, 155);

    const fn new(offset: usize, len: usize) -> Self {
        assert!(offset + len <= BLOCK_SIZE, "header field exceeds the block");
        Self { offset, len }
    }

    pub fn bytes(self, block: &[u8; BLOCK_SIZE]) -> &[u8] {
        &block[self.offset..self.offset + self.len]
    }

    /// Field contents up to the first NUL.
    pub fn text(self, block: &[u8; BLOCK_SIZE]) -> &[u8] {
        let bytes = self.bytes(block);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        &bytes[..end]
    }

    pub fn octal(self, block: &[u8; BLOCK_SIZE]) -> u64 {
        decode_octal(self.bytes(block))
    }

    fn contains(self, index: usize) -> bool {
        (self.offset..self.offset + self.len).contains(&index)
    }
}

/// Decode the leading run of ASCII octal digits in `field`.
///
/// Decoding stops at the first non-digit (NUL, space, ...). A field with no
/// leading digits decodes to 0.
pub fn decode_octal(field: &[u8]) -> u64 {
    let end = field
        .iter()
        .position(|b| !(b'0'..=b'7').contains(b))
        .unwrap_or(field.len());

    let mut value = 0u64;
    let mut multiplier = 1u64;
    for &digit in field[..end].iter().rev() {
        value = value.wrapping_add(u64::from(digit - b'0').wrapping_mul(multiplier));
        multiplier = multiplier.wrapping_mul(8);
    }
    value
}

/// Decode a size field: octal, or GNU base-256 when the high bit of the
/// first byte is set.
fn decode_size(field: &[u8]) -> std::result::Result<u64, &'static str> {
    match field.first() {
        Some(&first) if first & 0x80 != 0 => {
            if first & 0x40 != 0 {
                return Err("negative base-256 size");
            }
            let mut value = u64::from(first & 0x3f);
            for &byte in &field[1..] {
                value = value
                    .checked_mul(256)
                    .and_then(|v| v.checked_add(u64::from(byte)))
                    .ok_or("base-256 size overflows")?;
            }
            Ok(value)
        }
        _ => Ok(decode_octal(field)),
    }
}

/// Check whether a block carries the ustar magic at its fixed offset.
pub fn is_ustar_header(block: &[u8]) -> bool {
    let magic = HeaderField::MAGIC;
    block
        .get(magic.offset..magic.offset + magic.len)
        .is_some_and(|m| USTAR_MAGICS.iter().any(|&want| m == want))
}

/// Header sum with the checksum field counted as spaces, both unsigned and
/// as historic writers computed it with signed bytes.
fn header_checksums(block: &[u8; BLOCK_SIZE]) -> (u64, i64) {
    let mut unsigned = 0u64;
    let mut signed = 0i64;
    for (i, &byte) in block.iter().enumerate() {
        let byte = if HeaderField::CHECKSUM.contains(i) {
            b' '
        } else {
            byte
        };
        unsigned += u64::from(byte);
        signed += i64::from(byte as i8);
    }
    (unsigned, signed)
}

fn stored_checksum(block: &[u8; BLOCK_SIZE]) -> u64 {
    let field = HeaderField::CHECKSUM.bytes(block);
    let start = field.iter().take_while(|&&b| b == b' ').count();
    decode_octal(&field[start..])
}

/// Round `size` up to a whole number of blocks.
fn padded(size: u64) -> Option<u64> {
    let mask = BLOCK_SIZE as u64 - 1;
    size.checked_add(mask).map(|v| v & !mask)
}

// ============================================================================
// Data Structures
// ============================================================================

/// Classification of a tar entry.
///
/// Hardlinks, devices and FIFOs are all [`EntryKind::Unknown`]; inspect
/// [`TarEntry::typeflag`] to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Metadata of one tar entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// Path within the archive, with trailing slashes removed
    pub filename: String,

    pub kind: EntryKind,

    /// Permission bits from the mode field
    pub perms: u16,

    /// Payload size in bytes
    pub size: u64,

    /// Target path, present only for symlinks
    pub link_target: Option<String>,

    /// Raw typeflag byte as stored in the header
    pub typeflag: u8,
}

impl TarEntry {
    /// Decode a non-zero header block found at `offset`.
    pub fn parse(block: &[u8; BLOCK_SIZE], offset: u64) -> Result<Self> {
        let ustar = is_ustar_header(block);
        let perms = (HeaderField::MODE.octal(block) & 0xffff) as u16;
        let size = decode_size(HeaderField::SIZE.bytes(block))
            .map_err(|reason| ArchiveError::MalformedHeader { offset, reason })?;

        let mut name = Vec::with_capacity(HeaderField::PREFIX.len + HeaderField::NAME.len);
        if ustar {
            name.extend_from_slice(HeaderField::PREFIX.text(block));
        }
        name.extend_from_slice(HeaderField::NAME.text(block));

        let typeflag = block[HeaderField::TYPEFLAG.offset];
        // Some writers store NUL instead of '0' for regular files.
        let mut effective = if typeflag == 0 { TYPE_FILE } else { typeflag };

        if name.ends_with(b"/") {
            while name.ends_with(b"/") {
                name.pop();
            }
            // Pre-POSIX tar had no directory typeflag.
            if !ustar && effective == TYPE_FILE {
                effective = TYPE_DIRECTORY;
            }
        }

        let kind = match effective {
            TYPE_FILE => EntryKind::File,
            TYPE_DIRECTORY => EntryKind::Directory,
            TYPE_SYMLINK => EntryKind::Symlink,
            _ => EntryKind::Unknown,
        };
        let link_target = (kind == EntryKind::Symlink)
            .then(|| String::from_utf8_lossy(HeaderField::LINKNAME.text(block)).into_owned());

        Ok(Self {
            filename: String::from_utf8_lossy(&name).into_owned(),
            kind,
            perms,
            size,
            link_target,
            typeflag,
        })
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// Options controlling how an archive is opened and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TarOptions {
    /// Reject headers whose stored checksum does not match their contents
    pub verify_checksums: bool,

    /// Read-ahead buffer size for gzip-compressed archives
    pub gzip_buffer_size: usize,
}

impl Default for TarOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            gzip_buffer_size: DEFAULT_GZIP_BUFFER_SIZE,
        }
    }
}

impl TarOptions {
    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_gzip_buffer_size(mut self, size: usize) -> Self {
        self.gzip_buffer_size = size;
        self
    }
}

/// The stream an archive decodes: either the input itself or a decompressing
/// wrapper around it.
pub enum TarInput<S> {
    Plain(S),
    #[cfg(feature = "gzip")]
    Gzip(GzipStream<S>),
}

impl<S: Stream> TarInput<S> {
    #[cfg_attr(not(feature = "gzip"), allow(unused_variables))]
    fn sniff(stream: S, signature: &[u8], options: &TarOptions) -> Self {
        #[cfg(feature = "gzip")]
        {
            if is_gzip_magic(signature) {
                debug!("gzip envelope detected");
                return TarInput::Gzip(GzipStream::with_capacity(
                    stream,
                    options.gzip_buffer_size,
                ));
            }
        }
        TarInput::Plain(stream)
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, TarInput::Plain(_))
    }
}

impl<S: Stream> Stream for TarInput<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            TarInput::Plain(s) => s.read(buf),
            #[cfg(feature = "gzip")]
            TarInput::Gzip(gz) => gz.read(buf),
        }
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        match self {
            TarInput::Plain(s) => s.seek(offset),
            #[cfg(feature = "gzip")]
            TarInput::Gzip(gz) => gz.seek(offset),
        }
    }

    fn tell(&self) -> u64 {
        match self {
            TarInput::Plain(s) => s.tell(),
            #[cfg(feature = "gzip")]
            TarInput::Gzip(gz) => gz.tell(),
        }
    }

    fn length(&self) -> Option<u64> {
        match self {
            TarInput::Plain(s) => s.length(),
            #[cfg(feature = "gzip")]
            TarInput::Gzip(gz) => gz.length(),
        }
    }

    fn duplicate(&self) -> Result<Self> {
        match self {
            TarInput::Plain(s) => s.duplicate().map(TarInput::Plain),
            #[cfg(feature = "gzip")]
            TarInput::Gzip(gz) => gz.duplicate().map(TarInput::Gzip),
        }
    }
}

/// Bounded view of the current entry's payload.
///
/// Reads and seeks go through the archive's underlying stream and never cross
/// the end of the entry. Only one entry stream may be open per archive;
/// dropping it frees the slot.
pub struct TarEntryStream<'a, S> {
    archive: &'a TarArchive<S>,
    data_offset: u64,
    size: u64,
    pos: u64,
}

impl<S: Stream> TarEntryStream<'_, S> {
    /// Absolute offset of the payload within the archive's decoded stream.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }
}

impl<S: Stream> Stream for TarEntryStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.size - self.pos;
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }

        let mut io = self.archive.io.borrow_mut();
        let absolute = self.data_offset + self.pos;
        if io.tell() != absolute {
            io.seek(absolute)?;
        }
        let n = io.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.size {
            return Err(ArchiveError::SeekOutOfRange { offset }.into());
        }
        self.archive
            .io
            .borrow_mut()
            .seek(self.data_offset + offset)?;
        self.pos = offset;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Option<u64> {
        Some(self.size)
    }

    fn duplicate(&self) -> Result<Self> {
        Err(ArchiveError::DuplicateUnsupported.into())
    }
}

impl<S: Stream> io::Read for TarEntryStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(io::Error::other)
    }
}

impl<S> Drop for TarEntryStream<'_, S> {
    fn drop(&mut self) {
        self.archive.entry_open.set(false);
    }
}

// ============================================================================
// Tar Reader
// ============================================================================

/// Sequential tar decoder over a plain or gzip-compressed stream.
///
/// Enumeration is cursor based: [`TarArchive::enumerate`] rewinds, each
/// [`TarArchive::enum_next`] decodes one entry, and
/// [`TarArchive::open_current_entry`] exposes that entry's payload.
///
/// # Panics
///
/// Enumerating while an entry stream is open, opening a second entry stream,
/// or opening an entry before one was enumerated are programming errors and
/// panic.
pub struct TarArchive<S> {
    io: RefCell<TarInput<S>>,
    options: TarOptions,
    next_header: u64,
    current: Option<TarEntry>,
    entry_open: Cell<bool>,
}

impl<S: Stream> TarArchive<S> {
    /// Open a tar archive with default options.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotTar`] if the stream, after optional gzip
    /// decoding, does not start with a ustar header block.
    pub fn open(stream: S) -> Result<Self> {
        Self::open_with(stream, TarOptions::default())
    }

    /// Open a tar archive, sniffing for a gzip envelope first.
    pub fn open_with(mut stream: S, options: TarOptions) -> Result<Self> {
        let mut signature = [0u8; 4];
        let n = stream
            .fill(&mut signature)
            .wrap_err("reading archive signature")?;
        stream
            .seek(0)
            .wrap_err("rewinding after signature sniff")?;
        if n < signature.len() {
            debug!(len = n, "rejecting input: too short");
            return Err(ArchiveError::NotTar.into());
        }

        let mut io = TarInput::sniff(stream, &signature, &options);

        let mut block = [0u8; BLOCK_SIZE];
        let n = match io.fill(&mut block) {
            Ok(n) => n,
            Err(report)
                if ArchiveError::find(&report).map(ArchiveError::kind)
                    == Some(ErrorKind::Decompression) =>
            {
                debug!(error = %report, "rejecting input: gzip envelope does not decode");
                return Err(ArchiveError::NotTar.into());
            }
            Err(report) => return Err(report.wrap_err("reading first tar header")),
        };
        io.seek(0).wrap_err("rewinding after tar header sniff")?;
        if n != BLOCK_SIZE || !is_ustar_header(&block) {
            debug!(
                compressed = io.is_compressed(),
                "rejecting input: no ustar signature"
            );
            return Err(ArchiveError::NotTar.into());
        }

        debug!(compressed = io.is_compressed(), "opened tar archive");
        Ok(Self {
            io: RefCell::new(io),
            options,
            next_header: 0,
            current: None,
            entry_open: Cell::new(false),
        })
    }

    /// Restart enumeration from the first header.
    pub fn enumerate(&mut self) {
        self.assert_no_open_entry("tar entry still open on new enumeration");
        self.next_header = 0;
        self.current = None;
    }

    /// Decode the next entry, or return `None` once the stream is exhausted.
    ///
    /// All-zero blocks are skipped wherever they appear, since concatenated
    /// archives carry end-of-archive padding in the middle.
    pub fn enum_next(&mut self) -> Result<Option<&TarEntry>> {
        self.assert_no_open_entry("tar entry still open on new enumeration");
        self.current = None;

        let io = self.io.get_mut();
        let mut header_offset = self.next_header;
        io.seek(header_offset)
            .wrap_err_with(|| format!("seeking to tar header at offset {header_offset}"))?;

        let mut block = [0u8; BLOCK_SIZE];
        loop {
            let n = io.fill(&mut block)?;
            let zeroes = block[..n].iter().all(|&b| b == 0);
            if n < BLOCK_SIZE {
                if zeroes {
                    trace!(offset = header_offset, "end of tar stream");
                    return Ok(None);
                }
                return Err(ArchiveError::MalformedHeader {
                    offset: header_offset,
                    reason: "truncated header block",
                }
                .into());
            }
            if !zeroes {
                break;
            }
            trace!(offset = header_offset, "skipping zero block");
            header_offset += BLOCK_SIZE as u64;
        }

        let stored = stored_checksum(&block);
        let (unsigned, signed) = header_checksums(&block);
        if stored != unsigned && i64::try_from(stored).ok() != Some(signed) {
            if self.options.verify_checksums {
                return Err(ArchiveError::ChecksumMismatch {
                    offset: header_offset,
                    stored,
                    computed: unsigned,
                }
                .into());
            }
            warn!(
                offset = header_offset,
                stored, computed = unsigned, "ignoring tar header checksum mismatch"
            );
        }

        let entry = TarEntry::parse(&block, header_offset)?;
        self.next_header = padded(entry.size)
            .and_then(|data| data.checked_add(BLOCK_SIZE as u64))
            .and_then(|len| header_offset.checked_add(len))
            .ok_or(ArchiveError::MalformedHeader {
                offset: header_offset,
                reason: "entry size overflows",
            })?;

        trace!(
            offset = header_offset,
            filename = %entry.filename,
            kind = ?entry.kind,
            size = entry.size,
            "tar entry"
        );
        Ok(Some(&*self.current.insert(entry)))
    }

    /// The entry decoded by the last [`TarArchive::enum_next`], if any.
    pub fn current_entry(&self) -> Option<&TarEntry> {
        self.current.as_ref()
    }

    /// Open a bounded stream over the current entry's payload.
    ///
    /// # Panics
    ///
    /// Panics if an entry stream is already open or no entry has been
    /// enumerated.
    pub fn open_current_entry(&self) -> TarEntryStream<'_, S> {
        // Enumerating the next header needs the shared cursor, so only one
        // entry stream can exist at a time.
        if self.entry_open.get() {
            panic!("BUG: tar entry double open");
        }
        let Some(entry) = self.current.as_ref() else {
            panic!("BUG: no current tar entry to open");
        };

        // `padded` cannot overflow here; enum_next already checked it.
        let data_len = padded(entry.size).unwrap_or(entry.size);
        self.entry_open.set(true);
        TarEntryStream {
            archive: self,
            data_offset: self.next_header - data_len,
            size: entry.size,
            pos: 0,
        }
    }

    /// Enumerate from the start and collect every entry.
    pub fn list_entries(&mut self) -> Result<Vec<TarEntry>> {
        self.enumerate();
        let mut entries = Vec::new();
        while let Some(entry) = self.enum_next()? {
            entries.push(entry.clone());
        }
        Ok(entries)
    }

    /// Find the first regular file named `name` and open it.
    ///
    /// Enumeration restarts from the beginning of the archive.
    pub fn open_path(&mut self, name: &str) -> Result<Option<TarEntryStream<'_, S>>> {
        self.enumerate();
        while let Some(entry) = self.enum_next()? {
            let found = entry.is_file() && entry.filename == name;
            if found {
                return Ok(Some(self.open_current_entry()));
            }
        }
        Ok(None)
    }

    /// Read the whole payload of the regular file named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive ends before the entry's declared size.
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(mut stream) = self.open_path(name)? else {
            return Ok(None);
        };
        let data = stream.read_to_vec()?;
        if data.len() as u64 != stream.size {
            return Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "entry '{name}' truncated: expected {} bytes, got {}",
                    stream.size,
                    data.len()
                ),
            ))
            .into());
        }
        Ok(Some(data))
    }

    pub fn options(&self) -> &TarOptions {
        &self.options
    }

    /// Close the archive and hand back its underlying stream.
    pub fn into_inner(self) -> TarInput<S> {
        self.io.into_inner()
    }

    #[track_caller]
    fn assert_no_open_entry(&self, what: &str) {
        if self.entry_open.get() {
            panic!("BUG: {what}");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
