//! # Output Codec
//!
//! Drives the tar writer and the optional compression layer beneath it.
//!
//! ## Key Features:
//! - **Suffix sniffing**: `auto` maps the output file suffix to a codec
//!   (`.tgz` → gzip, `.tbz2` → bzip2, `.txz` → xz, `.tzst` → zstd); an
//!   unnamed or unrecognized destination stays uncompressed.
//! - **Streaming codecs**: gzip/bzip2/xz/zstd wrap the destination as
//!   streaming writers beneath one `tar::Builder`.
//! - **Zopfli recompression**: generates the uncompressed tar into memory
//!   and recompresses the complete buffer on finish. Gzip-compatible output
//!   at the cost of holding the whole archive in memory.
//! - **PAX emission**: `atime`/`ctime` (and fractional `mtime`) travel as
//!   PAX extended headers ahead of each member.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::entry::{Member, MemberKind};
use crate::error::BuildError;
use crate::transform::Content;

/// The supported compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    /// Whole-buffer gzip-compatible recompression.
    Zopfli,
}

impl Codec {
    /// Map an output file suffix to a codec, the way `tar -a` would.
    pub fn from_suffix(path: &Path) -> Codec {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("gz") | Some("tgz") | Some("taz") => Codec::Gzip,
            Some("bz2") | Some("tbz") | Some("tbz2") | Some("tz2") => Codec::Bzip2,
            Some("xz") | Some("txz") => Codec::Xz,
            Some("zst") | Some("tzst") => Codec::Zstd,
            _ => Codec::None,
        }
    }
}

/// Pick the effective codec: an explicit request wins, otherwise sniff the
/// output suffix when there is a named output to sniff.
pub fn select(requested: Option<Codec>, output: Option<&Path>) -> Codec {
    let codec = match requested {
        Some(codec) => codec,
        None => output.map(Codec::from_suffix).unwrap_or(Codec::None),
    };
    debug!(?codec, "selected output codec");
    codec
}

// The compression layer under the tar writer.
enum Sink {
    Plain(Box<dyn Write>),
    Gzip(flate2::write::GzEncoder<Box<dyn Write>>),
    Bzip2(bzip2::write::BzEncoder<Box<dyn Write>>),
    Xz(xz2::write::XzEncoder<Box<dyn Write>>),
    Zstd(zstd::stream::write::Encoder<'static, Box<dyn Write>>),
    Zopfli { buf: Vec<u8>, dest: Box<dyn Write> },
}

impl Sink {
    fn new(codec: Codec, dest: Box<dyn Write>, level: u32) -> Result<Sink, BuildError> {
        Ok(match codec {
            Codec::None => Sink::Plain(dest),
            Codec::Gzip => Sink::Gzip(flate2::write::GzEncoder::new(
                dest,
                flate2::Compression::new(level.min(9)),
            )),
            Codec::Bzip2 => Sink::Bzip2(bzip2::write::BzEncoder::new(
                dest,
                bzip2::Compression::new(level.clamp(1, 9)),
            )),
            Codec::Xz => Sink::Xz(xz2::write::XzEncoder::new(dest, level.min(9))),
            Codec::Zstd => Sink::Zstd(
                zstd::stream::write::Encoder::new(dest, level.min(22) as i32)
                    .map_err(BuildError::Io)?,
            ),
            Codec::Zopfli => Sink::Zopfli { buf: Vec::new(), dest },
        })
    }

    fn finish(self) -> Result<(), BuildError> {
        match self {
            Sink::Plain(mut w) => w.flush()?,
            Sink::Gzip(enc) => {
                enc.finish()?.flush()?;
            }
            Sink::Bzip2(enc) => {
                enc.finish()?.flush()?;
            }
            Sink::Xz(enc) => {
                enc.finish()?.flush()?;
            }
            Sink::Zstd(enc) => {
                enc.finish()?.flush()?;
            }
            Sink::Zopfli { buf, mut dest } => {
                debug!(bytes = buf.len(), "zopfli recompression pass");
                zopfli::compress(zopfli::Options::default(), zopfli::Format::Gzip, &buf[..], &mut dest)?;
                dest.flush()?;
            }
        }
        Ok(())
    }
}

impl Write for Sink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(data),
            Sink::Gzip(w) => w.write(data),
            Sink::Bzip2(w) => w.write(data),
            Sink::Xz(w) => w.write(data),
            Sink::Zstd(w) => w.write(data),
            Sink::Zopfli { buf, .. } => buf.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
            Sink::Bzip2(w) => w.flush(),
            Sink::Xz(w) => w.flush(),
            Sink::Zstd(w) => w.flush(),
            Sink::Zopfli { buf, .. } => buf.flush(),
        }
    }
}

/// A PAX-format tar writer over an optionally compressed destination.
pub struct OutputCodec {
    builder: tar::Builder<Sink>,
}

impl OutputCodec {
    pub fn new(dest: Box<dyn Write>, codec: Codec, level: u32) -> Result<OutputCodec, BuildError> {
        let sink = Sink::new(codec, dest, level)?;
        Ok(OutputCodec { builder: tar::Builder::new(sink) })
    }

    /// Emit one member: PAX records first, then the header and body. File
    /// content is streamed, buffers are written as-is; the open source handle
    /// is consumed and closed before returning either way.
    pub fn write_member(&mut self, member: &Member, content: Content) -> Result<(), BuildError> {
        if !member.pax.is_empty() {
            self.builder
                .append_pax_extensions(member.pax.iter().map(|(k, v)| (k.as_str(), v.as_bytes())))?;
        }

        let mut header = tar::Header::new_ustar();
        header.set_mode(member.mode);
        header.set_mtime(member.mtime.max(0.0).trunc() as u64);
        header.set_uid(member.uid);
        header.set_gid(member.gid);
        if let Some(name) = &member.uname {
            header.set_username(name)?;
        }
        if let Some(name) = &member.gname {
            header.set_groupname(name)?;
        }

        match &member.kind {
            MemberKind::Regular => {
                header.set_entry_type(tar::EntryType::Regular);
                match content {
                    Content::Bytes(buf) => {
                        header.set_size(buf.len() as u64);
                        self.builder.append_data(&mut header, &member.name, &buf[..])?;
                    }
                    Content::File(path) => {
                        let mut file =
                            File::open(&path).map_err(|e| BuildError::fs(path.clone(), e))?;
                        // size probe: seek to the end and back
                        let size = file
                            .seek(SeekFrom::End(0))
                            .and_then(|size| file.seek(SeekFrom::Start(0)).map(|_| size))
                            .map_err(|e| BuildError::fs(path.clone(), e))?;
                        header.set_size(size);
                        self.builder
                            .append_data(&mut header, &member.name, file.take(size))?;
                    }
                    Content::None => {
                        header.set_size(0);
                        self.builder
                            .append_data(&mut header, &member.name, io::empty())?;
                    }
                }
            }
            MemberKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                let name = if member.name.ends_with('/') {
                    member.name.clone()
                } else {
                    format!("{}/", member.name)
                };
                self.builder.append_data(&mut header, name, io::empty())?;
            }
            MemberKind::Symlink(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                self.builder
                    .append_link(&mut header, &member.name, target)?;
            }
            MemberKind::Fifo => {
                header.set_entry_type(tar::EntryType::Fifo);
                header.set_size(0);
                self.builder
                    .append_data(&mut header, &member.name, io::empty())?;
            }
            MemberKind::Block(major, minor) => {
                header.set_entry_type(tar::EntryType::Block);
                header.set_size(0);
                header.set_device_major(*major)?;
                header.set_device_minor(*minor)?;
                self.builder
                    .append_data(&mut header, &member.name, io::empty())?;
            }
            MemberKind::Char(major, minor) => {
                header.set_entry_type(tar::EntryType::Char);
                header.set_size(0);
                header.set_device_major(*major)?;
                header.set_device_minor(*minor)?;
                self.builder
                    .append_data(&mut header, &member.name, io::empty())?;
            }
        }
        Ok(())
    }

    /// Terminate the tar stream and flush the compression layer.
    pub fn finish(self) -> Result<(), BuildError> {
        let sink = self.builder.into_inner()?;
        sink.finish()
    }
}
