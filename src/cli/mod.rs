use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::{ArgGroup, Parser, ValueEnum};

use crate::codec::Codec;
use crate::defines;
use crate::error::BuildError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate a tar archive from a JSON manifest.", long_about = None)]
#[command(group(ArgGroup::new("mode").args([
    "gzip", "bzip2", "xz", "zstd", "zopfli", "auto", "no_auto", "generate",
])))]
pub struct Args {
    /// Input manifest file(s). Reads from standard input when none are given.
    #[arg(value_name = "FILE")]
    pub infiles: Vec<PathBuf>,

    /// Output filename. Writes to standard output when omitted.
    #[arg(short = 'f', value_name = "FILE")]
    pub outfile: Option<PathBuf>,

    /// Compress output with gzip.
    #[arg(short = 'z')]
    pub gzip: bool,

    /// Compress output with bzip2.
    #[arg(short = 'j', long = "bzip2")]
    pub bzip2: bool,

    /// Compress output with xz.
    #[arg(short = 'J', long = "xz")]
    pub xz: bool,

    /// Compress output with zstd.
    #[arg(long)]
    pub zstd: bool,

    /// Recompress the finished archive with zopfli (gzip-compatible output).
    /// Buffers the whole uncompressed archive in memory first.
    #[arg(long)]
    pub zopfli: bool,

    /// Compress output based on the output file suffix (default).
    #[arg(short = 'a', long = "auto-compress")]
    pub auto: bool,

    /// Do not compress output, regardless of the output file suffix.
    #[arg(long = "no-auto-compress")]
    pub no_auto: bool,

    /// Generate a JSON manifest from an existing tar archive instead.
    #[arg(short = 'g', long = "generate")]
    pub generate: bool,

    /// Compression level passed to the selected codec.
    #[arg(long, default_value_t = 6)]
    pub level: u32,

    /// Read variable definitions from FILE.
    #[arg(short = 'T', value_name = "FILE")]
    pub defs_file: Option<PathBuf>,

    /// Define substitution variable KEY as VALUE. Wins over definitions
    /// read with -T for the same key.
    #[arg(short = 'd', long = "define", value_name = "KEY=VALUE")]
    pub define: Vec<String>,

    /// Treat manifest sources as relative to DIR.
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Queue policy when a directory entry lands on an already-queued path.
    #[arg(long, value_enum, default_value_t = DirPolicy::First)]
    pub dirs: DirPolicy,
}

/// What happens when a directory member would occupy an archive path that
/// is already queued.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirPolicy {
    /// Keep the first queued member, silently discard the new directory.
    First,
    /// The new directory always overwrites.
    Last,
    /// Never queue any directory entry at all.
    Omit,
}

impl Args {
    /// The codec the flags ask for; `None` means sniff the output suffix.
    pub fn requested_codec(&self) -> Option<Codec> {
        if self.gzip {
            Some(Codec::Gzip)
        } else if self.bzip2 {
            Some(Codec::Bzip2)
        } else if self.xz {
            Some(Codec::Xz)
        } else if self.zstd {
            Some(Codec::Zstd)
        } else if self.zopfli {
            Some(Codec::Zopfli)
        } else if self.no_auto {
            Some(Codec::None)
        } else {
            None
        }
    }

    /// Merge `-d KEY=VALUE` definitions with the `-T` definitions file.
    /// Command-line definitions take precedence; a key given twice on the
    /// command line is an error.
    pub fn definitions(&self) -> Result<HashMap<String, String>, BuildError> {
        let mut merged = HashMap::new();
        for pair in &self.define {
            let (key, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
            if merged.insert(key.to_string(), value.to_string()).is_some() {
                return Err(BuildError::Config(format!(
                    "multiple definitions for key `{key}`"
                )));
            }
        }
        if let Some(path) = &self.defs_file {
            let file = File::open(path).map_err(|e| BuildError::fs(path.clone(), e))?;
            let parsed = defines::parse(BufReader::new(file), &path.display().to_string())?;
            for (key, value) in parsed {
                merged.entry(key).or_insert(value);
            }
        }
        Ok(merged)
    }
}

/// Parse command-line arguments. This is the main entry point for the CLI
/// logic; usage errors and `--help`/`--version` exit directly via clap.
pub fn run() -> Args {
    Args::parse()
}
