//! Main entry point for the mftar CLI app

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};

use mftar::builder::{ArchiveBuilder, BuildOptions};
use mftar::cli::{self, Args};
use mftar::entry::ResolveContext;
use mftar::manifest::EntryStream;
use mftar::{codec, tree, BuildError};

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), BuildError> {
    let args = cli::run();

    if let Some(dir) = &args.chdir {
        if !dir.is_dir() {
            return Err(BuildError::Config(format!(
                "`{}` is not an accessible directory",
                dir.display()
            )));
        }
    }

    if args.generate {
        generate(&args)?;
    } else {
        build(&args)?;
    }
    Ok(())
}

// Open the output destination: a named file, or stdout when omitted.
fn open_output(args: &Args) -> Result<Box<dyn Write>, BuildError> {
    match &args.outfile {
        Some(path) => {
            let file = File::create(path).map_err(|e| BuildError::fs(path.clone(), e))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

fn build(args: &Args) -> Result<(), BuildError> {
    let selected = codec::select(args.requested_codec(), args.outfile.as_deref());
    let options = BuildOptions { codec: selected, level: args.level, dirs: args.dirs };
    let ctx = ResolveContext::new(args.definitions()?, args.chdir.clone());

    let mut builder = ArchiveBuilder::new(open_output(args)?, options, ctx)?;
    if args.infiles.is_empty() {
        for value in EntryStream::new(io::stdin().lock()) {
            builder.add_value(value?)?;
        }
    } else {
        for path in &args.infiles {
            let file = File::open(path).map_err(|e| BuildError::fs(path.clone(), e))?;
            for value in EntryStream::new(BufReader::new(file)) {
                builder.add_value(value?)?;
            }
        }
    }
    builder.close()
}

fn generate(args: &Args) -> Result<(), BuildError> {
    let mut output = open_output(args)?;
    if args.infiles.is_empty() {
        tree::generate_manifest(io::stdin().lock(), &mut output)?;
    } else {
        for path in &args.infiles {
            let file = File::open(path).map_err(|e| BuildError::fs(path.clone(), e))?;
            tree::generate_manifest(BufReader::new(file), &mut output)?;
        }
    }
    output.flush()?;
    Ok(())
}
