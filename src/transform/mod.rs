//! # Content Transform Pipeline
//!
//! Resolves the content of one archive member: inline base64, template
//! rendering, filter-command chains, or direct file streaming. Template
//! rendering and filter execution are injected capabilities resolved at
//! startup, so an unavailable backend fails loudly instead of mid-run.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::entry::{self, MemberKind, RawEntry, ResolveContext, BASE64_PREFIX};
use crate::error::BuildError;

/// The resolved content source of one member.
pub enum Content {
    /// Structural members (directories, links, devices, fifos) carry none.
    None,
    /// Transformed or inline content, fully materialized.
    Bytes(Vec<u8>),
    /// A filesystem path streamed through the codec at write time.
    File(PathBuf),
}

/// Renders a template source against the variable definitions.
pub trait TemplateEngine {
    fn render(&self, source: &[u8], vars: &HashMap<String, String>) -> Result<Vec<u8>, BuildError>;
}

/// The in-tree engine: `${name}` substitution over UTF-8 text, same syntax
/// and escaping as manifest field expansion.
pub struct SubstTemplate;

impl TemplateEngine for SubstTemplate {
    fn render(&self, source: &[u8], vars: &HashMap<String, String>) -> Result<Vec<u8>, BuildError> {
        let text = std::str::from_utf8(source)
            .map_err(|_| BuildError::Schema("template source is not valid UTF-8".into()))?;
        Ok(entry::expand_vars(text, vars)?.into_bytes())
    }
}

/// Runs one external filter command over a byte buffer.
pub trait FilterRunner {
    fn run(&self, argv: &[String], input: &[u8]) -> Result<Vec<u8>, BuildError>;
}

/// The in-tree runner: spawns the argv, feeds stdin from the prior stage,
/// blocks until exit. A non-zero status is fatal for the whole run.
pub struct CommandRunner;

impl FilterRunner for CommandRunner {
    fn run(&self, argv: &[String], input: &[u8]) -> Result<Vec<u8>, BuildError> {
        let program = argv
            .first()
            .ok_or_else(|| BuildError::Config("empty filter command".into()))?;
        let mut child = Command::new(program)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BuildError::fs(program, e))?;

        // Feed stdin from a helper thread so a large buffer cannot deadlock
        // against the child's own output.
        let writer = child.stdin.take().map(|mut stdin| {
            let buf = input.to_vec();
            std::thread::spawn(move || stdin.write_all(&buf))
        });

        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            // a filter that closes stdin early (e.g. `head`) is fine
            let _ = handle.join();
        }
        if !output.status.success() {
            return Err(BuildError::FilterProcess {
                command: argv.to_vec(),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(output.stdout)
    }
}

/// The injected capabilities one builder run resolves at startup.
pub struct Capabilities {
    pub template: Box<dyn TemplateEngine>,
    pub filters: Box<dyn FilterRunner>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities { template: Box::new(SubstTemplate), filters: Box::new(CommandRunner) }
    }
}

/// Resolve the content for a member. Precedence is a strict chain:
/// inline base64, then template rendering, then the filter pipeline, then
/// direct streaming from the source path. Every handle opened here is
/// consumed and closed before returning, on success and failure alike.
pub fn resolve_content(
    raw: &RawEntry,
    ctx: &ResolveContext,
    kind: &MemberKind,
    caps: &Capabilities,
) -> Result<Content, BuildError> {
    if *kind != MemberKind::Regular {
        return Ok(Content::None);
    }

    let source = match &raw.source {
        Some(s) => ctx.expand(s)?,
        None => {
            return Err(BuildError::Schema(
                "regular member without a content source".into(),
            ))
        }
    };

    if let Some(data) = source.strip_prefix(BASE64_PREFIX) {
        if raw.template {
            return Err(BuildError::Schema(format!(
                "entry `{source}` combines base64 content with `template`"
            )));
        }
        let bytes = BASE64
            .decode(data)
            .map_err(|e| BuildError::Schema(format!("invalid base64 content: {e}")))?;
        return Ok(Content::Bytes(bytes));
    }

    let path = ctx.source_path(&source);

    if raw.template {
        let raw_bytes = read_all(&path)?;
        debug!(source = %path.display(), "rendering template");
        return caps
            .template
            .render(&raw_bytes, &ctx.defines)
            .map(Content::Bytes);
    }

    if let Some(filter) = &raw.filter {
        let stages = filter.stages();
        if !stages.is_empty() {
            let mut data = read_all(&path)?;
            for argv in &stages {
                debug!(command = ?argv, "piping through filter");
                data = caps.filters.run(argv, &data)?;
            }
            return Ok(Content::Bytes(data));
        }
    }

    Ok(Content::File(path))
}

fn read_all(path: &PathBuf) -> Result<Vec<u8>, BuildError> {
    let mut file = File::open(path).map_err(|e| BuildError::fs(path.clone(), e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| BuildError::fs(path.clone(), e))?;
    Ok(buf)
}
