//! # Archive Builder
//!
//! Orchestrates manifest entries into the output archive. Entries accumulate
//! in an insertion-ordered queue keyed by archive path; directory policy
//! decides whether a later directory may occupy an already-queued path, and
//! non-directory members always win the path last-write-wins. Recursive
//! directory entries expand into one sub-entry per discovered path before
//! queueing. On close, queued members are resolved, transformed, and emitted
//! in queue order, then the tar stream and compression layer are finalized.

use std::collections::HashMap;
use std::io::{self, Write};

use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::cli::DirPolicy;
use crate::codec::{Codec, OutputCodec};
use crate::entry::{self, RawEntry, ResolveContext, BASE64_PREFIX};
use crate::error::BuildError;
use crate::transform::{self, Capabilities};

/// Options for one builder run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub codec: Codec,
    pub level: u32,
    pub dirs: DirPolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions { codec: Codec::None, level: 6, dirs: DirPolicy::First }
    }
}

// One pending member. The raw entry is kept and fully resolved at close
// time; the name and directory flag are fixed at queue time for policy.
struct Queued {
    name: String,
    raw: RawEntry,
}

/// Builds one archive from a stream of manifest entries.
pub struct ArchiveBuilder {
    codec: OutputCodec,
    ctx: ResolveContext,
    caps: Capabilities,
    policy: DirPolicy,
    queue: Vec<Queued>,
    index: HashMap<String, usize>,
}

impl ArchiveBuilder {
    pub fn new(
        dest: Box<dyn Write>,
        options: BuildOptions,
        ctx: ResolveContext,
    ) -> Result<Self, BuildError> {
        Self::with_capabilities(dest, options, ctx, Capabilities::default())
    }

    /// Construct with explicit template/filter backends, for callers that
    /// inject their own.
    pub fn with_capabilities(
        dest: Box<dyn Write>,
        options: BuildOptions,
        ctx: ResolveContext,
        caps: Capabilities,
    ) -> Result<Self, BuildError> {
        let codec = OutputCodec::new(dest, options.codec, options.level)?;
        Ok(ArchiveBuilder {
            codec,
            ctx,
            caps,
            policy: options.dirs,
            queue: Vec::new(),
            index: HashMap::new(),
        })
    }

    /// Accept one decoded manifest value: a single entry object or an array
    /// of entry objects (flattened one level).
    pub fn add_value(&mut self, value: Value) -> Result<(), BuildError> {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.add_entry(RawEntry::from_value(item)?)?;
                }
                Ok(())
            }
            other => self.add_entry(RawEntry::from_value(other)?),
        }
    }

    /// Queue one entry, expanding recursive directory entries first.
    pub fn add_entry(&mut self, raw: RawEntry) -> Result<(), BuildError> {
        raw.validate()?;
        if raw.recursive {
            self.expand_recursive(raw)
        } else {
            self.enqueue(raw)
        }
    }

    // Walk the source directory and queue one sub-entry per discovered path,
    // each inheriting the parent's attributes with source/name substituted
    // and recursion cleared. Directories come before their own contents.
    fn expand_recursive(&mut self, raw: RawEntry) -> Result<(), BuildError> {
        let source = raw
            .source
            .as_deref()
            .map(|s| self.ctx.expand(s))
            .transpose()?
            .unwrap_or_default();
        if source.starts_with(BASE64_PREFIX) {
            return Err(BuildError::Schema(format!(
                "entry `{source}` combines `recursive` with base64 content"
            )));
        }

        let mut src_base = source;
        if !src_base.is_empty() && !src_base.ends_with('/') {
            src_base.push('/');
        }
        let mut dst_base = match &raw.name {
            Some(n) => self.ctx.expand(n)?,
            None => src_base.trim_end_matches('/').to_string(),
        };
        if !dst_base.is_empty() && !dst_base.ends_with('/') {
            dst_base.push('/');
        }

        let root = self.ctx.source_path(&src_base);
        if !root.is_dir() {
            return Err(BuildError::Schema(format!(
                "`recursive` set but `{src_base}` is not a directory"
            )));
        }

        debug!(source = %src_base, dest = %dst_base, "expanding recursive directory");
        for item in WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let item = item.map_err(|e| {
                let path = e.path().map(|p| p.to_path_buf()).unwrap_or_else(|| root.clone());
                BuildError::Filesystem {
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("directory walk failed")),
                }
            })?;
            let rel = item
                .path()
                .strip_prefix(&root)
                .map_err(|_| BuildError::Schema(format!("walk escaped `{src_base}`")))?;
            let rel = rel.to_str().ok_or_else(|| {
                BuildError::Schema(format!("non-UTF-8 path under `{src_base}`"))
            })?;
            let rel = if std::path::MAIN_SEPARATOR == '/' {
                rel.to_string()
            } else {
                rel.replace(std::path::MAIN_SEPARATOR, "/")
            };

            self.enqueue(raw.sub(format!("{src_base}{rel}"), format!("{dst_base}{rel}")))?;
        }
        Ok(())
    }

    // Queue-policy gate. Directory members defer to the configured policy;
    // everything else overwrites whatever holds the path. An overwrite keeps
    // the original queue position.
    fn enqueue(&mut self, raw: RawEntry) -> Result<(), BuildError> {
        let (name, is_dir) = entry::queued_shape(&raw, &self.ctx)?;
        if is_dir {
            match self.policy {
                DirPolicy::Omit => {
                    debug!(name = %name, "directory omitted by policy");
                    return Ok(());
                }
                DirPolicy::First if self.index.contains_key(&name) => {
                    debug!(name = %name, "path already queued, keeping first");
                    return Ok(());
                }
                _ => {}
            }
        }
        match self.index.get(&name) {
            Some(&slot) => {
                debug!(name = %name, "overwriting queued member");
                self.queue[slot] = Queued { name, raw };
            }
            None => {
                self.index.insert(name.clone(), self.queue.len());
                self.queue.push(Queued { name, raw });
            }
        }
        Ok(())
    }

    /// Number of members currently queued.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Resolve and emit every queued member in order, then finalize the tar
    /// stream and the compression layer.
    pub fn close(self) -> Result<(), BuildError> {
        let ArchiveBuilder { mut codec, ctx, caps, queue, .. } = self;
        for item in queue {
            let member = match entry::resolve(&item.raw, &ctx)? {
                Some(member) => member,
                None => {
                    debug!(name = %item.name, "member dropped by exclude");
                    continue;
                }
            };
            let content = transform::resolve_content(&item.raw, &ctx, &member.kind, &caps)?;
            codec.write_member(&member, content)?;
        }
        codec.finish()
    }
}
