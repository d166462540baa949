//! # Manifest Entries
//!
//! The raw, serde-decoded shape of one manifest entry and its resolution
//! into a tar-header-ready archive member. Every attribute resolves through
//! an explicit fallback chain (literal → `"stat"` sentinel → default), and
//! `${name}` placeholders in string fields expand against the definition
//! context before anything touches the filesystem.

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::chmod::{ModeCompiler, MODE_MASK};
use crate::error::BuildError;

/// Source prefix for inline base64 content.
pub const BASE64_PREFIX: &str = "base64:";

/// `mode` accepts an integer (decimal digits read as octal, matching the
/// original manifest format) or a chmod-style expression string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModeField {
    Num(i64),
    Expr(String),
}

/// Timestamps accept a number or one of the `"now"` / `"stat"` sentinels;
/// any other string must parse as a float.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeField {
    Num(f64),
    Word(String),
}

/// `uid`/`gid` accept a number or the `"stat"` sentinel.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdField {
    Num(u64),
    Word(String),
}

/// `filter` accepts one argv list or a list of argv lists piped in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FilterField {
    Command(Vec<String>),
    Chain(Vec<Vec<String>>),
}

impl FilterField {
    /// Normalize to a pipeline of argv lists.
    pub fn stages(&self) -> Vec<Vec<String>> {
        match self {
            FilterField::Command(argv) if argv.is_empty() => Vec::new(),
            FilterField::Command(argv) => vec![argv.clone()],
            FilterField::Chain(stages) => stages.clone(),
        }
    }
}

// Distinguishes an absent field from an explicit JSON null: absent stays
// `None`, null becomes `Some(None)` ("omit from PAX headers").
fn nullable<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Option::<String>::deserialize(de)?))
}

/// One raw manifest entry, straight out of the JSON stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntry {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: Option<ModeField>,
    #[serde(default)]
    pub mtime: Option<TimeField>,
    #[serde(default)]
    pub atime: Option<TimeField>,
    #[serde(default)]
    pub ctime: Option<TimeField>,
    #[serde(default)]
    pub uid: Option<IdField>,
    #[serde(default)]
    pub gid: Option<IdField>,
    #[serde(default, deserialize_with = "nullable")]
    pub uname: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub gname: Option<Option<String>>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub fifo: bool,
    #[serde(default)]
    pub block: Option<(u32, u32)>,
    #[serde(default, rename = "char")]
    pub chr: Option<(u32, u32)>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub filter: Option<FilterField>,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub recursive: bool,
}

impl RawEntry {
    /// Parse one decoded manifest value into an entry.
    pub fn from_value(value: serde_json::Value) -> Result<RawEntry, BuildError> {
        serde_json::from_value(value)
            .map_err(|e| BuildError::Schema(format!("invalid manifest entry: {e}")))
    }

    pub fn has_marker(&self) -> bool {
        self.link.is_some() || self.fifo || self.block.is_some() || self.chr.is_some() || self.dir
    }

    fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.source.as_deref())
            .unwrap_or("<unnamed>")
    }

    /// Structural checks that need no filesystem access. Run before an entry
    /// is queued, so schema violations surface before any archive I/O.
    pub fn validate(&self) -> Result<(), BuildError> {
        let markers = [
            self.link.is_some(),
            self.fifo,
            self.block.is_some(),
            self.chr.is_some(),
            self.dir,
        ];
        if markers.iter().filter(|&&m| m).count() > 1 {
            return Err(BuildError::Schema(format!(
                "entry `{}` sets more than one of link/fifo/block/char/dir",
                self.display_name()
            )));
        }
        if self.source.is_none() && !self.has_marker() {
            return Err(BuildError::Schema(format!(
                "entry `{}` is missing `source`",
                self.display_name()
            )));
        }
        if self.source.is_none() && self.name.is_none() {
            return Err(BuildError::Schema(
                "entry has neither `source` nor `name`".into(),
            ));
        }
        if self.recursive {
            if self.template || self.filter.is_some() {
                return Err(BuildError::Schema(format!(
                    "entry `{}` combines `recursive` with content transforms",
                    self.display_name()
                )));
            }
            if self.has_marker() {
                return Err(BuildError::Schema(format!(
                    "entry `{}` combines `recursive` with a special-type marker",
                    self.display_name()
                )));
            }
        }
        Ok(())
    }

    /// Derive the sub-entry for one path discovered during recursive
    /// expansion: same attributes, substituted source/name, recursion
    /// cleared so the child cannot expand again.
    pub fn sub(&self, source: String, name: String) -> RawEntry {
        let mut child = self.clone();
        child.source = Some(source);
        child.name = Some(name);
        child.recursive = false;
        child
    }
}

/// Variable definitions plus the base directory sources resolve against.
/// Owns the mode compiler so its caches span the whole run.
pub struct ResolveContext {
    pub defines: HashMap<String, String>,
    pub chdir: Option<PathBuf>,
    pub modes: ModeCompiler,
}

impl ResolveContext {
    pub fn new(defines: HashMap<String, String>, chdir: Option<PathBuf>) -> Self {
        ResolveContext { defines, chdir, modes: ModeCompiler::new() }
    }

    /// Expand `${name}` placeholders and `\$` escapes.
    pub fn expand(&self, s: &str) -> Result<String, BuildError> {
        expand_vars(s, &self.defines)
    }

    /// Filesystem path for a manifest source, honoring the configured base
    /// directory for relative paths.
    pub fn source_path(&self, source: &str) -> PathBuf {
        let p = Path::new(source);
        match (&self.chdir, p.is_absolute()) {
            (Some(base), false) => base.join(p),
            _ => p.to_path_buf(),
        }
    }
}

/// Expand `${name}` placeholders against `defines`; `\$` yields a literal
/// dollar sign. Brace groups that are not plain identifiers pass through
/// untouched. An identifier with no definition is a configuration error,
/// never silently empty.
pub fn expand_vars(s: &str, defines: &HashMap<String, String>) -> Result<String, BuildError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == '}' {
                        closed = true;
                        break;
                    }
                    body.push(ch);
                }
                let is_ident = closed
                    && !body.is_empty()
                    && body.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if is_ident {
                    match defines.get(&body) {
                        Some(v) => out.push_str(v),
                        None => {
                            return Err(BuildError::Config(format!(
                                "undefined variable `{body}` in `{s}`"
                            )))
                        }
                    }
                } else {
                    out.push_str("${");
                    out.push_str(&body);
                    if closed {
                        out.push('}');
                    }
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// The resolved type of an archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    Regular,
    Directory,
    Symlink(String),
    Fifo,
    Block(u32, u32),
    Char(u32, u32),
}

/// An entry after full resolution: canonical archive path, type, and all
/// header metadata. Content is resolved separately by the transform layer.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
    pub mode: u32,
    pub mtime: f64,
    pub uid: u64,
    pub gid: u64,
    pub uname: Option<String>,
    pub gname: Option<String>,
    /// PAX extended-header records (`atime`/`ctime`, fractional `mtime`).
    pub pax: Vec<(String, String)>,
}

// The slice of filesystem status the resolver consults.
struct StatView {
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: f64,
    atime: f64,
    ctime: f64,
}

#[cfg(unix)]
fn stat_view(md: &Metadata) -> StatView {
    use std::os::unix::fs::MetadataExt;
    StatView {
        mode: md.mode() & MODE_MASK,
        uid: md.uid() as u64,
        gid: md.gid() as u64,
        mtime: md.mtime() as f64 + md.mtime_nsec() as f64 / 1e9,
        atime: md.atime() as f64 + md.atime_nsec() as f64 / 1e9,
        ctime: md.ctime() as f64 + md.ctime_nsec() as f64 / 1e9,
    }
}

#[cfg(not(unix))]
fn stat_view(md: &Metadata) -> StatView {
    let epoch = |t: std::io::Result<SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    };
    StatView {
        mode: if md.is_dir() { 0o755 } else { 0o644 },
        uid: 0,
        gid: 0,
        mtime: epoch(md.modified()),
        atime: epoch(md.accessed()),
        ctime: epoch(md.created()),
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// PAX timestamp representation: integer seconds stay integral, fractional
/// values keep their fraction.
fn fmt_pax_time(t: f64) -> String {
    if t.fract() == 0.0 {
        format!("{}", t as i64)
    } else {
        format!("{t}")
    }
}

fn resolve_time(
    field: &Option<TimeField>,
    stat: Option<f64>,
    what: &str,
    name: &str,
) -> Result<Option<f64>, BuildError> {
    match field {
        None => Ok(None),
        Some(TimeField::Num(n)) => Ok(Some(*n)),
        Some(TimeField::Word(w)) if w == "now" => Ok(Some(now_epoch())),
        Some(TimeField::Word(w)) if w == "stat" => stat.map(Some).ok_or_else(|| {
            BuildError::Schema(format!(
                "`{what}: \"stat\"` requested but entry `{name}` has no filesystem source"
            ))
        }),
        Some(TimeField::Word(w)) => w.parse::<f64>().map(Some).map_err(|_| {
            BuildError::Schema(format!("invalid `{what}` value `{w}` for entry `{name}`"))
        }),
    }
}

fn resolve_id(
    field: &Option<IdField>,
    stat: Option<u64>,
    what: &str,
    name: &str,
) -> Result<Option<u64>, BuildError> {
    match field {
        None => Ok(None),
        Some(IdField::Num(n)) => Ok(Some(*n)),
        Some(IdField::Word(w)) if w == "stat" => stat.map(Some).ok_or_else(|| {
            BuildError::Schema(format!(
                "`{what}: \"stat\"` requested but entry `{name}` has no filesystem source"
            ))
        }),
        Some(IdField::Word(w)) => Err(BuildError::Schema(format!(
            "invalid `{what}` value `{w}` for entry `{name}`"
        ))),
    }
}

/// The shape the builder needs at queue time: the resolved archive path and
/// whether the member is a directory for queue-policy purposes. Missing
/// sources do not error here; full resolution at write time reports them.
pub fn queued_shape(raw: &RawEntry, ctx: &ResolveContext) -> Result<(String, bool), BuildError> {
    let source = raw.source.as_deref().map(|s| ctx.expand(s)).transpose()?;
    let name = match &raw.name {
        Some(n) => ctx.expand(n)?,
        None => source.clone().unwrap_or_default(),
    };
    let is_dir = raw.dir
        || (!raw.has_marker()
            && source
                .as_deref()
                .filter(|s| !s.starts_with(BASE64_PREFIX))
                .map(|s| {
                    fs::symlink_metadata(ctx.source_path(s))
                        .map(|md| md.is_dir())
                        .unwrap_or(false)
                })
                .unwrap_or(false));
    Ok((name, is_dir))
}

/// Resolve a raw entry into an archive member.
///
/// Returns `Ok(None)` when the resolved name fully matches the entry's
/// `exclude` pattern — a declared drop, not an error.
pub fn resolve(raw: &RawEntry, ctx: &ResolveContext) -> Result<Option<Member>, BuildError> {
    raw.validate()?;

    let source = raw.source.as_deref().map(|s| ctx.expand(s)).transpose()?;
    let is_base64 = source
        .as_deref()
        .map(|s| s.starts_with(BASE64_PREFIX))
        .unwrap_or(false);
    let name = match &raw.name {
        Some(n) => ctx.expand(n)?,
        None => source.clone().unwrap_or_default(),
    };

    let src_path = source
        .as_deref()
        .filter(|_| !is_base64)
        .map(|s| ctx.source_path(s));
    let md: Option<Metadata> = match &src_path {
        Some(path) => match fs::symlink_metadata(path) {
            Ok(md) => Some(md),
            Err(e) if raw.has_marker() && e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(BuildError::fs(path.clone(), e)),
        },
        None => None,
    };
    let view = md.as_ref().map(stat_view);

    // special markers take precedence, in fixed order
    let kind = if let Some((major, minor)) = raw.block {
        MemberKind::Block(major, minor)
    } else if let Some((major, minor)) = raw.chr {
        MemberKind::Char(major, minor)
    } else if let Some(target) = &raw.link {
        MemberKind::Symlink(ctx.expand(target)?)
    } else if raw.fifo {
        MemberKind::Fifo
    } else if raw.dir {
        MemberKind::Directory
    } else if let Some(md) = &md {
        let ft = md.file_type();
        if ft.is_dir() {
            MemberKind::Directory
        } else if ft.is_symlink() {
            let path = src_path.as_deref().unwrap_or_else(|| Path::new(""));
            let target = fs::read_link(path).map_err(|e| BuildError::fs(path, e))?;
            let target = target.to_str().ok_or_else(|| {
                BuildError::Schema(format!("symlink target of `{name}` is not valid UTF-8"))
            })?;
            MemberKind::Symlink(target.to_string())
        } else if is_fifo(&ft) {
            MemberKind::Fifo
        } else {
            MemberKind::Regular
        }
    } else {
        MemberKind::Regular
    };

    let is_dir_kind = kind == MemberKind::Directory;
    let mode = if matches!(kind, MemberKind::Symlink(_)) {
        // literal links always carry full permissions
        0o777
    } else if let Some(field) = &raw.mode {
        let expr = match field {
            ModeField::Num(n) => n.to_string(),
            ModeField::Expr(s) => s.clone(),
        };
        match (&view, &md) {
            (Some(v), Some(md)) => ctx.modes.update(&expr, v.mode, md.is_dir())?,
            _ => ctx.modes.update(&expr, 0, is_dir_kind)?,
        }
    } else {
        match &view {
            Some(v) => v.mode,
            None if is_dir_kind => 0o755,
            None => 0o644,
        }
    };

    let mtime = resolve_time(&raw.mtime, view.as_ref().map(|v| v.mtime), "mtime", &name)?
        .or_else(|| view.as_ref().map(|v| v.mtime))
        .unwrap_or(0.0);
    let atime = resolve_time(&raw.atime, view.as_ref().map(|v| v.atime), "atime", &name)?;
    let ctime = resolve_time(&raw.ctime, view.as_ref().map(|v| v.ctime), "ctime", &name)?;

    let mut uid = resolve_id(&raw.uid, view.as_ref().map(|v| v.uid), "uid", &name)?;
    let mut gid = resolve_id(&raw.gid, view.as_ref().map(|v| v.gid), "gid", &name)?;
    let mut uname = raw.uname.clone().map(|o| o.unwrap_or_default());
    let mut gname = raw.gname.clone().map(|o| o.unwrap_or_default());

    // `root` name/id cross-inference when only one of the pair is given
    if uid.is_none() && uname.as_deref() == Some("root") {
        uid = Some(0);
    }
    if uname.is_none() && matches!(raw.uid, Some(IdField::Num(0))) {
        uname = Some("root".into());
    }
    if gid.is_none() && gname.as_deref() == Some("root") {
        gid = Some(0);
    }
    if gname.is_none() && matches!(raw.gid, Some(IdField::Num(0))) {
        gname = Some("root".into());
    }

    let uid = uid.or_else(|| view.as_ref().map(|v| v.uid)).unwrap_or(0);
    let gid = gid.or_else(|| view.as_ref().map(|v| v.gid)).unwrap_or(0);

    let mut pax = Vec::new();
    if let Some(t) = atime {
        pax.push(("atime".to_string(), fmt_pax_time(t)));
    }
    if let Some(t) = ctime {
        pax.push(("ctime".to_string(), fmt_pax_time(t)));
    }
    if mtime.fract() != 0.0 {
        pax.push(("mtime".to_string(), fmt_pax_time(mtime)));
    }

    if let Some(pattern) = &raw.exclude {
        let re = Regex::new(&format!(r"\A(?:{pattern})\z")).map_err(|e| {
            BuildError::Config(format!("invalid exclude regex `{pattern}`: {e}"))
        })?;
        if re.is_match(&name) {
            return Ok(None);
        }
    }

    Ok(Some(Member { name, kind, mode, mtime, uid, gid, uname, gname, pax }))
}

#[cfg(unix)]
fn is_fifo(ft: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    ft.is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_ft: &std::fs::FileType) -> bool {
    false
}
