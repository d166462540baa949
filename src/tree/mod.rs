//! # Directory Tree
//!
//! The reverse direction: a navigable tree of the members of an existing
//! tar stream, with virtual directory nodes synthesized for any implied but
//! absent parent. Feeds manifest generation, where every concrete member is
//! emitted as one JSON object per line.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde_json::json;
use tracing::debug;

use crate::error::BuildError;

/// Metadata captured from one tar member.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub path: String,
    pub is_dir: bool,
    pub link: Option<String>,
    pub mtime: f64,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    pub atime: Option<String>,
    pub ctime: Option<String>,
}

/// One tree node: a member (absent for virtual placeholders) plus its
/// children keyed by name.
#[derive(Debug, Default)]
pub struct Node {
    member: Option<MemberInfo>,
    children: BTreeMap<String, Node>,
}

impl Node {
    /// A virtual node stands in for an implied parent that the archive never
    /// declared. It appears in walks but is excluded from actual writes.
    pub fn is_virtual(&self) -> bool {
        self.member.is_none()
    }

    pub fn member(&self) -> Option<&MemberInfo> {
        self.member.as_ref()
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    fn is_dir(&self) -> bool {
        self.is_virtual()
            || !self.children.is_empty()
            || self.member.as_ref().map(|m| m.is_dir).unwrap_or(false)
    }

    /// Names of child directories, in sorted order.
    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .filter(|(_, node)| node.is_dir())
            .map(|(name, _)| name.as_str())
    }

    /// Names of child files (anything that is not a directory).
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .filter(|(_, node)| !node.is_dir())
            .map(|(name, _)| name.as_str())
    }
}

/// The member tree of one source archive. Root is keyed by the empty path.
#[derive(Debug, Default)]
pub struct DirectoryTree {
    root: Node,
}

impl DirectoryTree {
    pub fn new() -> Self {
        DirectoryTree::default()
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Attach one member, synthesizing virtual nodes for missing parents.
    /// A member landing on a virtual placeholder replaces it and inherits
    /// any children already attached there.
    pub fn insert(&mut self, member: MemberInfo) {
        let mut node = &mut self.root;
        for comp in member
            .path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
        {
            node = node.children.entry(comp.to_string()).or_default();
        }
        node.member = Some(member);
    }

    /// Pre-order walk producing `(path, subdirectory names, file names)`
    /// per directory, virtual nodes included.
    pub fn walk(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        let mut out = Vec::new();
        walk_node(&self.root, "", &mut out);
        out
    }

    /// Every concrete (non-virtual) member, in pre-order: each directory
    /// before its own contents.
    pub fn members(&self) -> Vec<&MemberInfo> {
        let mut out = Vec::new();
        collect_members(&self.root, &mut out);
        out
    }
}

fn walk_node(node: &Node, path: &str, out: &mut Vec<(String, Vec<String>, Vec<String>)>) {
    let dirs: Vec<String> = node.dirs().map(str::to_string).collect();
    let files: Vec<String> = node.files().map(str::to_string).collect();
    out.push((path.to_string(), dirs.clone(), files));
    for name in dirs {
        if let Some(child) = node.children.get(&name) {
            let sub = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
            walk_node(child, &sub, out);
        }
    }
}

fn collect_members<'a>(node: &'a Node, out: &mut Vec<&'a MemberInfo>) {
    for child in node.children.values() {
        if let Some(member) = &child.member {
            out.push(member);
        }
        collect_members(child, out);
    }
}

/// Read a tar stream and emit its manifest: one JSON object per concrete
/// member, in tree pre-order.
pub fn generate_manifest<R: Read, W: Write>(input: R, output: &mut W) -> Result<(), BuildError> {
    let mut archive = tar::Archive::new(input);
    let mut tree = DirectoryTree::new();

    for entry in archive.entries()? {
        let mut entry = entry?;

        let mut atime = None;
        let mut ctime = None;
        let mut pax_mtime = None;
        if let Some(extensions) = entry.pax_extensions()? {
            for ext in extensions {
                let ext = ext?;
                match (ext.key(), ext.value()) {
                    (Ok("atime"), Ok(v)) => atime = Some(v.to_string()),
                    (Ok("ctime"), Ok(v)) => ctime = Some(v.to_string()),
                    (Ok("mtime"), Ok(v)) => pax_mtime = v.parse::<f64>().ok(),
                    _ => {}
                }
            }
        }

        let path = entry.path()?.to_string_lossy().into_owned();
        let link = entry
            .link_name()?
            .map(|c| c.to_string_lossy().into_owned());
        let header = entry.header();
        let info = MemberInfo {
            path: path.trim_end_matches('/').to_string(),
            is_dir: header.entry_type().is_dir(),
            link,
            mtime: pax_mtime.unwrap_or(header.mtime()? as f64),
            uid: header.uid()?,
            gid: header.gid()?,
            uname: header.username().ok().flatten().unwrap_or("").to_string(),
            gname: header.groupname().ok().flatten().unwrap_or("").to_string(),
            atime,
            ctime,
        };
        debug!(path = %info.path, "read archive member");
        tree.insert(info);
    }

    for member in tree.members() {
        let mut obj = serde_json::Map::new();
        obj.insert("source".into(), json!(member.path));
        if let Some(link) = &member.link {
            obj.insert("link".into(), json!(link));
        }
        let mtime = if member.mtime.fract() == 0.0 {
            json!(member.mtime as i64)
        } else {
            json!(member.mtime)
        };
        obj.insert("mtime".into(), mtime);
        obj.insert("uid".into(), json!(member.uid));
        obj.insert("gid".into(), json!(member.gid));
        obj.insert("uname".into(), json!(member.uname));
        obj.insert("gname".into(), json!(member.gname));
        if let Some(atime) = &member.atime {
            obj.insert("atime".into(), json!(atime));
        }
        if let Some(ctime) = &member.ctime {
            obj.insert("ctime".into(), json!(ctime));
        }
        writeln!(output, "{}", serde_json::Value::Object(obj))?;
    }

    Ok(())
}
