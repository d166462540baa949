//! # Mode Expression Compiler
//!
//! Compiles `chmod(1)`-style permission expressions (`u+rwx,g=u,o-w`,
//! `0644`, `Fu+x`) into reusable updaters applied per archive member.
//!
//! ## Key Features:
//! - **Octal and symbolic clauses**: with the legacy rule that a bare octal
//!   clause of fewer than five digits preserves setuid/setgid on directories.
//! - **Type-qualified clauses**: an `F` or `D` prefix restricts a clause to
//!   files or directories; both variants accumulate into one updater and the
//!   right one is picked at application time.
//! - **Reference clauses**: `g=u` copies the user class bits onto the group
//!   class, bit-shifted into position.
//! - **Instance-owned caches**: compilation is memoized per expression and
//!   evaluation per `(expression, mode, is_dir)` triple; both caches live on
//!   the `ModeCompiler` value, there is no global state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;

use crate::error::BuildError;

pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_ISVTX: u32 = 0o1000;

/// The 12-bit POSIX permission space: rwx for u/g/o plus suid/sgid/sticky.
pub const MODE_MASK: u32 = 0o7777;

const CLAUSE: &str = r"(?x)
    ^
    (?P<ty>[FD])?                   # `F` or `D` restricts the clause by type
    (?:
        (?P<op1>[+=\-]?)            # operation
        (?P<oct1>0*[0-7]{3,4})      # octal mode
    |
        (?P<who>[augo]*)            # `a` or permutations of `u`, `g`, `o`
        (?P<op2>[+=\-])             # operation
        (?:
            (?P<refc>[ugo])         # reference another class
        |
            (?P<sym>[rwxXts]*)      # symbolic mode
        |
            (?P<oct2>0*[0-7]{3,4})  # octal mode
        )
    )
    $
";

/// One compiled update step. A run of octal/symbolic clauses collapses into a
/// single `Bits` step; reference clauses are not expressible as one mask pair
/// and stay discrete.
#[derive(Debug, Clone, Copy)]
enum Change {
    Bits { file_and: u32, dir_and: u32, file_or: u32, dir_or: u32 },
    Copy { src_mask: u32, keep_mask: u32, shift: i32 },
}

impl Change {
    fn apply(&self, mode: u32, is_dir: bool) -> u32 {
        match *self {
            Change::Bits { file_and, dir_and, file_or, dir_or } => {
                if is_dir {
                    (mode & dir_and) | dir_or
                } else {
                    (mode & file_and) | file_or
                }
            }
            Change::Copy { src_mask, keep_mask, shift } => {
                // Copying a class onto itself is the identity.
                if shift == 0 {
                    return mode;
                }
                let mut m = mode & keep_mask;
                if shift > 0 {
                    m |= (m & src_mask) << shift as u32;
                } else {
                    m |= (m & src_mask) >> (-shift) as u32;
                }
                m
            }
        }
    }
}

/// A compiled mode expression: a pure function
/// `(current_mode, is_dir) -> new_mode` over the 12-bit permission space.
#[derive(Debug)]
pub struct ModeUpdater {
    changes: Vec<Change>,
}

impl ModeUpdater {
    /// Apply the expression to `mode`, with `is_dir` selecting between the
    /// file and directory variants of each clause.
    pub fn apply(&self, mode: u32, is_dir: bool) -> u32 {
        self.changes.iter().fold(mode, |m, c| c.apply(m, is_dir))
    }
}

/// Permission bits for a single `(who, perm)` pair. `ty` is the clause type
/// qualifier: `X` resolves to an execute bit only under `Some('D')`.
fn class_bits(who: char, perm: char, ty: Option<char>) -> u32 {
    let shift = match who {
        'u' => 6,
        'g' => 3,
        'o' => 0,
        _ => return 0,
    };
    match perm {
        'r' => 0o4 << shift,
        'w' => 0o2 << shift,
        'x' => 0o1 << shift,
        'X' => {
            if ty == Some('D') {
                0o1 << shift
            } else {
                0
            }
        }
        's' => match who {
            'u' => S_ISUID,
            'g' => S_ISGID,
            _ => 0,
        },
        't' => {
            if who == 'o' {
                S_ISVTX
            } else {
                0
            }
        }
        // internal wildcard: the full rwx field of the class
        '*' => 0o7 << shift,
        _ => 0,
    }
}

/// OR of `class_bits` over every `(who, perm)` combination. An empty or `a`
/// who-string means all of `u`, `g`, `o`.
fn bits(who: &str, perms: &str, ty: Option<char>) -> u32 {
    let who = if who.is_empty() || who == "a" { "ugo" } else { who };
    let mut acc = 0;
    for w in who.chars() {
        if w == 'a' {
            acc |= bits("ugo", perms, ty);
            continue;
        }
        for p in perms.chars() {
            acc |= class_bits(w, p, ty);
        }
    }
    acc
}

/// AND/OR mask pair for one octal or symbolic clause, evaluated for the
/// given clause type (`'F'` or `'D'`).
fn bits_and_or(ty: char, who: &str, op: Option<char>, octal: Option<&str>, sym: &str) -> (u32, u32) {
    let mut bits_and = MODE_MASK;
    let mut bits_or = 0;

    if let Some(octal) = octal {
        let value = u32::from_str_radix(octal, 8).unwrap_or(0) & MODE_MASK;
        match op {
            None => {
                // chmod preserves suid/sgid on directories unless given 5+ digits
                bits_and = if octal.len() < 5 && ty == 'D' { S_ISUID | S_ISGID } else { 0 };
                bits_or = value;
            }
            Some('=') => bits_and = value,
            Some('+') => bits_or = value,
            Some('-') => bits_and = MODE_MASK ^ value,
            Some(_) => {}
        }
    } else {
        let value = bits(who, sym, Some(ty));
        match op {
            Some('=') => {
                bits_and = 0o777 ^ bits(who, "*", None);
                if ty == 'D' {
                    bits_and |= S_ISUID | S_ISGID;
                }
                bits_or = value;
            }
            Some('+') => bits_or = value,
            Some('-') => bits_and = MODE_MASK ^ value,
            _ => {}
        }
    }

    (bits_and, bits_or)
}

fn bit_length(v: u32) -> i32 {
    (u32::BITS - v.leading_zeros()) as i32
}

/// Build the copy transform for a reference clause: donor class `src` onto
/// recipient class `dst`, shifted so the rwx fields line up. The recipient's
/// rwx field is cleared first; all bits outside it are preserved.
fn ref_change(src: char, dst: char) -> Change {
    let src_s = src.to_string();
    let dst_s = dst.to_string();
    let src_mask = bits(&src_s, "*", None);
    let keep_mask = MODE_MASK ^ bits(&dst_s, "*", None);
    let src_p = bit_length(bits(&src_s, "x", None));
    let dst_p = bit_length(bits(&dst_s, "x", None));
    Change::Copy { src_mask, keep_mask, shift: dst_p - src_p }
}

// pending [file_and, dir_and, file_or, dir_or] accumulator
type Pending = [u32; 4];

/// Compiles mode expressions and owns the memoization caches for both
/// compilation and evaluation.
pub struct ModeCompiler {
    clause: Regex,
    compiled: RefCell<HashMap<String, Rc<ModeUpdater>>>,
    evaluated: RefCell<HashMap<(String, u32, bool), u32>>,
}

impl ModeCompiler {
    pub fn new() -> Self {
        ModeCompiler {
            clause: Regex::new(CLAUSE).expect("clause grammar regex"),
            compiled: RefCell::new(HashMap::new()),
            evaluated: RefCell::new(HashMap::new()),
        }
    }

    /// Compile `expr` into an updater, reusing a previously compiled one for
    /// the same string.
    pub fn compile(&self, expr: &str) -> Result<Rc<ModeUpdater>, BuildError> {
        if let Some(updater) = self.compiled.borrow().get(expr) {
            return Ok(Rc::clone(updater));
        }
        let updater = Rc::new(self.parse(expr)?);
        self.compiled
            .borrow_mut()
            .insert(expr.to_string(), Rc::clone(&updater));
        Ok(updater)
    }

    /// Compile `expr` and apply it to `mode`. Pure in all three inputs, so
    /// the result is memoized per `(expr, mode, is_dir)`.
    pub fn update(&self, expr: &str, mode: u32, is_dir: bool) -> Result<u32, BuildError> {
        let key = (expr.to_string(), mode, is_dir);
        if let Some(&cached) = self.evaluated.borrow().get(&key) {
            return Ok(cached);
        }
        let value = self.compile(expr)?.apply(mode, is_dir);
        self.evaluated.borrow_mut().insert(key, value);
        Ok(value)
    }

    fn parse(&self, expr: &str) -> Result<ModeUpdater, BuildError> {
        let mut changes = Vec::new();
        let mut pending: Option<Pending> = None;

        for clause in expr.split(',') {
            let caps = self
                .clause
                .captures(clause)
                .ok_or_else(|| BuildError::Grammar(expr.to_string()))?;

            let ty = caps.name("ty").and_then(|m| m.as_str().chars().next());
            let who = caps.name("who").map_or("", |m| m.as_str());
            let op = caps
                .name("op1")
                .or_else(|| caps.name("op2"))
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .and_then(|s| s.chars().next());
            let octal = caps
                .name("oct1")
                .or_else(|| caps.name("oct2"))
                .map(|m| m.as_str());
            let sym = caps.name("sym").map_or("", |m| m.as_str());

            if let Some(r) = caps.name("refc").and_then(|m| m.as_str().chars().next()) {
                // Reference clauses cannot fold into a mask pair: commit any
                // pending pair first, then inject one copy step per recipient.
                if let Some(p) = pending.take() {
                    changes.push(Change::Bits {
                        file_and: p[0],
                        dir_and: p[1],
                        file_or: p[2],
                        dir_or: p[3],
                    });
                }
                for c in who.chars() {
                    changes.push(ref_change(r, c));
                }
            } else {
                let p = pending.get_or_insert([MODE_MASK, MODE_MASK, 0, 0]);
                if ty != Some('D') {
                    let (a, o) = bits_and_or('F', who, op, octal, sym);
                    p[0] &= a;
                    p[2] = (p[2] & a) | o;
                }
                if ty != Some('F') {
                    let (a, o) = bits_and_or('D', who, op, octal, sym);
                    p[1] &= a;
                    p[3] = (p[3] & a) | o;
                }
            }
        }

        if let Some(p) = pending {
            changes.push(Change::Bits {
                file_and: p[0],
                dir_and: p[1],
                file_or: p[2],
                dir_or: p[3],
            });
        }

        Ok(ModeUpdater { changes })
    }
}

impl Default for ModeCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(expr: &str, mode: u32, is_dir: bool) -> u32 {
        ModeCompiler::new().update(expr, mode, is_dir).unwrap()
    }

    #[test]
    fn octal_replaces_all_bits_on_files() {
        assert_eq!(update("0644", 0o7770, false), 0o644);
        assert_eq!(update("644", 0o7770, false), 0o644);
    }

    #[test]
    fn short_octal_preserves_suid_sgid_on_directories() {
        assert_eq!(update("0644", 0o7770, true), 0o644 | (0o7770 & (S_ISUID | S_ISGID)));
        // five digits disables the preservation rule
        assert_eq!(update("00644", 0o7770, true), 0o644);
    }

    #[test]
    fn plus_ors_in_only_named_bits() {
        assert_eq!(update("u+x", 0o644, false), 0o744);
        assert_eq!(update("+111", 0o644, false), 0o755);
        assert_eq!(update("go+w", 0o644, false), 0o666);
    }

    #[test]
    fn minus_clears_only_named_bits() {
        assert_eq!(update("o-w", 0o666, false), 0o664);
        assert_eq!(update("a-x", 0o755, false), 0o644);
        assert_eq!(update("-022", 0o777, false), 0o755);
    }

    #[test]
    fn assign_clears_scope_before_setting() {
        // `u=rw` keeps only bits outside the cleared scope, then ORs in rw
        assert_eq!(update("u=rw", 0o777, false), 0o677);
        assert_eq!(update("a=r", 0o7777, false), 0o444);
    }

    #[test]
    fn capital_x_applies_to_directories_only() {
        assert_eq!(update("a=rX", 0o777, true), 0o555);
        assert_eq!(update("a=rX", 0o777, false), 0o444);
        // never granted for files, even ones that already had an execute bit
        assert_eq!(update("a+X", 0o711, false), 0o711);
        assert_eq!(update("a+X", 0o700, true), 0o711);
    }

    #[test]
    fn suid_sgid_sticky_symbols() {
        assert_eq!(update("u+s", 0o755, false), 0o4755);
        assert_eq!(update("g+s", 0o755, false), 0o2755);
        assert_eq!(update("o+t", 0o777, true), 0o1777);
        // `s` for others and `t` for user/group are no-ops
        assert_eq!(update("o+s", 0o755, false), 0o755);
        assert_eq!(update("u+t", 0o755, false), 0o755);
    }

    #[test]
    fn reference_copies_class_bits() {
        assert_eq!(update("g=u", 0o640, false), 0o660);
        assert_eq!(update("o=u", 0o750, false), 0o757);
        assert_eq!(update("u=o", 0o752, false), 0o252);
        // equal classes are the identity
        assert_eq!(update("u=u", 0o7123, false), 0o7123);
    }

    #[test]
    fn clauses_compose_left_to_right() {
        assert_eq!(update("u+rwx,g=u,o-w", 0o642, false), 0o770);
        assert_eq!(update("a=r,u+w", 0o777, false), 0o644);
    }

    #[test]
    fn type_qualified_clauses_accumulate_independently() {
        assert_eq!(update("F644,D755", 0o777, false), 0o644);
        assert_eq!(update("F644,D755", 0o777, true), 0o755);
        assert_eq!(update("Fu+x", 0o644, true), 0o644);
        assert_eq!(update("Fu+x", 0o644, false), 0o744);
    }

    #[test]
    fn assignment_is_idempotent() {
        for &mode in &[0o0, 0o644, 0o755, 0o7777] {
            for &is_dir in &[false, true] {
                let once = update("a=rwX", mode, is_dir);
                assert_eq!(update("a=rwX", once, is_dir), once);
            }
        }
    }

    #[test]
    fn compilation_is_cached_per_expression() {
        let compiler = ModeCompiler::new();
        let a = compiler.compile("u+x").unwrap();
        let b = compiler.compile("u+x").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn bad_expressions_are_grammar_errors() {
        let compiler = ModeCompiler::new();
        for expr in ["u~x", "z+r", "u+q", "u+x,", "778", "12", ""] {
            match compiler.compile(expr) {
                Err(BuildError::Grammar(s)) => assert_eq!(s, expr),
                other => panic!("expected grammar error for {expr:?}, got {other:?}"),
            }
        }
    }
}
