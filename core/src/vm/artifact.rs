//! LATC artifact container.
//!
//! Layout: magic `LATC`, `u16` version, `u16` reserved, `u32` flags, then tagged
//! sections (`[u8; 4]` tag, `u32` length, payload):
//!
//! * `CHNK` entry chunk (required)
//! * `META` serde_json metadata
//! * `MODS` bundled modules resolved by `import` before the filesystem
//! * `DBG!` opaque debug blob
//!
//! All integers are little endian. The encoder emits sections in the order
//! above followed by any unrecognised sections the decoder preserved, so
//! `encode(decode(bytes)) == bytes` for every artifact this module produced.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::val::{Val, ValKind};

use super::bytecode::{CaptureKind, Chunk, Op, PhaseConstraint, StructDecl, VarLoc};

const MAGIC: [u8; 4] = *b"LATC";
pub const CURRENT_VERSION: u16 = 1;
/// File extension of serialized artifacts.
pub const ARTIFACT_EXTENSION: &str = "latc";

/// Feature bits recorded by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtifactFlags(u32);

impl ArtifactFlags {
    pub const NONE: ArtifactFlags = ArtifactFlags(0);
    /// Debug tables (local names, line table) are populated.
    pub const DEBUG_INFO: ArtifactFlags = ArtifactFlags(1 << 0);
    /// Produced with integer fast-path instructions.
    pub const INT_FAST_PATHS: ArtifactFlags = ArtifactFlags(1 << 1);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> ArtifactFlags {
        ArtifactFlags(bits)
    }

    #[inline]
    pub const fn contains(self, other: ArtifactFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: ArtifactFlags) {
        self.0 |= other.0;
    }
}

/// Optional description of the source that produced the artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub source: Option<String>,
    pub compiler: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ArtifactMeta {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.compiler.is_none() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub version: u16,
    pub flags: ArtifactFlags,
    pub entry: Chunk,
    pub meta: Option<ArtifactMeta>,
    pub modules: Vec<BundledModule>,
    pub debug: Option<Vec<u8>>,
    /// Sections this reader does not understand, kept for re-encoding.
    pub extra_sections: Vec<([u8; 4], Vec<u8>)>,
}

/// A module shipped inside another artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct BundledModule {
    /// Import path the module answers to.
    pub path: String,
    pub artifact: Artifact,
}

impl Artifact {
    pub fn new(entry: Chunk) -> Self {
        Self {
            version: CURRENT_VERSION,
            flags: ArtifactFlags::NONE,
            entry,
            meta: None,
            modules: Vec::new(),
            debug: None,
            extra_sections: Vec::new(),
        }
    }

    pub fn bundled(&self, path: &str) -> Option<&Artifact> {
        self.modules.iter().find(|m| m.path == path).map(|m| &m.artifact)
    }

    pub fn read_file(path: &Path) -> Result<Artifact> {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        decode(&bytes).with_context(|| format!("failed to decode {}", path.display()))
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let bytes = encode(self)?;
        std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Header and section directory, for inspection without decoding chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub version: u16,
    pub flags: ArtifactFlags,
    pub sections: Vec<(String, usize)>,
}

pub fn encode(artifact: &Artifact) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    write_u16(&mut out, artifact.version);
    write_u16(&mut out, 0); // reserved
    write_u32(&mut out, artifact.flags.bits());

    let chunk_payload = encode_chunk(&artifact.entry)?;
    write_section(&mut out, *b"CHNK", &chunk_payload)?;

    if let Some(meta) = artifact.meta.as_ref().filter(|m| !m.is_empty()) {
        let meta_payload = serde_json::to_vec(meta)?;
        write_section(&mut out, *b"META", &meta_payload)?;
    }

    if !artifact.modules.is_empty() {
        let mods_payload = encode_bundled(&artifact.modules)?;
        write_section(&mut out, *b"MODS", &mods_payload)?;
    }

    if let Some(debug) = artifact.debug.as_ref() {
        write_section(&mut out, *b"DBG!", debug)?;
    }

    for (tag, payload) in &artifact.extra_sections {
        write_section(&mut out, *tag, payload)?;
    }

    debug!(target: "lattice::artifact", bytes = out.len(), chunk = %artifact.entry.name, "artifact.encode");
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Artifact> {
    let (version, flags, mut cursor) = read_header(bytes)?;

    let mut entry: Option<Chunk> = None;
    let mut meta: Option<ArtifactMeta> = None;
    let mut debug: Option<Vec<u8>> = None;
    let mut modules: Vec<BundledModule> = Vec::new();
    let mut extra_sections = Vec::new();

    while cursor < bytes.len() {
        let (tag, payload) = read_section(bytes, &mut cursor)?;
        match &tag {
            b"CHNK" => {
                ensure!(entry.is_none(), "duplicate CHNK section");
                let mut inner = 0usize;
                let chunk = decode_chunk(payload, &mut inner)?;
                ensure!(inner == payload.len(), "trailing data in CHNK section");
                entry = Some(chunk);
            }
            b"META" => {
                ensure!(meta.is_none(), "duplicate META section");
                meta = Some(serde_json::from_slice(payload).context("invalid META section")?);
            }
            b"MODS" => {
                ensure!(modules.is_empty(), "duplicate MODS section");
                modules = decode_bundled(payload)?;
            }
            b"DBG!" => {
                ensure!(debug.is_none(), "duplicate DBG! section");
                debug = Some(payload.to_vec());
            }
            _ => extra_sections.push((tag, payload.to_vec())),
        }
    }

    let entry = entry.ok_or_else(|| anyhow!("missing CHNK section"))?;
    debug!(target: "lattice::artifact", bytes = bytes.len(), chunk = %entry.name, "artifact.decode");

    Ok(Artifact {
        version,
        flags,
        entry,
        meta,
        modules,
        debug,
        extra_sections,
    })
}

/// Read the header and section directory only.
pub fn inspect(bytes: &[u8]) -> Result<ArtifactHeader> {
    let (version, flags, mut cursor) = read_header(bytes)?;
    let mut sections = Vec::new();
    while cursor < bytes.len() {
        let (tag, payload) = read_section(bytes, &mut cursor)?;
        sections.push((String::from_utf8_lossy(&tag).into_owned(), payload.len()));
    }
    Ok(ArtifactHeader {
        version,
        flags,
        sections,
    })
}

fn read_header(bytes: &[u8]) -> Result<(u16, ArtifactFlags, usize)> {
    ensure!(bytes.len() >= 12, "artifact too small");
    ensure!(bytes[..4] == MAGIC, "invalid LATC magic");
    let mut cursor = 4;
    let version = read_u16(bytes, &mut cursor)?;
    let _reserved = read_u16(bytes, &mut cursor)?;
    let flags = ArtifactFlags::from_bits(read_u32(bytes, &mut cursor)?);
    ensure!(
        version <= CURRENT_VERSION,
        "unsupported LATC version {} (reader supports <= {})",
        version,
        CURRENT_VERSION
    );
    Ok((version, flags, cursor))
}

fn read_section<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<([u8; 4], &'a [u8])> {
    let tag = read_tag(bytes, cursor)?;
    let len = read_u32(bytes, cursor)? as usize;
    ensure!(*cursor + len <= bytes.len(), "section overruns payload");
    let payload = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok((tag, payload))
}

fn write_section(out: &mut Vec<u8>, tag: [u8; 4], payload: &[u8]) -> Result<()> {
    out.extend_from_slice(&tag);
    write_len32(out, payload.len(), "section")?;
    out.extend_from_slice(payload);
    Ok(())
}

fn encode_bundled(modules: &[BundledModule]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_len32(&mut out, modules.len(), "bundled module list")?;
    for bundled in modules {
        write_str(&mut out, &bundled.path)?;
        let bytes = encode(&bundled.artifact)?;
        write_len32(&mut out, bytes.len(), "bundled module")?;
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

fn decode_bundled(bytes: &[u8]) -> Result<Vec<BundledModule>> {
    let mut cursor = 0usize;
    let count = read_u32(bytes, &mut cursor)? as usize;
    let mut modules = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let path = read_string(bytes, &mut cursor)?;
        let len = read_u32(bytes, &mut cursor)? as usize;
        ensure!(cursor + len <= bytes.len(), "bundled module overruns payload");
        let artifact = decode(&bytes[cursor..cursor + len]).with_context(|| format!("bundled module '{path}'"))?;
        cursor += len;
        modules.push(BundledModule { path, artifact });
    }
    ensure!(cursor == bytes.len(), "unexpected trailing data in MODS section");
    Ok(modules)
}

fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>> {
    ensure!(
        chunk.lines.len() == chunk.code.len(),
        "line table of '{}' has {} entries for {} instructions",
        chunk.name,
        chunk.lines.len(),
        chunk.code.len()
    );
    let mut out = Vec::new();
    write_str(&mut out, &chunk.name)?;
    write_u16(&mut out, chunk.arity);
    write_u8(&mut out, chunk.variadic as u8);
    write_u16(&mut out, chunk.max_regs);

    write_len32(&mut out, chunk.consts.len(), "constant pool")?;
    for k in &chunk.consts {
        encode_const(&mut out, k)?;
    }

    write_len32(&mut out, chunk.code.len(), "instruction stream")?;
    for op in &chunk.code {
        encode_op(&mut out, op);
    }
    for line in &chunk.lines {
        write_u32(&mut out, *line);
    }

    write_len16(&mut out, chunk.local_names.len(), "local name table")?;
    for name in &chunk.local_names {
        match name {
            Some(name) => {
                write_u8(&mut out, 1);
                write_str(&mut out, name)?;
            }
            None => write_u8(&mut out, 0),
        }
    }

    write_len16(&mut out, chunk.defaults.len(), "default list")?;
    for value in &chunk.defaults {
        encode_const(&mut out, value)?;
    }

    write_len16(&mut out, chunk.param_phases.len(), "parameter phase list")?;
    for phase in &chunk.param_phases {
        write_u8(
            &mut out,
            match phase {
                PhaseConstraint::Any => 0,
                PhaseConstraint::Fluid => 1,
                PhaseConstraint::Crystal => 2,
            },
        );
    }

    match &chunk.exports {
        Some(names) => {
            write_u8(&mut out, 1);
            write_len16(&mut out, names.len(), "export list")?;
            for name in names {
                write_str(&mut out, name)?;
            }
        }
        None => write_u8(&mut out, 0),
    }

    write_len16(&mut out, chunk.structs.len(), "struct table")?;
    for decl in &chunk.structs {
        write_str(&mut out, &decl.name)?;
        write_len16(&mut out, decl.fields.len(), "struct field list")?;
        for field in &decl.fields {
            write_str(&mut out, field)?;
        }
    }

    write_len16(&mut out, chunk.protos.len(), "nested function list")?;
    for proto in &chunk.protos {
        let nested = encode_chunk(proto)?;
        write_len32(&mut out, nested.len(), "nested function")?;
        out.extend_from_slice(&nested);
    }

    Ok(out)
}

fn decode_chunk(bytes: &[u8], cursor: &mut usize) -> Result<Chunk> {
    let name: Arc<str> = Arc::from(read_string(bytes, cursor)?);
    let arity = read_u16(bytes, cursor)?;
    let variadic = read_u8(bytes, cursor)? != 0;
    let max_regs = read_u16(bytes, cursor)?;

    let const_len = read_u32(bytes, cursor)? as usize;
    let mut consts = Vec::with_capacity(const_len.min(4096));
    for _ in 0..const_len {
        consts.push(decode_const(bytes, cursor)?);
    }

    let code_len = read_u32(bytes, cursor)? as usize;
    let mut code = Vec::with_capacity(code_len.min(1 << 16));
    for _ in 0..code_len {
        code.push(decode_op(bytes, cursor)?);
    }
    let mut lines = Vec::with_capacity(code.len());
    for _ in 0..code_len {
        lines.push(read_u32(bytes, cursor)?);
    }

    let names_len = read_u16(bytes, cursor)? as usize;
    let mut local_names = Vec::with_capacity(names_len);
    for _ in 0..names_len {
        local_names.push(match read_u8(bytes, cursor)? {
            0 => None,
            1 => Some(Arc::from(read_string(bytes, cursor)?)),
            other => bail!("invalid local name marker {other}"),
        });
    }

    let defaults_len = read_u16(bytes, cursor)? as usize;
    let mut defaults = Vec::with_capacity(defaults_len);
    for _ in 0..defaults_len {
        defaults.push(decode_const(bytes, cursor)?);
    }

    let phases_len = read_u16(bytes, cursor)? as usize;
    let mut param_phases = Vec::with_capacity(phases_len);
    for _ in 0..phases_len {
        param_phases.push(match read_u8(bytes, cursor)? {
            0 => PhaseConstraint::Any,
            1 => PhaseConstraint::Fluid,
            2 => PhaseConstraint::Crystal,
            other => bail!("invalid phase constraint {other}"),
        });
    }

    let exports = match read_u8(bytes, cursor)? {
        0 => None,
        1 => {
            let len = read_u16(bytes, cursor)? as usize;
            let mut names = Vec::with_capacity(len);
            for _ in 0..len {
                names.push(Arc::from(read_string(bytes, cursor)?));
            }
            Some(names)
        }
        other => bail!("invalid export marker {other}"),
    };

    let structs_len = read_u16(bytes, cursor)? as usize;
    let mut structs = Vec::with_capacity(structs_len);
    for _ in 0..structs_len {
        let name = Arc::from(read_string(bytes, cursor)?);
        let field_len = read_u16(bytes, cursor)? as usize;
        let mut fields = Vec::with_capacity(field_len);
        for _ in 0..field_len {
            fields.push(Arc::from(read_string(bytes, cursor)?));
        }
        structs.push(StructDecl { name, fields });
    }

    let protos_len = read_u16(bytes, cursor)? as usize;
    let mut protos = Vec::with_capacity(protos_len);
    for _ in 0..protos_len {
        let len = read_u32(bytes, cursor)? as usize;
        ensure!(*cursor + len <= bytes.len(), "nested function overruns payload");
        let nested_bytes = &bytes[*cursor..*cursor + len];
        let mut inner = 0usize;
        let nested = decode_chunk(nested_bytes, &mut inner)?;
        ensure!(inner == len, "trailing data in nested function '{}'", nested.name);
        *cursor += len;
        protos.push(Arc::new(nested));
    }

    let chunk = Chunk {
        name,
        code,
        lines,
        consts,
        protos,
        local_names,
        arity,
        variadic,
        defaults,
        param_phases,
        exports,
        structs,
        max_regs,
    };
    validate(&chunk)?;
    Ok(chunk)
}

/// Reject references the engine could never satisfy.
fn validate(chunk: &Chunk) -> Result<()> {
    let consts = chunk.consts.len();
    let protos = chunk.protos.len();
    for (ip, op) in chunk.code.iter().enumerate() {
        let ok = match *op {
            Op::LoadK(_, k)
            | Op::DefineGlobal(_, k)
            | Op::GetGlobal(_, k)
            | Op::SetGlobal(_, k)
            | Op::GetField(_, _, k)
            | Op::SetField(_, k, _)
            | Op::Import(_, k)
            | Op::NewStruct { name: k, .. }
            | Op::Invoke { method: k, .. }
            | Op::FreezeVar { name: k, .. }
            | Op::ThawVar { name: k, .. }
            | Op::SublimateVar { name: k, .. }
            | Op::Bond { target: k, .. }
            | Op::Unbond { target: k, .. } => (k as usize) < consts,
            Op::NewEnum { name, variant, .. } => (name as usize) < consts && (variant as usize) < consts,
            Op::Closure { proto, .. } => (proto as usize) < protos,
            _ => true,
        };
        ensure!(ok, "'{}' instruction {ip} ({op:?}) references a missing entry", chunk.name);
        ensure!(
            op.register_extent() <= chunk.max_regs.max(1),
            "'{}' instruction {ip} ({op:?}) exceeds its {} registers",
            chunk.name,
            chunk.max_regs
        );
    }
    Ok(())
}

fn encode_const(out: &mut Vec<u8>, val: &Val) -> Result<()> {
    match &val.kind {
        ValKind::Nil => write_u8(out, 0),
        ValKind::Unit => write_u8(out, 1),
        ValKind::Bool(b) => write_u8(out, if *b { 3 } else { 2 }),
        ValKind::Int(i) => {
            write_u8(out, 4);
            write_i64(out, *i);
        }
        ValKind::Float(f) => {
            write_u8(out, 5);
            write_u64(out, f.to_bits());
        }
        ValKind::Str(s) => {
            write_u8(out, 6);
            write_str(out, s)?;
        }
        _ => bail!("cannot encode constant of type {} into LATC", val.type_name()),
    }
    Ok(())
}

fn decode_const(bytes: &[u8], cursor: &mut usize) -> Result<Val> {
    Ok(match read_u8(bytes, cursor)? {
        0 => Val::nil(),
        1 => Val::unit(),
        2 => Val::bool(false),
        3 => Val::bool(true),
        4 => Val::int(read_i64(bytes, cursor)?),
        5 => Val::float(f64::from_bits(read_u64(bytes, cursor)?)),
        6 => Val::str(read_string(bytes, cursor)?),
        other => bail!("unknown constant tag {other}"),
    })
}

fn encode_loc(loc: VarLoc) -> u8 {
    match loc {
        VarLoc::Local => 0,
        VarLoc::Upvalue => 1,
        VarLoc::Global => 2,
    }
}

fn decode_loc(tag: u8) -> Result<VarLoc> {
    Ok(match tag {
        0 => VarLoc::Local,
        1 => VarLoc::Upvalue,
        2 => VarLoc::Global,
        other => bail!("invalid variable location {other}"),
    })
}

fn encode_op(out: &mut Vec<u8>, op: &Op) {
    match *op {
        Op::Move(a, b) => encode_regs(out, 0, &[a, b]),
        Op::LoadK(a, k) => encode_regs(out, 1, &[a, k]),
        Op::LoadInt(a, v) => {
            encode_regs(out, 2, &[a]);
            write_i32(out, v);
        }
        Op::LoadNil(a) => encode_regs(out, 3, &[a]),
        Op::LoadTrue(a) => encode_regs(out, 4, &[a]),
        Op::LoadFalse(a) => encode_regs(out, 5, &[a]),
        Op::LoadUnit(a) => encode_regs(out, 6, &[a]),
        Op::Add(a, b, c) => encode_regs(out, 10, &[a, b, c]),
        Op::Sub(a, b, c) => encode_regs(out, 11, &[a, b, c]),
        Op::Mul(a, b, c) => encode_regs(out, 12, &[a, b, c]),
        Op::Div(a, b, c) => encode_regs(out, 13, &[a, b, c]),
        Op::Mod(a, b, c) => encode_regs(out, 14, &[a, b, c]),
        Op::Concat(a, b, c) => encode_regs(out, 15, &[a, b, c]),
        Op::Neg(a, b) => encode_regs(out, 16, &[a, b]),
        Op::AddImm(a, b, imm) => {
            encode_regs(out, 17, &[a, b]);
            write_u16(out, imm as u16);
        }
        Op::AddInt(a, b, c) => encode_regs(out, 20, &[a, b, c]),
        Op::SubInt(a, b, c) => encode_regs(out, 21, &[a, b, c]),
        Op::MulInt(a, b, c) => encode_regs(out, 22, &[a, b, c]),
        Op::LtInt(a, b, c) => encode_regs(out, 23, &[a, b, c]),
        Op::LtEqInt(a, b, c) => encode_regs(out, 24, &[a, b, c]),
        Op::IncReg(a) => encode_regs(out, 25, &[a]),
        Op::DecReg(a) => encode_regs(out, 26, &[a]),
        Op::Eq(a, b, c) => encode_regs(out, 30, &[a, b, c]),
        Op::NotEq(a, b, c) => encode_regs(out, 31, &[a, b, c]),
        Op::Lt(a, b, c) => encode_regs(out, 32, &[a, b, c]),
        Op::LtEq(a, b, c) => encode_regs(out, 33, &[a, b, c]),
        Op::Gt(a, b, c) => encode_regs(out, 34, &[a, b, c]),
        Op::GtEq(a, b, c) => encode_regs(out, 35, &[a, b, c]),
        Op::Not(a, b) => encode_regs(out, 36, &[a, b]),
        Op::BitAnd(a, b, c) => encode_regs(out, 40, &[a, b, c]),
        Op::BitOr(a, b, c) => encode_regs(out, 41, &[a, b, c]),
        Op::BitXor(a, b, c) => encode_regs(out, 42, &[a, b, c]),
        Op::BitNot(a, b) => encode_regs(out, 43, &[a, b]),
        Op::Shl(a, b, c) => encode_regs(out, 44, &[a, b, c]),
        Op::Shr(a, b, c) => encode_regs(out, 45, &[a, b, c]),
        Op::Jmp(o) => {
            write_u8(out, 50);
            write_i32(out, o);
        }
        Op::JmpFalse(a, o) => encode_jump(out, 51, a, o),
        Op::JmpTrue(a, o) => encode_jump(out, 52, a, o),
        Op::JmpNotNil(a, o) => encode_jump(out, 53, a, o),
        Op::DefineGlobal(a, k) => encode_regs(out, 60, &[a, k]),
        Op::GetGlobal(a, k) => encode_regs(out, 61, &[a, k]),
        Op::SetGlobal(a, k) => encode_regs(out, 62, &[a, k]),
        Op::GetUpvalue(a, i) => encode_regs(out, 63, &[a, i]),
        Op::SetUpvalue(a, i) => encode_regs(out, 64, &[a, i]),
        Op::CloseUpvalue(a) => encode_regs(out, 65, &[a]),
        Op::GetField(a, b, k) => encode_regs(out, 70, &[a, b, k]),
        Op::SetField(a, k, b) => encode_regs(out, 71, &[a, k, b]),
        Op::GetIndex(a, b, c) => encode_regs(out, 72, &[a, b, c]),
        Op::SetIndex(a, b, c) => encode_regs(out, 73, &[a, b, c]),
        Op::Len(a, b) => encode_regs(out, 74, &[a, b]),
        Op::Call { func, argc } => encode_regs(out, 80, &[func, argc]),
        Op::Return(a) => encode_regs(out, 81, &[a]),
        Op::Closure { dst, proto, captures } => encode_regs(out, 82, &[dst, proto, captures]),
        Op::Capture(kind, index) => {
            write_u8(out, 83);
            write_u8(
                out,
                match kind {
                    CaptureKind::Local => 0,
                    CaptureKind::Upvalue => 1,
                    CaptureKind::Copy => 2,
                },
            );
            write_u16(out, index);
        }
        Op::NewArray { dst, base, count } => encode_regs(out, 90, &[dst, base, count]),
        Op::NewTuple { dst, base, count } => encode_regs(out, 91, &[dst, base, count]),
        Op::NewMap { dst, base, count } => encode_regs(out, 92, &[dst, base, count]),
        Op::NewSet { dst, base, count } => encode_regs(out, 93, &[dst, base, count]),
        Op::NewStruct { dst, name, base, count } => encode_regs(out, 94, &[dst, name, base, count]),
        Op::NewEnum {
            dst,
            name,
            variant,
            base,
            count,
        } => encode_regs(out, 95, &[dst, name, variant, base, count]),
        Op::BuildRange(a, b, c) => encode_regs(out, 96, &[a, b, c]),
        Op::NewRef(a, b) => encode_regs(out, 97, &[a, b]),
        Op::NewBuffer(a, b) => encode_regs(out, 98, &[a, b]),
        Op::Invoke {
            dst,
            obj,
            method,
            base,
            argc,
        } => encode_regs(out, 100, &[dst, obj, method, base, argc]),
        Op::IterInit(a, b) => encode_regs(out, 101, &[a, b]),
        Op::IterNext { dst, iter, offset } => {
            encode_regs(out, 102, &[dst, iter]);
            write_i32(out, offset);
        }
        Op::Freeze(a, b) => encode_regs(out, 110, &[a, b]),
        Op::Thaw(a, b) => encode_regs(out, 111, &[a, b]),
        Op::Clone(a, b) => encode_regs(out, 112, &[a, b]),
        Op::MarkFluid(a) => encode_regs(out, 113, &[a]),
        Op::IsCrystal(a, b) => encode_regs(out, 114, &[a, b]),
        Op::IsFluid(a, b) => encode_regs(out, 115, &[a, b]),
        Op::PushHandler { reg, offset } => encode_jump(out, 120, reg, offset),
        Op::PopHandler => write_u8(out, 121),
        Op::Throw(a) => encode_regs(out, 122, &[a]),
        Op::TryUnwrap(a) => encode_regs(out, 123, &[a]),
        Op::DeferPush { depth, offset } => {
            write_u8(out, 130);
            write_u8(out, depth);
            write_i32(out, offset);
        }
        Op::DeferRun(min) => {
            write_u8(out, 131);
            write_u8(out, min);
        }
        Op::DeferEnd => write_u8(out, 132),
        Op::CollectVarargs { dst, from } => encode_regs(out, 140, &[dst, from]),
        Op::FreezeVar {
            name,
            loc,
            slot,
            consume_seeds,
        } => {
            encode_var(out, 150, name, loc, slot);
            write_u8(out, consume_seeds as u8);
        }
        Op::ThawVar { name, loc, slot } => encode_var(out, 151, name, loc, slot),
        Op::SublimateVar { name, loc, slot } => encode_var(out, 152, name, loc, slot),
        Op::React { name, callback } => encode_regs(out, 153, &[name, callback]),
        Op::Unreact(a) => encode_regs(out, 154, &[a]),
        Op::Bond { target, dep, strategy } => encode_regs(out, 155, &[target, dep, strategy]),
        Op::Unbond { target, dep } => encode_regs(out, 156, &[target, dep]),
        Op::Seed { name, contract } => encode_regs(out, 157, &[name, contract]),
        Op::Unseed(a) => encode_regs(out, 158, &[a]),
        Op::Import(a, k) => encode_regs(out, 160, &[a, k]),
        Op::Scope { dst, base, spawns } => encode_regs(out, 161, &[dst, base, spawns]),
        Op::Select { dst, base, arms } => encode_regs(out, 162, &[dst, base, arms]),
        Op::ResetEphemeral => write_u8(out, 163),
        Op::Print { base, count } => encode_regs(out, 164, &[base, count]),
        Op::Halt => write_u8(out, 165),
    }
}

fn encode_regs(out: &mut Vec<u8>, tag: u8, operands: &[u16]) {
    write_u8(out, tag);
    for operand in operands {
        write_u16(out, *operand);
    }
}

fn encode_jump(out: &mut Vec<u8>, tag: u8, reg: u16, offset: i32) {
    encode_regs(out, tag, &[reg]);
    write_i32(out, offset);
}

fn encode_var(out: &mut Vec<u8>, tag: u8, name: u16, loc: VarLoc, slot: u16) {
    write_u8(out, tag);
    write_u16(out, name);
    write_u8(out, encode_loc(loc));
    write_u16(out, slot);
}

fn decode_op(bytes: &[u8], cursor: &mut usize) -> Result<Op> {
    let tag = read_u8(bytes, cursor)?;
    let mut r = || read_u16(bytes, cursor);
    let op = match tag {
        0 => Op::Move(r()?, r()?),
        1 => Op::LoadK(r()?, r()?),
        2 => {
            let a = r()?;
            Op::LoadInt(a, read_i32(bytes, cursor)?)
        }
        3 => Op::LoadNil(r()?),
        4 => Op::LoadTrue(r()?),
        5 => Op::LoadFalse(r()?),
        6 => Op::LoadUnit(r()?),
        10 => Op::Add(r()?, r()?, r()?),
        11 => Op::Sub(r()?, r()?, r()?),
        12 => Op::Mul(r()?, r()?, r()?),
        13 => Op::Div(r()?, r()?, r()?),
        14 => Op::Mod(r()?, r()?, r()?),
        15 => Op::Concat(r()?, r()?, r()?),
        16 => Op::Neg(r()?, r()?),
        17 => Op::AddImm(r()?, r()?, r()? as i16),
        20 => Op::AddInt(r()?, r()?, r()?),
        21 => Op::SubInt(r()?, r()?, r()?),
        22 => Op::MulInt(r()?, r()?, r()?),
        23 => Op::LtInt(r()?, r()?, r()?),
        24 => Op::LtEqInt(r()?, r()?, r()?),
        25 => Op::IncReg(r()?),
        26 => Op::DecReg(r()?),
        30 => Op::Eq(r()?, r()?, r()?),
        31 => Op::NotEq(r()?, r()?, r()?),
        32 => Op::Lt(r()?, r()?, r()?),
        33 => Op::LtEq(r()?, r()?, r()?),
        34 => Op::Gt(r()?, r()?, r()?),
        35 => Op::GtEq(r()?, r()?, r()?),
        36 => Op::Not(r()?, r()?),
        40 => Op::BitAnd(r()?, r()?, r()?),
        41 => Op::BitOr(r()?, r()?, r()?),
        42 => Op::BitXor(r()?, r()?, r()?),
        43 => Op::BitNot(r()?, r()?),
        44 => Op::Shl(r()?, r()?, r()?),
        45 => Op::Shr(r()?, r()?, r()?),
        50 => Op::Jmp(read_i32(bytes, cursor)?),
        51..=53 => {
            let a = r()?;
            let o = read_i32(bytes, cursor)?;
            match tag {
                51 => Op::JmpFalse(a, o),
                52 => Op::JmpTrue(a, o),
                _ => Op::JmpNotNil(a, o),
            }
        }
        60 => Op::DefineGlobal(r()?, r()?),
        61 => Op::GetGlobal(r()?, r()?),
        62 => Op::SetGlobal(r()?, r()?),
        63 => Op::GetUpvalue(r()?, r()?),
        64 => Op::SetUpvalue(r()?, r()?),
        65 => Op::CloseUpvalue(r()?),
        70 => Op::GetField(r()?, r()?, r()?),
        71 => Op::SetField(r()?, r()?, r()?),
        72 => Op::GetIndex(r()?, r()?, r()?),
        73 => Op::SetIndex(r()?, r()?, r()?),
        74 => Op::Len(r()?, r()?),
        80 => Op::Call { func: r()?, argc: r()? },
        81 => Op::Return(r()?),
        82 => Op::Closure {
            dst: r()?,
            proto: r()?,
            captures: r()?,
        },
        83 => {
            let kind = match read_u8(bytes, cursor)? {
                0 => CaptureKind::Local,
                1 => CaptureKind::Upvalue,
                2 => CaptureKind::Copy,
                other => bail!("invalid capture kind {other}"),
            };
            Op::Capture(kind, read_u16(bytes, cursor)?)
        }
        90 => Op::NewArray {
            dst: r()?,
            base: r()?,
            count: r()?,
        },
        91 => Op::NewTuple {
            dst: r()?,
            base: r()?,
            count: r()?,
        },
        92 => Op::NewMap {
            dst: r()?,
            base: r()?,
            count: r()?,
        },
        93 => Op::NewSet {
            dst: r()?,
            base: r()?,
            count: r()?,
        },
        94 => Op::NewStruct {
            dst: r()?,
            name: r()?,
            base: r()?,
            count: r()?,
        },
        95 => Op::NewEnum {
            dst: r()?,
            name: r()?,
            variant: r()?,
            base: r()?,
            count: r()?,
        },
        96 => Op::BuildRange(r()?, r()?, r()?),
        97 => Op::NewRef(r()?, r()?),
        98 => Op::NewBuffer(r()?, r()?),
        100 => Op::Invoke {
            dst: r()?,
            obj: r()?,
            method: r()?,
            base: r()?,
            argc: r()?,
        },
        101 => Op::IterInit(r()?, r()?),
        102 => {
            let dst = r()?;
            let iter = r()?;
            Op::IterNext {
                dst,
                iter,
                offset: read_i32(bytes, cursor)?,
            }
        }
        110 => Op::Freeze(r()?, r()?),
        111 => Op::Thaw(r()?, r()?),
        112 => Op::Clone(r()?, r()?),
        113 => Op::MarkFluid(r()?),
        114 => Op::IsCrystal(r()?, r()?),
        115 => Op::IsFluid(r()?, r()?),
        120 => {
            let reg = r()?;
            Op::PushHandler {
                reg,
                offset: read_i32(bytes, cursor)?,
            }
        }
        121 => Op::PopHandler,
        122 => Op::Throw(r()?),
        123 => Op::TryUnwrap(r()?),
        130 => {
            let depth = read_u8(bytes, cursor)?;
            Op::DeferPush {
                depth,
                offset: read_i32(bytes, cursor)?,
            }
        }
        131 => Op::DeferRun(read_u8(bytes, cursor)?),
        132 => Op::DeferEnd,
        140 => Op::CollectVarargs { dst: r()?, from: r()? },
        150..=152 => {
            let name = read_u16(bytes, cursor)?;
            let loc = decode_loc(read_u8(bytes, cursor)?)?;
            let slot = read_u16(bytes, cursor)?;
            match tag {
                150 => Op::FreezeVar {
                    name,
                    loc,
                    slot,
                    consume_seeds: read_u8(bytes, cursor)? != 0,
                },
                151 => Op::ThawVar { name, loc, slot },
                _ => Op::SublimateVar { name, loc, slot },
            }
        }
        153 => Op::React {
            name: r()?,
            callback: r()?,
        },
        154 => Op::Unreact(r()?),
        155 => Op::Bond {
            target: r()?,
            dep: r()?,
            strategy: r()?,
        },
        156 => Op::Unbond {
            target: r()?,
            dep: r()?,
        },
        157 => Op::Seed {
            name: r()?,
            contract: r()?,
        },
        158 => Op::Unseed(r()?),
        160 => Op::Import(r()?, r()?),
        161 => Op::Scope {
            dst: r()?,
            base: r()?,
            spawns: r()?,
        },
        162 => Op::Select {
            dst: r()?,
            base: r()?,
            arms: r()?,
        },
        163 => Op::ResetEphemeral,
        164 => Op::Print {
            base: r()?,
            count: r()?,
        },
        165 => Op::Halt,
        other => bail!("unknown opcode tag {other}"),
    };
    Ok(op)
}

fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_len16(out: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    ensure!(len <= u16::MAX as usize, "{what} too long");
    write_u16(out, len as u16);
    Ok(())
}

fn write_len32(out: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    ensure!(len <= u32::MAX as usize, "{what} too large");
    write_u32(out, len as u32);
    Ok(())
}

fn write_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    write_len32(out, value.len(), "string")?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn take<'a, const N: usize>(bytes: &'a [u8], cursor: &mut usize, what: &str) -> Result<[u8; N]> {
    if *cursor + N > bytes.len() {
        bail!("unexpected end of input while reading {what}");
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[*cursor..*cursor + N]);
    *cursor += N;
    Ok(buf)
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    take::<1>(bytes, cursor, "u8").map(|b| b[0])
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    take(bytes, cursor, "u16").map(u16::from_le_bytes)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    take(bytes, cursor, "u32").map(u32::from_le_bytes)
}

fn read_i32(bytes: &[u8], cursor: &mut usize) -> Result<i32> {
    take(bytes, cursor, "i32").map(i32::from_le_bytes)
}

fn read_i64(bytes: &[u8], cursor: &mut usize) -> Result<i64> {
    take(bytes, cursor, "i64").map(i64::from_le_bytes)
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    take(bytes, cursor, "u64").map(u64::from_le_bytes)
}

fn read_string(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u32(bytes, cursor)? as usize;
    if *cursor + len > bytes.len() {
        bail!("unexpected end of input while reading string");
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    String::from_utf8(slice.to_vec()).context("invalid UTF-8 in string")
}

fn read_tag(bytes: &[u8], cursor: &mut usize) -> Result<[u8; 4]> {
    take(bytes, cursor, "section tag")
}
