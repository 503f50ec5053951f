//! Interpreted programs: five regions, a flat word encoding and a
//! label-based builder.
//!
//! ```text
//! word 0..5   region lengths in words:
//!             initial-read, main-execution, final-update, final-read, subroutines
//! ...         regions in that order
//! ```
//!
//! Read regions hold one attribute id per word. The final-update region
//! holds `attr | len << 16` headers (`len == 0xffff` for NULL) each
//! followed by the value bytes packed into words.

use std::fmt::Write as _;

use tupl_error::{Result, TuplError};
use tupl_types::{AttrId, AttrValue, bytes_to_words, words_for_bytes, words_to_bytes};

use crate::opcode::{Cond, Instr, Opcode, Reg};

const NULL_LEN: u32 = 0xffff;
const HEADER_WORDS: usize = 5;

/// A complete interpreted program.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InterpretedProgram {
    pub initial_read: Vec<AttrId>,
    pub exec: Vec<u32>,
    pub final_update: Vec<AttrValue>,
    pub final_read: Vec<AttrId>,
    pub subroutines: Vec<u32>,
}

impl InterpretedProgram {
    /// Whether any region writes to the row.
    pub fn writes(&self) -> bool {
        !self.final_update.is_empty()
            || contains_op(&self.exec, Opcode::WriteAttr)
            || contains_op(&self.subroutines, Opcode::WriteAttr)
    }

    /// Flat word form.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_words(&self) -> Vec<u32> {
        let mut update = Vec::new();
        for v in &self.final_update {
            match &v.data {
                None => update.push(u32::from(v.id.get()) | (NULL_LEN << 16)),
                Some(bytes) => {
                    update.push(u32::from(v.id.get()) | ((bytes.len() as u32) << 16));
                    update.extend(bytes_to_words(bytes));
                }
            }
        }
        let mut out = Vec::with_capacity(
            HEADER_WORDS
                + self.initial_read.len()
                + self.exec.len()
                + update.len()
                + self.final_read.len()
                + self.subroutines.len(),
        );
        out.extend([
            self.initial_read.len() as u32,
            self.exec.len() as u32,
            update.len() as u32,
            self.final_read.len() as u32,
            self.subroutines.len() as u32,
        ]);
        out.extend(self.initial_read.iter().map(|a| u32::from(a.get())));
        out.extend_from_slice(&self.exec);
        out.extend(update);
        out.extend(self.final_read.iter().map(|a| u32::from(a.get())));
        out.extend_from_slice(&self.subroutines);
        out
    }

    /// Decode the flat word form.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() < HEADER_WORDS {
            return Err(TuplError::fault(0, "program shorter than its header"));
        }
        let lens: Vec<usize> = words[..HEADER_WORDS].iter().map(|w| *w as usize).collect();
        let total = HEADER_WORDS + lens.iter().sum::<usize>();
        if total != words.len() {
            return Err(TuplError::fault(
                0,
                format!("header declares {total} words, program has {}", words.len()),
            ));
        }
        let mut bounds = [(0usize, 0usize); HEADER_WORDS];
        let mut at = HEADER_WORDS;
        for (b, len) in bounds.iter_mut().zip(&lens) {
            *b = (at, at + len);
            at += len;
        }
        let [ir, exec, fu, fr, subs] = bounds;

        Ok(Self {
            initial_read: decode_ids(&words[ir.0..ir.1], ir.0)?,
            exec: words[exec.0..exec.1].to_vec(),
            final_update: decode_values(&words[fu.0..fu.1], fu.0)?,
            final_read: decode_ids(&words[fr.0..fr.1], fr.0)?,
            subroutines: words[subs.0..subs.1].to_vec(),
        })
    }

    /// Human-readable listing of the code regions.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for id in &self.initial_read {
            let _ = writeln!(out, "read      {id}");
        }
        let _ = writeln!(out, "-- exec");
        disassemble_region(&mut out, &self.exec);
        for v in &self.final_update {
            let _ = writeln!(out, "update    {v:?}");
        }
        for id in &self.final_read {
            let _ = writeln!(out, "read      {id}");
        }
        if !self.subroutines.is_empty() {
            let _ = writeln!(out, "-- subroutines");
            disassemble_region(&mut out, &self.subroutines);
        }
        out
    }
}

fn contains_op(code: &[u32], wanted: Opcode) -> bool {
    let mut pc = 0;
    while pc < code.len() {
        let Some(i) = Instr::decode(code[pc]) else {
            return false;
        };
        if i.op == wanted {
            return true;
        }
        pc += i.width(code.get(pc + 1).copied());
    }
    false
}

fn disassemble_region(out: &mut String, code: &[u32]) {
    let mut pc = 0;
    while pc < code.len() {
        match Instr::decode(code[pc]) {
            Some(i) => {
                let _ = writeln!(
                    out,
                    "{pc:04} {:<18} {} {} {} {}",
                    format!("{:?}", i.op),
                    i.r1,
                    i.r2,
                    i.r3,
                    i.imm
                );
                pc += i.width(code.get(pc + 1).copied());
            }
            None => {
                let _ = writeln!(out, "{pc:04} .word {:#010x}", code[pc]);
                pc += 1;
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn decode_ids(words: &[u32], base: usize) -> Result<Vec<AttrId>> {
    words
        .iter()
        .enumerate()
        .map(|(i, w)| {
            if *w > u32::from(u16::MAX) {
                return Err(TuplError::fault(base + i, "attribute id out of range"));
            }
            Ok(AttrId::new(*w as u16))
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn decode_values(words: &[u32], base: usize) -> Result<Vec<AttrValue>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let head = words[i];
        let id = AttrId::new((head & 0xffff) as u16);
        let len = head >> 16;
        i += 1;
        if len == NULL_LEN {
            out.push(AttrValue::null(id));
            continue;
        }
        let n = words_for_bytes(len as usize);
        let payload = words
            .get(i..i + n)
            .ok_or_else(|| TuplError::fault(base + i - 1, "truncated update value"))?;
        let bytes = words_to_bytes(payload, len as usize)
            .ok_or_else(|| TuplError::fault(base + i - 1, "truncated update value"))?;
        out.push(AttrValue::bytes(id, bytes));
        i += n;
    }
    Ok(out)
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Forward-reference jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Subroutine handle for `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subroutine(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Exec,
    Sub,
}

#[derive(Debug)]
enum LabelState {
    /// Word indices whose imm16 awaits the target.
    Unresolved(Region, Vec<usize>),
    Resolved(Region, u16),
}

/// Builds an [`InterpretedProgram`] with forward branches.
#[derive(Debug)]
pub struct ProgramBuilder {
    program: InterpretedProgram,
    region: Region,
    labels: Vec<LabelState>,
    subs: Vec<Option<u16>>,
    calls: Vec<(Region, usize, Subroutine)>,
    errors: Vec<String>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            program: InterpretedProgram::default(),
            region: Region::Exec,
            labels: Vec::new(),
            subs: Vec::new(),
            calls: Vec::new(),
            errors: Vec::new(),
        }
    }

    // ── Data regions ────────────────────────────────────────────────────

    pub fn initial_read(&mut self, attr: AttrId) -> &mut Self {
        self.program.initial_read.push(attr);
        self
    }

    pub fn final_update(&mut self, value: AttrValue) -> &mut Self {
        self.program.final_update.push(value);
        self
    }

    pub fn final_read(&mut self, attr: AttrId) -> &mut Self {
        self.program.final_read.push(attr);
        self
    }

    // ── Emission ────────────────────────────────────────────────────────

    fn code(&mut self) -> &mut Vec<u32> {
        match self.region {
            Region::Exec => &mut self.program.exec,
            Region::Sub => &mut self.program.subroutines,
        }
    }

    fn emit(&mut self, op: Opcode, r1: Reg, r2: Reg, r3: u8, imm: u16) -> usize {
        let code = self.code();
        let at = code.len();
        code.push(Instr::encode(op, r1, r2, r3, imm));
        at
    }

    fn emit_jump(&mut self, op: Opcode, r1: Reg, r2: Reg, r3: u8, label: Label) -> usize {
        let at = self.emit(op, r1, r2, r3, 0);
        let region = self.region;
        let resolved = match &mut self.labels[label.0 as usize] {
            LabelState::Unresolved(r, refs) if *r == region => {
                refs.push(at);
                None
            }
            LabelState::Resolved(r, target) if *r == region => Some(*target),
            _ => {
                self.errors
                    .push(format!("label {} used across regions", label.0));
                None
            }
        };
        if let Some(target) = resolved {
            patch_imm(self.code(), at, target);
        }
        at
    }

    pub fn read_attr(&mut self, dst: Reg, attr: AttrId) -> &mut Self {
        self.emit(Opcode::ReadAttr, dst, Reg::R0, 0, attr.get());
        self
    }

    pub fn write_attr(&mut self, attr: AttrId, src: Reg) -> &mut Self {
        self.emit(Opcode::WriteAttr, src, Reg::R0, 0, attr.get());
        self
    }

    pub fn load_null(&mut self, dst: Reg) -> &mut Self {
        self.emit(Opcode::LoadNull, dst, Reg::R0, 0, 0);
        self
    }

    pub fn load_u16(&mut self, dst: Reg, v: u16) -> &mut Self {
        self.emit(Opcode::LoadConst16, dst, Reg::R0, 0, v);
        self
    }

    pub fn load_u32(&mut self, dst: Reg, v: u32) -> &mut Self {
        self.emit(Opcode::LoadConst32, dst, Reg::R0, 0, 0);
        self.code().push(v);
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn load_u64(&mut self, dst: Reg, v: u64) -> &mut Self {
        self.emit(Opcode::LoadConst64, dst, Reg::R0, 0, 0);
        self.code().extend([v as u32, (v >> 32) as u32]);
        self
    }

    pub fn add(&mut self, dst: Reg, a: Reg, b: Reg) -> &mut Self {
        self.emit(Opcode::Add, dst, a, b.index() as u8, 0);
        self
    }

    pub fn sub(&mut self, dst: Reg, a: Reg, b: Reg) -> &mut Self {
        self.emit(Opcode::Sub, dst, a, b.index() as u8, 0);
        self
    }

    pub fn branch(&mut self, label: Label) -> &mut Self {
        self.emit_jump(Opcode::Branch, Reg::R0, Reg::R0, 0, label);
        self
    }

    pub fn branch_if_null(&mut self, r: Reg, label: Label) -> &mut Self {
        self.emit_jump(Opcode::BranchRegNull, r, Reg::R0, 0, label);
        self
    }

    pub fn branch_if_not_null(&mut self, r: Reg, label: Label) -> &mut Self {
        self.emit_jump(Opcode::BranchRegNotNull, r, Reg::R0, 0, label);
        self
    }

    /// Jump if `a <cond> b`.
    pub fn branch_cmp(&mut self, cond: Cond, a: Reg, b: Reg, label: Label) -> &mut Self {
        if cond.is_like() {
            self.errors
                .push("LIKE is only defined for attribute comparisons".to_owned());
        }
        self.emit_jump(Opcode::BranchRegCmp, a, b, cond as u8, label);
        self
    }

    /// Jump if `attr <cond> literal`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn branch_attr_cmp(
        &mut self,
        cond: Cond,
        attr: AttrId,
        literal: &[u8],
        label: Label,
    ) -> &mut Self {
        if literal.len() >= NULL_LEN as usize {
            self.errors.push("literal too long".to_owned());
        }
        self.emit_jump(Opcode::BranchAttrCmp, Reg::R0, Reg::R0, cond as u8, label);
        let head = u32::from(attr.get()) | ((literal.len() as u32) << 16);
        let words = bytes_to_words(literal);
        let code = self.code();
        code.push(head);
        code.extend(words);
        self
    }

    pub fn branch_if_attr_null(&mut self, attr: AttrId, label: Label) -> &mut Self {
        self.emit_jump(Opcode::BranchAttrNull, Reg::R0, Reg::R0, 0, label);
        self.code().push(u32::from(attr.get()));
        self
    }

    pub fn branch_if_attr_not_null(&mut self, attr: AttrId, label: Label) -> &mut Self {
        self.emit_jump(Opcode::BranchAttrNotNull, Reg::R0, Reg::R0, 0, label);
        self.code().push(u32::from(attr.get()));
        self
    }

    pub fn call(&mut self, sub: Subroutine) -> &mut Self {
        let at = self.emit(Opcode::Call, Reg::R0, Reg::R0, 0, 0);
        self.calls.push((self.region, at, sub));
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(Opcode::Return, Reg::R0, Reg::R0, 0, 0);
        self
    }

    pub fn exit_ok(&mut self) -> &mut Self {
        self.emit(Opcode::ExitOk, Reg::R0, Reg::R0, 0, 0);
        self
    }

    pub fn exit_ok_last(&mut self) -> &mut Self {
        self.emit(Opcode::ExitOkLast, Reg::R0, Reg::R0, 0, 0);
        self
    }

    pub fn exit_refuse(&mut self, code: u16) -> &mut Self {
        self.emit(Opcode::ExitRefuse, Reg::R0, Reg::R0, 0, code);
        self
    }

    // ── Labels and subroutines ──────────────────────────────────────────

    #[allow(clippy::cast_possible_truncation)]
    pub fn new_label(&mut self) -> Label {
        self.labels
            .push(LabelState::Unresolved(self.region, Vec::new()));
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the next instruction of the current region.
    pub fn resolve_label(&mut self, label: Label) -> &mut Self {
        let region = self.region;
        let Some(target) = self.here() else {
            return self;
        };
        let idx = label.0 as usize;
        match std::mem::replace(&mut self.labels[idx], LabelState::Resolved(region, target)) {
            LabelState::Unresolved(r, refs) if r == region => {
                let code = self.code();
                for at in refs {
                    patch_imm(code, at, target);
                }
            }
            LabelState::Unresolved(_, refs) if refs.is_empty() => {}
            LabelState::Unresolved(..) => {
                self.errors
                    .push(format!("label {} resolved in another region", label.0));
            }
            LabelState::Resolved(..) => {
                self.errors.push(format!("label {} resolved twice", label.0));
            }
        }
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn new_subroutine(&mut self) -> Subroutine {
        self.subs.push(None);
        Subroutine(self.subs.len() as u32 - 1)
    }

    /// Start emitting `sub`'s body into the subroutine region.
    pub fn begin_subroutine(&mut self, sub: Subroutine) -> &mut Self {
        self.region = Region::Sub;
        let Some(start) = self.here() else {
            return self;
        };
        match self.subs.get_mut(sub.0 as usize) {
            Some(slot) if slot.is_none() => *slot = Some(start),
            _ => self.errors.push(format!("subroutine {} defined twice", sub.0)),
        }
        self
    }

    /// Return to emitting into the main-execution region.
    pub fn end_subroutine(&mut self) -> &mut Self {
        self.region = Region::Exec;
        self
    }

    fn here(&mut self) -> Option<u16> {
        let len = self.code().len();
        match u16::try_from(len) {
            Ok(v) => Some(v),
            Err(_) => {
                self.errors.push("region exceeds 65535 words".to_owned());
                None
            }
        }
    }

    /// Validate labels and calls and return the program.
    pub fn finish(mut self) -> Result<InterpretedProgram> {
        for (i, state) in self.labels.iter().enumerate() {
            if let LabelState::Unresolved(_, refs) = state {
                if !refs.is_empty() {
                    return Err(TuplError::internal(format!(
                        "unresolved label {i} referenced by {} instruction(s)",
                        refs.len()
                    )));
                }
            }
        }
        for (region, at, sub) in std::mem::take(&mut self.calls) {
            let Some(Some(start)) = self.subs.get(sub.0 as usize).copied() else {
                return Err(TuplError::internal(format!(
                    "call to undefined subroutine {}",
                    sub.0
                )));
            };
            let code = match region {
                Region::Exec => &mut self.program.exec,
                Region::Sub => &mut self.program.subroutines,
            };
            patch_imm(code, at, start);
        }
        if let Some(first) = self.errors.first() {
            return Err(TuplError::internal(first.clone()));
        }
        Ok(self.program)
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn patch_imm(code: &mut [u32], at: usize, imm: u16) {
    code[at] = (code[at] & 0xffff) | (u32::from(imm) << 16);
}
