//! Register machine executing an [`InterpretedProgram`] against one row.
//!
//! The fetch-execute loop runs over the main-execution region and the
//! subroutine region. Every instruction counts against a hard ceiling, so a
//! program always terminates.

use std::cmp::Ordering;

use tupl_error::{Result, TuplError};
use tupl_layout::{
    AttrDescriptor, AttrMask, BinaryCollation, Collation, CollationRegistry, ExpandedTuple,
    ReadMode, SizeClass, TableDescriptor, WriteKind, read_attr, read_attrs, update_attrs,
    write_attr,
};
use tupl_types::{AttrId, AttrValue, words_to_bytes};

use crate::opcode::{Cond, Instr, NUM_REGS, Opcode};
use crate::program::InterpretedProgram;

/// Register contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegValue {
    /// Never loaded; reading it is a fault.
    #[default]
    Unset,
    Null,
    U32(u32),
    U64(u64),
}

impl RegValue {
    fn widen(self) -> Option<u64> {
        match self {
            Self::U32(v) => Some(u64::from(v)),
            Self::U64(v) => Some(v),
            Self::Unset | Self::Null => None,
        }
    }
}

/// Execution bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpLimits {
    pub max_instructions: u32,
    pub call_depth: usize,
}

impl Default for InterpLimits {
    fn default() -> Self {
        Self {
            max_instructions: 8000,
            call_depth: 32,
        }
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Whether `WriteAttr` and the final-update region are permitted.
    pub allow_writes: bool,
    /// Words available for initial-read plus final-read output.
    pub budget_words: usize,
    pub read_mode: ReadMode,
}

/// Result of a run that did not refuse the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpOutcome {
    /// Initial-read values followed by final-read values.
    pub values: Vec<AttrValue>,
    /// The program exited with `exit-ok-last-row`.
    pub last_row: bool,
    pub instructions: u64,
    /// Attributes written by `WriteAttr` or the final-update region.
    pub written: AttrMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Exec,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Ok,
    OkLast,
    Refuse(u16),
}

/// The interpreter. Holds only its limits; all row state is per run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter {
    limits: InterpLimits,
}

struct Frame<'a> {
    desc: &'a TableDescriptor,
    collations: &'a CollationRegistry,
    tuple: &'a mut ExpandedTuple,
    program: &'a InterpretedProgram,
    allow_writes: bool,
    regs: [RegValue; NUM_REGS],
    written: AttrMask,
    steps: u64,
}

impl Interpreter {
    pub const fn new(limits: InterpLimits) -> Self {
        Self { limits }
    }

    pub const fn limits(&self) -> InterpLimits {
        self.limits
    }

    /// Run `program` against `tuple`.
    ///
    /// `ExitRefuse` surfaces as [`TuplError::InterpreterRefused`] with the
    /// final-update region left unapplied. Writes performed before a fault
    /// or refusal remain in `tuple`; callers run against a shadow copy.
    pub fn run(
        &self,
        desc: &TableDescriptor,
        collations: &CollationRegistry,
        tuple: &mut ExpandedTuple,
        program: &InterpretedProgram,
        opts: RunOptions,
    ) -> Result<InterpOutcome> {
        if !opts.allow_writes && program.writes() {
            return Err(TuplError::fault(0, "program writes but the operation is read-only"));
        }

        let mut values = read_attrs(
            desc,
            collations,
            tuple,
            &program.initial_read,
            opts.budget_words,
            opts.read_mode,
        )?;
        let used: usize = values.iter().map(AttrValue::wire_words).sum();

        let mut frame = Frame {
            desc,
            collations,
            tuple: &mut *tuple,
            program,
            allow_writes: opts.allow_writes,
            regs: [RegValue::Unset; NUM_REGS],
            written: AttrMask::new(),
            steps: 0,
        };
        let exit = if program.exec.is_empty() {
            Exit::Ok
        } else {
            self.execute(&mut frame)?
        };
        let steps = frame.steps;
        let mut written = frame.written;

        if let Exit::Refuse(code) = exit {
            tracing::debug!(code, steps, "interpreted program refused row");
            return Err(TuplError::InterpreterRefused { code });
        }

        if !program.final_update.is_empty() {
            let mask = update_attrs(
                desc,
                collations,
                tuple,
                &program.final_update,
                WriteKind::Update,
            )?;
            for id in mask.iter() {
                written.set(id);
            }
        }

        let tail = read_attrs(
            desc,
            collations,
            tuple,
            &program.final_read,
            opts.budget_words.saturating_sub(used),
            opts.read_mode,
        )
        .map_err(|e| match e {
            TuplError::OutputOverflow { needed, .. } => TuplError::OutputOverflow {
                needed: needed + used,
                budget: opts.budget_words,
            },
            other => other,
        })?;
        values.extend(tail);

        Ok(InterpOutcome {
            values,
            last_row: exit == Exit::OkLast,
            instructions: steps,
            written,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&self, f: &mut Frame<'_>) -> Result<Exit> {
        let mut region = Region::Exec;
        let mut pc = 0usize;
        let mut stack: Vec<(Region, usize)> = Vec::new();

        loop {
            if f.steps >= u64::from(self.limits.max_instructions) {
                return Err(TuplError::fault(
                    pc,
                    format!("instruction limit {} exceeded", self.limits.max_instructions),
                ));
            }
            f.steps += 1;

            let code: &[u32] = match region {
                Region::Exec => &f.program.exec,
                Region::Sub => &f.program.subroutines,
            };
            let Some(&word) = code.get(pc) else {
                return Err(TuplError::fault(pc, format!("ran off the end of {region:?} region")));
            };
            let instr = Instr::decode(word)
                .ok_or_else(|| TuplError::fault(pc, format!("malformed instruction {word:#010x}")))?;
            let width = instr.width(code.get(pc + 1).copied());
            if pc + width > code.len() {
                return Err(TuplError::fault(pc, "truncated instruction"));
            }
            let operands = &code[pc + 1..pc + width];
            let next = pc + width;
            let target = usize::from(instr.imm);

            tracing::trace!(?region, pc, op = ?instr.op, "interp step");

            match instr.op {
                Opcode::ReadAttr => {
                    let attr = attr_at(f.desc, pc, instr.imm)?;
                    if !matches!(attr.size, SizeClass::Fixed { bytes } if bytes <= 8) {
                        return Err(TuplError::fault(
                            pc,
                            format!("{} does not fit a register", attr.id),
                        ));
                    }
                    let value = match read_attr(f.desc, f.tuple, attr)? {
                        None => RegValue::Null,
                        Some(bytes) => bytes_to_reg(&bytes),
                    };
                    f.regs[instr.r1.index()] = value;
                    pc = next;
                }
                Opcode::WriteAttr => {
                    if !f.allow_writes {
                        return Err(TuplError::fault(pc, "write in a read-only program"));
                    }
                    let attr = attr_at(f.desc, pc, instr.imm)?;
                    let width = fixed_len(attr);
                    let data = match f.regs[instr.r1.index()] {
                        RegValue::Unset => {
                            return Err(TuplError::fault(pc, format!("{} is unset", instr.r1)));
                        }
                        RegValue::Null => None,
                        RegValue::U32(v) => Some(fit(pc, u64::from(v), width)?),
                        RegValue::U64(v) => Some(fit(pc, v, width)?),
                    };
                    write_attr(
                        f.desc,
                        f.collations,
                        f.tuple,
                        attr,
                        data.as_deref(),
                        WriteKind::Update,
                    )?;
                    f.written.set(attr.id);
                    pc = next;
                }
                Opcode::LoadNull => {
                    f.regs[instr.r1.index()] = RegValue::Null;
                    pc = next;
                }
                Opcode::LoadConst16 => {
                    f.regs[instr.r1.index()] = RegValue::U32(u32::from(instr.imm));
                    pc = next;
                }
                Opcode::LoadConst32 => {
                    f.regs[instr.r1.index()] = RegValue::U32(operands[0]);
                    pc = next;
                }
                Opcode::LoadConst64 => {
                    let v = u64::from(operands[0]) | (u64::from(operands[1]) << 32);
                    f.regs[instr.r1.index()] = RegValue::U64(v);
                    pc = next;
                }
                Opcode::Add | Opcode::Sub => {
                    let a = f.operand(pc, instr.r2.index())?;
                    let b = f.operand(pc, usize::from(instr.r3))?;
                    let v = if instr.op == Opcode::Add {
                        a.wrapping_add(b)
                    } else {
                        a.wrapping_sub(b)
                    };
                    f.regs[instr.r1.index()] = RegValue::U64(v);
                    pc = next;
                }
                Opcode::Branch => pc = target,
                Opcode::BranchRegNull | Opcode::BranchRegNotNull => {
                    let is_null = match f.regs[instr.r1.index()] {
                        RegValue::Unset => {
                            return Err(TuplError::fault(pc, format!("{} is unset", instr.r1)));
                        }
                        RegValue::Null => true,
                        RegValue::U32(_) | RegValue::U64(_) => false,
                    };
                    let jump = is_null == (instr.op == Opcode::BranchRegNull);
                    pc = if jump { target } else { next };
                }
                Opcode::BranchRegCmp => {
                    let cond = cond_of(pc, instr.r3)?;
                    if cond.is_like() {
                        return Err(TuplError::fault(pc, "LIKE on registers"));
                    }
                    let ord = f.compare_regs(pc, instr.r1.index(), instr.r2.index())?;
                    pc = if cond.holds(ord) { target } else { next };
                }
                Opcode::BranchAttrCmp => {
                    let cond = cond_of(pc, instr.r3)?;
                    let head = operands[0];
                    #[allow(clippy::cast_possible_truncation)]
                    let attr = attr_at(f.desc, pc, (head & 0xffff) as u16)?;
                    let len = (head >> 16) as usize;
                    let literal = words_to_bytes(&operands[1..], len)
                        .ok_or_else(|| TuplError::fault(pc, "truncated literal"))?;
                    let hit = f.compare_attr(pc, attr, cond, &literal)?;
                    pc = if hit { target } else { next };
                }
                Opcode::BranchAttrNull | Opcode::BranchAttrNotNull => {
                    let raw = u16::try_from(operands[0])
                        .map_err(|_| TuplError::fault(pc, "attribute id out of range"))?;
                    let attr = attr_at(f.desc, pc, raw)?;
                    let is_null = f.tuple.is_null(f.desc, attr)?;
                    let jump = is_null == (instr.op == Opcode::BranchAttrNull);
                    pc = if jump { target } else { next };
                }
                Opcode::Call => {
                    if stack.len() >= self.limits.call_depth {
                        return Err(TuplError::fault(
                            pc,
                            format!("call depth {} exceeded", self.limits.call_depth),
                        ));
                    }
                    stack.push((region, next));
                    region = Region::Sub;
                    pc = target;
                }
                Opcode::Return => {
                    let Some((r, ret)) = stack.pop() else {
                        return Err(TuplError::fault(pc, "return with empty call stack"));
                    };
                    region = r;
                    pc = ret;
                }
                Opcode::ExitOk => return Ok(Exit::Ok),
                Opcode::ExitOkLast => return Ok(Exit::OkLast),
                Opcode::ExitRefuse => return Ok(Exit::Refuse(instr.imm)),
            }
        }
    }
}

/// Resolve an attribute operand; unknown ids are malformed programs.
fn attr_at(desc: &TableDescriptor, pc: usize, raw: u16) -> Result<&AttrDescriptor> {
    desc.attr(AttrId::new(raw))
        .map_err(|_| TuplError::fault(pc, format!("no attribute {raw}")))
}

impl Frame<'_> {
    fn operand(&self, pc: usize, r: usize) -> Result<u64> {
        match self.regs[r] {
            RegValue::Unset => Err(TuplError::fault(pc, format!("r{r} is unset"))),
            RegValue::Null => Err(TuplError::fault(pc, format!("r{r} is NULL in arithmetic"))),
            v => v
                .widen()
                .ok_or_else(|| TuplError::internal("register has no value")),
        }
    }

    /// NULL equals NULL and sorts before every value.
    fn compare_regs(&self, pc: usize, a: usize, b: usize) -> Result<Ordering> {
        let (x, y) = (self.regs[a], self.regs[b]);
        if x == RegValue::Unset || y == RegValue::Unset {
            return Err(TuplError::fault(pc, "comparison of an unset register"));
        }
        Ok(match (x.widen(), y.widen()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => l.cmp(&r),
        })
    }

    fn compare_attr(
        &self,
        pc: usize,
        attr: &AttrDescriptor,
        cond: Cond,
        literal: &[u8],
    ) -> Result<bool> {
        let Some(value) = read_attr(self.desc, self.tuple, attr)? else {
            return Ok(!cond.is_like() && cond.holds(Ordering::Less));
        };

        if let Some(id) = attr.collation {
            let coll = self.collations.get(id)?;
            return Ok(apply(cond, coll, &value, literal));
        }

        match attr.size {
            SizeClass::Fixed { bytes } if bytes <= 8 => {
                if cond.is_like() {
                    return Err(TuplError::fault(pc, "LIKE on a numeric attribute"));
                }
                if literal.len() != value.len() {
                    return Err(TuplError::fault(
                        pc,
                        format!(
                            "literal of {} bytes compared with {}-byte {}",
                            literal.len(),
                            value.len(),
                            attr.id
                        ),
                    ));
                }
                let ord = le_u64(&value).cmp(&le_u64(literal));
                Ok(cond.holds(ord))
            }
            _ => Ok(apply(cond, &BinaryCollation, &value, literal)),
        }
    }
}

fn apply(cond: Cond, coll: &dyn Collation, value: &[u8], literal: &[u8]) -> bool {
    match cond {
        Cond::Like => coll.like(value, literal),
        Cond::NotLike => !coll.like(value, literal),
        _ => cond.holds(coll.compare(value, literal)),
    }
}

fn cond_of(pc: usize, raw: u8) -> Result<Cond> {
    Cond::from_u8(raw).ok_or_else(|| TuplError::fault(pc, format!("bad condition {raw}")))
}

fn fixed_len(attr: &AttrDescriptor) -> usize {
    match attr.size {
        SizeClass::Fixed { bytes } => bytes as usize,
        SizeClass::Variable { .. } => 0,
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

#[allow(clippy::cast_possible_truncation)]
fn bytes_to_reg(bytes: &[u8]) -> RegValue {
    let v = le_u64(bytes);
    if bytes.len() <= 4 {
        RegValue::U32(v as u32)
    } else {
        RegValue::U64(v)
    }
}

/// Little-endian bytes of `v` in an attribute of `width` bytes.
fn fit(pc: usize, v: u64, width: usize) -> Result<Vec<u8>> {
    if width == 0 || width > 8 {
        return Err(TuplError::fault(
            pc,
            "register writes need a fixed attribute of at most two words",
        ));
    }
    if width < 8 && v >> (width * 8) != 0 {
        return Err(TuplError::fault(
            pc,
            format!("value {v} does not fit in {width} bytes"),
        ));
    }
    Ok(v.to_le_bytes()[..width].to_vec())
}
