//! Thumb/Thumb-2 decode tables and relocation emitter.
//!
//! Mixed-width encoding: the first halfword decides whether the instruction
//! is 16 or 32 bits, then the matching width's row table is scanned. IT
//! blocks are decoded as ordinary instructions but carry the predicated
//! count so the trampoline builder can treat the whole block as an atomic
//! unit.
//!
//! Synthesized jumps go through `ldr.w pc, [pc, #imm]` literal pools, which
//! require Thumb-2 and 4-aligned literals; a 2-byte pad is inserted when the
//! running trampoline offset is only 2-aligned. The trampoline base is
//! assumed 4-aligned. Literals destined for the program counter carry the
//! Thumb interworking bit.

use crate::decoder::{DecodeError, InstructionDescriptor, InstructionKind, Operands};
use crate::profile::{CapabilitySet, Profile};
use crate::relocator::RelocateError;

#[derive(Debug, Clone, Copy)]
enum Shape16 {
    Hint,
    It,
    Udf,
    Svc,
    BCond,
    BUncond,
    Cbz,
    Bx,
    BlxReg,
    AddHi,
    CmpHi,
    MovHi,
    Adr,
    LdrLit,
    PopPc,
    Pi,
}

#[derive(Debug, Clone, Copy)]
enum Shape32 {
    Bl,
    BlxImm,
    BW,
    BCondW,
    LdrLitW,
    /// Byte/half literal loads, PLD literal, vector literal loads: any
    /// Rn=PC load the relocator has no rewrite rule for.
    PcLoadOther,
    AdrAddW,
    AdrSubW,
    MovwMovtW,
    DpImmW,
    DpPlainImmW,
    TableBranch,
    LdmStmW,
    DpShiftW,
    CoprocW,
    LoadStoreW,
}

struct Row16 {
    caps: CapabilitySet,
    pattern: u16,
    mask: u16,
    shape: Shape16,
}

struct Row32 {
    caps: CapabilitySet,
    pattern: u32,
    mask: u32,
    shape: Shape32,
}

const fn r16(caps: CapabilitySet, pattern: u16, mask: u16, shape: Shape16) -> Row16 {
    Row16 {
        caps,
        pattern,
        mask,
        shape,
    }
}

const fn r32(caps: CapabilitySet, pattern: u32, mask: u32, shape: Shape32) -> Row32 {
    Row32 {
        caps,
        pattern,
        mask,
        shape,
    }
}

const NONE: CapabilitySet = CapabilitySet::empty();
const T2: CapabilitySet = CapabilitySet::V6T2;

// Hint row (IT with an empty mask) must precede the IT row, and UDF/SVC
// must precede the conditional-branch family that shares their top nibble.
static ROWS16: &[Row16] = &[
    r16(T2, 0xBF00, 0xFF0F, Shape16::Hint),
    r16(T2, 0xBF00, 0xFF00, Shape16::It),
    r16(NONE, 0xDE00, 0xFF00, Shape16::Udf),
    r16(NONE, 0xDF00, 0xFF00, Shape16::Svc),
    r16(NONE, 0xD000, 0xF000, Shape16::BCond),
    r16(NONE, 0xE000, 0xF800, Shape16::BUncond),
    r16(T2, 0xB100, 0xF500, Shape16::Cbz),
    r16(CapabilitySet::V4T, 0x4700, 0xFF87, Shape16::Bx),
    r16(CapabilitySet::V5T, 0x4780, 0xFF87, Shape16::BlxReg),
    r16(NONE, 0x4400, 0xFF00, Shape16::AddHi),
    r16(NONE, 0x4500, 0xFF00, Shape16::CmpHi),
    r16(NONE, 0x4600, 0xFF00, Shape16::MovHi),
    r16(NONE, 0xA000, 0xF800, Shape16::Adr),
    r16(NONE, 0xA800, 0xF800, Shape16::Pi),
    r16(NONE, 0x4800, 0xF800, Shape16::LdrLit),
    r16(NONE, 0xBD00, 0xFF00, Shape16::PopPc),
    r16(NONE, 0xB400, 0xFE00, Shape16::Pi),
    r16(NONE, 0xBC00, 0xFF00, Shape16::Pi),
    r16(NONE, 0xB000, 0xF000, Shape16::Pi),
    r16(NONE, 0x0000, 0xC000, Shape16::Pi),
    r16(NONE, 0x4000, 0xFC00, Shape16::Pi),
    r16(NONE, 0x5000, 0xF000, Shape16::Pi),
    r16(NONE, 0x6000, 0xE000, Shape16::Pi),
    r16(NONE, 0x8000, 0xE000, Shape16::Pi),
    r16(NONE, 0xC000, 0xF000, Shape16::Pi),
];

static ROWS32: &[Row32] = &[
    r32(T2, 0xF000_D000, 0xF800_D000, Shape32::Bl),
    r32(CapabilitySet::V5T, 0xF000_C000, 0xF800_D000, Shape32::BlxImm),
    r32(T2, 0xF000_9000, 0xF800_D000, Shape32::BW),
    r32(T2, 0xF000_8000, 0xF800_D000, Shape32::BCondW),
    r32(T2, 0xF85F_0000, 0xFF7F_0000, Shape32::LdrLitW),
    r32(T2, 0xF80F_0000, 0xF80F_0000, Shape32::PcLoadOther),
    r32(T2, 0xF20F_0000, 0xF7FF_8000, Shape32::AdrAddW),
    r32(T2, 0xF2AF_0000, 0xF7FF_8000, Shape32::AdrSubW),
    r32(T2, 0xF240_0000, 0xF7F0_8000, Shape32::MovwMovtW),
    r32(T2, 0xF2C0_0000, 0xF7F0_8000, Shape32::MovwMovtW),
    r32(T2, 0xF000_0000, 0xFA00_8000, Shape32::DpImmW),
    r32(T2, 0xF200_0000, 0xFA00_8000, Shape32::DpPlainImmW),
    r32(T2, 0xE8D0_F000, 0xFFF0_FFE0, Shape32::TableBranch),
    r32(T2, 0xE800_0000, 0xFE00_0000, Shape32::LdmStmW),
    r32(T2, 0xEA00_0000, 0xFE00_0000, Shape32::DpShiftW),
    r32(NONE, 0xEC00_0000, 0xEC00_0000, Shape32::CoprocW),
    r32(T2, 0xF800_0000, 0xF800_0000, Shape32::LoadStoreW),
];

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn align4(value: u64) -> u64 {
    value & !3
}

pub(crate) fn decode<'a>(
    buffer: &'a [u8],
    offset: usize,
    address: u64,
    profile: &Profile,
) -> Result<InstructionDescriptor<'a>, DecodeError> {
    let bytes = &buffer[offset..];
    if bytes.len() < 2 {
        return Err(DecodeError::UnexpectedEof { address });
    }
    let hw1 = u16::from_le_bytes(bytes[..2].try_into().unwrap());
    if hw1 >> 11 >= 0b11101 {
        if bytes.len() < 4 {
            return Err(DecodeError::UnexpectedEof { address });
        }
        let hw2 = u16::from_le_bytes(bytes[2..4].try_into().unwrap());
        decode32(bytes, (hw1 as u32) << 16 | hw2 as u32, address, profile)
    } else {
        decode16(bytes, hw1, address, profile)
    }
}

fn decode16<'a>(
    bytes: &'a [u8],
    hw: u16,
    address: u64,
    profile: &Profile,
) -> Result<InstructionDescriptor<'a>, DecodeError> {
    let row = ROWS16
        .iter()
        .filter(|r| profile.is_enabled(r.caps))
        .find(|r| hw & r.mask == r.pattern)
        .ok_or(DecodeError::Malformed { address })?;

    let mut kind = InstructionKind::PositionIndependent;
    let mut operands = Operands::default();
    let mut terminal = false;

    match row.shape {
        Shape16::Hint | Shape16::Svc | Shape16::BlxReg | Shape16::Pi => {}
        Shape16::Udf => kind = InstructionKind::Unsupported,
        Shape16::It => {
            let mask = hw & 0xF;
            operands.it_block_len = 4 - mask.trailing_zeros() as u8;
        }
        Shape16::BCond => {
            let disp = sign_extend((hw & 0xFF) as u32, 8) << 1;
            operands.displacement = disp;
            operands.disp_width = 9;
            operands.cond = Some(((hw >> 8) & 0xF) as u8);
            operands.target = (address + 4).wrapping_add_signed(disp);
            kind = InstructionKind::ConditionalRelativeBranch;
        }
        Shape16::BUncond => {
            let disp = sign_extend((hw & 0x7FF) as u32, 11) << 1;
            operands.displacement = disp;
            operands.disp_width = 12;
            operands.target = (address + 4).wrapping_add_signed(disp);
            kind = InstructionKind::RelativeBranch;
            terminal = true;
        }
        Shape16::Cbz => {
            let i = (hw >> 9) & 1;
            let imm5 = (hw >> 3) & 0x1F;
            let disp = ((i << 5 | imm5) << 1) as i64;
            operands.displacement = disp;
            operands.disp_width = 7;
            // cond carries the compare sense: 1 for cbnz, 0 for cbz.
            operands.cond = Some(((hw >> 11) & 1) as u8);
            operands.target_reg = Some((hw & 7) as u8);
            operands.target = (address + 4).wrapping_add_signed(disp);
            kind = InstructionKind::ConditionalRelativeBranch;
        }
        Shape16::Bx => terminal = true,
        Shape16::AddHi | Shape16::CmpHi | Shape16::MovHi => {
            let rm = ((hw >> 3) & 0xF) as u8;
            let rd = (((hw >> 7) & 1) << 3 | (hw & 7) as u16) as u8;
            if rm == 15 || (rd == 15 && !matches!(row.shape, Shape16::MovHi)) {
                kind = InstructionKind::Unsupported;
            } else if rd == 15 {
                // mov pc, rm: indirect branch, position independent.
                terminal = true;
            }
        }
        Shape16::Adr | Shape16::LdrLit => {
            let reg = ((hw >> 8) & 7) as u8;
            let disp = ((hw & 0xFF) as i64) << 2;
            operands.displacement = disp;
            operands.disp_width = 10;
            operands.target_reg = Some(reg);
            operands.target = align4(address + 4).wrapping_add_signed(disp);
            kind = InstructionKind::PCRelativeMemoryOperand;
        }
        Shape16::PopPc => terminal = true,
    }

    Ok(InstructionDescriptor {
        address,
        raw_bytes: &bytes[..2],
        length: 2,
        kind,
        operands,
        terminal,
    })
}

fn decode32<'a>(
    bytes: &'a [u8],
    word: u32,
    address: u64,
    profile: &Profile,
) -> Result<InstructionDescriptor<'a>, DecodeError> {
    let row = ROWS32
        .iter()
        .filter(|r| profile.is_enabled(r.caps))
        .find(|r| word & r.mask == r.pattern)
        .ok_or(DecodeError::Malformed { address })?;

    let mut kind = InstructionKind::PositionIndependent;
    let mut operands = Operands::default();
    let mut terminal = false;

    let rn = ((word >> 16) & 0xF) as u8;
    let rt = ((word >> 12) & 0xF) as u8;
    let rm = (word & 0xF) as u8;

    match row.shape {
        Shape32::Bl | Shape32::BW => {
            let s = (word >> 26) & 1;
            let imm10 = (word >> 16) & 0x3FF;
            let j1 = (word >> 13) & 1;
            let j2 = (word >> 11) & 1;
            let imm11 = word & 0x7FF;
            let i1 = j1 ^ s ^ 1;
            let i2 = j2 ^ s ^ 1;
            let raw = s << 24 | i1 << 23 | i2 << 22 | imm10 << 12 | imm11 << 1;
            let disp = sign_extend(raw, 25);
            operands.displacement = disp;
            operands.disp_width = 25;
            operands.target = (address + 4).wrapping_add_signed(disp);
            if matches!(row.shape, Shape32::Bl) {
                kind = InstructionKind::RelativeCall;
            } else {
                kind = InstructionKind::RelativeBranch;
                terminal = true;
            }
        }
        Shape32::BlxImm => kind = InstructionKind::Unsupported,
        Shape32::BCondW => {
            let cond = ((word >> 22) & 0xF) as u8;
            if cond >= 0xE {
                // MSR/MRS/barrier/hypervisor space sharing the encoding.
                kind = InstructionKind::Unsupported;
            } else {
                let s = (word >> 26) & 1;
                let imm6 = (word >> 16) & 0x3F;
                let j1 = (word >> 13) & 1;
                let j2 = (word >> 11) & 1;
                let imm11 = word & 0x7FF;
                let raw = s << 20 | j2 << 19 | j1 << 18 | imm6 << 12 | imm11 << 1;
                let disp = sign_extend(raw, 21);
                operands.displacement = disp;
                operands.disp_width = 21;
                operands.cond = Some(cond);
                operands.target = (address + 4).wrapping_add_signed(disp);
                kind = InstructionKind::ConditionalRelativeBranch;
            }
        }
        Shape32::LdrLitW => {
            let imm12 = (word & 0xFFF) as i64;
            let disp = if word & (1 << 23) != 0 { imm12 } else { -imm12 };
            operands.displacement = disp;
            operands.disp_width = 12;
            operands.target_reg = Some(rt);
            operands.target = align4(address + 4).wrapping_add_signed(disp);
            kind = InstructionKind::PCRelativeMemoryOperand;
            terminal = rt == 15;
        }
        Shape32::PcLoadOther | Shape32::TableBranch | Shape32::CoprocW => {
            kind = InstructionKind::Unsupported;
        }
        Shape32::AdrAddW | Shape32::AdrSubW => {
            let i = (word >> 26) & 1;
            let imm3 = (word >> 12) & 7;
            let imm8 = word & 0xFF;
            let value = (i << 11 | imm3 << 8 | imm8) as i64;
            let disp = if matches!(row.shape, Shape32::AdrAddW) { value } else { -value };
            let rd = ((word >> 8) & 0xF) as u8;
            operands.displacement = disp;
            operands.disp_width = 12;
            operands.target_reg = Some(rd);
            operands.target = align4(address + 4).wrapping_add_signed(disp);
            kind = InstructionKind::PCRelativeMemoryOperand;
        }
        Shape32::MovwMovtW => {}
        Shape32::DpImmW => {
            let op = (word >> 21) & 0xF;
            let s = (word >> 20) & 1;
            let rd = ((word >> 8) & 0xF) as u8;
            let rn_marker_ok = rn != 15 || op == 0b0010 || op == 0b0011;
            let rd_marker_ok = rd != 15 || s == 1;
            if !rn_marker_ok || !rd_marker_ok {
                kind = InstructionKind::Unsupported;
            }
        }
        Shape32::DpPlainImmW => {
            let rd = ((word >> 8) & 0xF) as u8;
            if rn == 15 || rd == 15 {
                kind = InstructionKind::Unsupported;
            }
        }
        Shape32::LdmStmW => {
            if rn == 15 {
                kind = InstructionKind::Unsupported;
            } else if word & (1 << 20) != 0 && word & (1 << 15) != 0 {
                // pop.w {.., pc}
                terminal = true;
            }
        }
        Shape32::DpShiftW => {
            if rm == 15 {
                kind = InstructionKind::Unsupported;
            }
        }
        Shape32::LoadStoreW => {
            if rn == 15 || rm == 15 || rt == 15 {
                kind = InstructionKind::Unsupported;
            }
        }
    }

    Ok(InstructionDescriptor {
        address,
        raw_bytes: &bytes[..4],
        length: 4,
        kind,
        operands,
        terminal,
    })
}

fn push_hw(out: &mut Vec<u8>, hw: u16) {
    out.extend_from_slice(&hw.to_le_bytes());
}

fn push_word(out: &mut Vec<u8>, word: u32) {
    out.extend_from_slice(&word.to_le_bytes());
}

/// `ldr.w pc, [pc, #imm]` + literal, padded so the literal is 4-aligned.
/// `pc` is the absolute address the sequence executes at. The literal keeps
/// execution in Thumb state.
fn emit_far_jump(out: &mut Vec<u8>, pc: u64, target: u64) {
    debug_assert!(pc % 2 == 0);
    if pc % 4 == 0 {
        push_hw(out, 0xF8DF);
        push_hw(out, 0xF000);
    } else {
        push_hw(out, 0xF8DF);
        push_hw(out, 0xF004);
        // Pad after the load; never executed.
        push_hw(out, 0x0000);
    }
    push_word(out, (target | 1) as u32);
}

fn far_jump_len(pc: u64) -> usize {
    if pc % 4 == 0 {
        8
    } else {
        10
    }
}

fn fits(disp: i64, bits: u32) -> bool {
    disp % 2 == 0 && (-(1 << (bits - 1))..(1 << (bits - 1))).contains(&disp)
}

fn encode_b_t4(disp: i64) -> (u16, u16) {
    let raw = (disp as u32) & 0x01FF_FFFF;
    let s = raw >> 24 & 1;
    let i1 = raw >> 23 & 1;
    let i2 = raw >> 22 & 1;
    let imm10 = raw >> 12 & 0x3FF;
    let imm11 = (raw >> 1) & 0x7FF;
    let j1 = i1 ^ s ^ 1;
    let j2 = i2 ^ s ^ 1;
    (
        0xF000 | (s << 10) as u16 | imm10 as u16,
        0x9000 | (j1 << 13) as u16 | (j2 << 11) as u16 | imm11 as u16,
    )
}

fn encode_b_t3(cond: u8, disp: i64) -> (u16, u16) {
    let raw = (disp as u32) & 0x001F_FFFF;
    let s = raw >> 20 & 1;
    let j2 = raw >> 19 & 1;
    let j1 = raw >> 18 & 1;
    let imm6 = raw >> 12 & 0x3F;
    let imm11 = (raw >> 1) & 0x7FF;
    (
        0xF000 | (s << 10) as u16 | (cond as u16) << 6 | imm6 as u16,
        0x8000 | (j1 << 13) as u16 | (j2 << 11) as u16 | imm11 as u16,
    )
}

/// Unconditional jump for the continuation fragment: `b.w` when in range,
/// literal-pool jump otherwise. Requires Thumb-2 either way.
pub(crate) fn emit_jump(from: u64, to: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let disp = to.wrapping_sub(from + 4) as i64;
    if fits(disp, 25) {
        let (hw1, hw2) = encode_b_t4(disp);
        push_hw(&mut out, hw1);
        push_hw(&mut out, hw2);
    } else {
        emit_far_jump(&mut out, from, to);
    }
    out
}

pub(crate) fn relocate(
    descriptor: &InstructionDescriptor<'_>,
    old_address: u64,
    new_address: u64,
    profile: &Profile,
) -> Result<Vec<u8>, RelocateError> {
    let thumb2 = profile.is_enabled(CapabilitySet::V6T2);
    let target = descriptor.operands.target;
    let unsupported = || RelocateError::UnsupportedInstruction {
        address: descriptor.address,
    };
    let mut out = Vec::new();

    match descriptor.kind {
        InstructionKind::RelativeBranch => {
            let disp = target.wrapping_sub(new_address + 4) as i64;
            if fits(disp, 12) {
                push_hw(&mut out, 0xE000 | ((disp >> 1) as u16 & 0x7FF));
            } else if thumb2 && fits(disp, 25) {
                let (hw1, hw2) = encode_b_t4(disp);
                push_hw(&mut out, hw1);
                push_hw(&mut out, hw2);
            } else if thumb2 {
                emit_far_jump(&mut out, new_address, target);
            } else {
                return Err(unsupported());
            }
        }
        InstructionKind::ConditionalRelativeBranch => {
            // CBZ/CBNZ carry a tested register instead of a condition code.
            if let Some(rn) = descriptor.operands.target_reg {
                let nz = descriptor.operands.cond.unwrap_or(0);
                let disp = target.wrapping_sub(new_address + 4) as i64;
                if (0..=126).contains(&disp) && disp % 2 == 0 {
                    let i = (disp >> 6) as u16 & 1;
                    let imm5 = (disp >> 1) as u16 & 0x1F;
                    push_hw(
                        &mut out,
                        0xB100 | (nz as u16) << 11 | i << 9 | imm5 << 3 | rn as u16,
                    );
                } else {
                    // Inverted compare skips a literal-pool jump.
                    let skip = far_jump_len(new_address + 2) as i64 - 2;
                    let imm5 = (skip >> 1) as u16 & 0x1F;
                    push_hw(
                        &mut out,
                        0xB100 | ((nz ^ 1) as u16) << 11 | imm5 << 3 | rn as u16,
                    );
                    emit_far_jump(&mut out, new_address + 2, target);
                }
                return Ok(out);
            }

            let cond = descriptor.operands.cond.unwrap_or(0xE);
            let disp = target.wrapping_sub(new_address + 4) as i64;
            if fits(disp, 9) {
                push_hw(
                    &mut out,
                    0xD000 | (cond as u16) << 8 | ((disp >> 1) as u16 & 0xFF),
                );
            } else if thumb2 && fits(disp, 21) {
                let (hw1, hw2) = encode_b_t3(cond, disp);
                push_hw(&mut out, hw1);
                push_hw(&mut out, hw2);
            } else if thumb2 {
                // Inverted conditional branch over a literal-pool jump.
                let skip = far_jump_len(new_address + 2) as i64 - 2;
                push_hw(
                    &mut out,
                    0xD000 | ((cond ^ 1) as u16) << 8 | ((skip >> 1) as u16 & 0xFF),
                );
                emit_far_jump(&mut out, new_address + 2, target);
            } else {
                return Err(unsupported());
            }
        }
        InstructionKind::RelativeCall => {
            if !thumb2 {
                return Err(unsupported());
            }
            // lr must point after the *original* bl, with the Thumb bit set;
            // a re-encoded bl would link to the trampoline instead.
            if new_address % 4 != 0 {
                push_hw(&mut out, 0xBF00); // nop to align the literals
            }
            push_hw(&mut out, 0xF8DF); // ldr.w lr, [pc, #4]
            push_hw(&mut out, 0xE004);
            push_hw(&mut out, 0xF8DF); // ldr.w pc, [pc, #4]
            push_hw(&mut out, 0xF004);
            push_word(&mut out, ((old_address + descriptor.length as u64) | 1) as u32);
            push_word(&mut out, (target | 1) as u32);
        }
        InstructionKind::PCRelativeMemoryOperand => {
            let reg = descriptor.operands.target_reg.unwrap_or(0);
            let disp = target.wrapping_sub(align4(new_address + 4)) as i64;
            let hw1 = u16::from_le_bytes(descriptor.raw_bytes[..2].try_into().unwrap());
            let is_adr = descriptor.length == 2 && hw1 & 0xF800 == 0xA000
                || descriptor.length == 4 && hw1 & 0xFB5F != 0xF85F;
            if !is_adr {
                // Literal load: prefer the original 16-bit form, widen to
                // the .w encoding otherwise.
                if descriptor.length == 2 && (0..=1020).contains(&disp) && disp % 4 == 0 {
                    push_hw(
                        &mut out,
                        0x4800 | (reg as u16) << 8 | (disp >> 2) as u16,
                    );
                } else if thumb2 && disp.unsigned_abs() <= 0xFFF {
                    push_hw(&mut out, 0xF85F | if disp >= 0 { 0x0080 } else { 0 });
                    push_hw(&mut out, (reg as u16) << 12 | disp.unsigned_abs() as u16);
                } else if disp.unsigned_abs() > 0xFFF {
                    return Err(RelocateError::DisplacementOverflow {
                        address: descriptor.address,
                        displacement: disp,
                    });
                } else {
                    return Err(unsupported());
                }
            } else {
                if descriptor.length == 2 && (0..=1020).contains(&disp) && disp % 4 == 0 {
                    push_hw(
                        &mut out,
                        0xA000 | (reg as u16) << 8 | (disp >> 2) as u16,
                    );
                } else if thumb2 && disp.unsigned_abs() <= 0xFFF {
                    let magnitude = disp.unsigned_abs() as u32;
                    let i = (magnitude >> 11 & 1) as u16;
                    let imm3 = (magnitude >> 8 & 7) as u16;
                    let imm8 = (magnitude & 0xFF) as u16;
                    let base: u16 = if disp >= 0 { 0xF20F } else { 0xF2AF };
                    push_hw(&mut out, base | i << 10);
                    push_hw(&mut out, imm3 << 12 | (reg as u16) << 8 | imm8);
                } else if disp.unsigned_abs() > 0xFFF {
                    return Err(RelocateError::DisplacementOverflow {
                        address: descriptor.address,
                        displacement: disp,
                    });
                } else {
                    return Err(unsupported());
                }
            }
        }
        _ => unreachable!("dispatched by kind"),
    }

    Ok(out)
}
