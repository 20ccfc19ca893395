//! x86-64 decode table and relocation emitter.
//!
//! Variable-length encoding: legacy prefixes and REX are resolved first,
//! then the primary opcode is matched against the row table of the active
//! opcode map. Only the encodings relocation cares about are listed; an
//! unmatched opcode is a malformed (reserved/invalid) encoding.

use better_default::Default;

use crate::decoder::{DecodeError, InstructionDescriptor, InstructionKind, Operands};
use crate::profile::{CapabilitySet, Profile};
use crate::relocator::RelocateError;

const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy)]
enum Shape {
    Plain,
    PlainTerminal,
    Imm8,
    Imm16Terminal,
    ImmZ,
    /// Immediate sized by operand size: 16/32/64 (B8..BF mov).
    ImmV,
    ModRm,
    ModRmImm8,
    ModRmImmZ,
    /// F6: ModRM, imm8 when /0 or /1 (test).
    GroupF6,
    /// F7: ModRM, immz when /0 or /1 (test).
    GroupF7,
    /// FF: inc/dec/call/jmp/push by /digit.
    GroupFF,
    Rel8,
    Rel8Cond,
    Rel32,
    Rel32Cond,
    CallRel32,
}

struct OpRow {
    caps: CapabilitySet,
    pattern: u8,
    mask: u8,
    shape: Shape,
}

const fn row(caps: CapabilitySet, pattern: u8, mask: u8, shape: Shape) -> OpRow {
    OpRow {
        caps,
        pattern,
        mask,
        shape,
    }
}

const NONE: CapabilitySet = CapabilitySet::empty();

// Primary opcode map. Exact opcodes come before masked families: 0x90 must
// match the `nop` row, not the `xchg eax, r` family, and 0xE9/0xEB must match
// before any wider mask could claim them.
static ONE_BYTE: &[OpRow] = &[
    row(NONE, 0x90, 0xFF, Shape::Plain),          // nop
    row(NONE, 0xC3, 0xFF, Shape::PlainTerminal),  // ret
    row(NONE, 0xC2, 0xFF, Shape::Imm16Terminal),  // ret imm16
    row(NONE, 0xC9, 0xFF, Shape::Plain),          // leave
    row(NONE, 0xCC, 0xFF, Shape::PlainTerminal),  // int3 (padding)
    row(NONE, 0xE8, 0xFF, Shape::CallRel32),
    row(NONE, 0xE9, 0xFF, Shape::Rel32),
    row(NONE, 0xEB, 0xFF, Shape::Rel8),
    row(NONE, 0x63, 0xFF, Shape::ModRm),          // movsxd
    row(NONE, 0x68, 0xFF, Shape::ImmZ),           // push imm
    row(NONE, 0x69, 0xFF, Shape::ModRmImmZ),      // imul r, r/m, immz
    row(NONE, 0x6A, 0xFF, Shape::Imm8),           // push imm8
    row(NONE, 0x6B, 0xFF, Shape::ModRmImm8),
    row(NONE, 0x80, 0xFF, Shape::ModRmImm8),
    row(NONE, 0x81, 0xFF, Shape::ModRmImmZ),
    row(NONE, 0x83, 0xFF, Shape::ModRmImm8),
    row(NONE, 0x8D, 0xFF, Shape::ModRm),          // lea
    row(NONE, 0x8F, 0xFF, Shape::ModRm),          // pop r/m
    row(NONE, 0xA8, 0xFF, Shape::Imm8),           // test al, imm8
    row(NONE, 0xA9, 0xFF, Shape::ImmZ),           // test eax, immz
    row(NONE, 0xC6, 0xFF, Shape::ModRmImm8),      // mov r/m8, imm8
    row(NONE, 0xC7, 0xFF, Shape::ModRmImmZ),      // mov r/m, immz
    row(NONE, 0xF6, 0xFF, Shape::GroupF6),
    row(NONE, 0xF7, 0xFF, Shape::GroupF7),
    row(NONE, 0xFE, 0xFF, Shape::ModRm),          // inc/dec r/m8
    row(NONE, 0xFF, 0xFF, Shape::GroupFF),
    row(NONE, 0x98, 0xFE, Shape::Plain),          // cwde/cdq
    row(NONE, 0xB0, 0xF8, Shape::Imm8),           // mov r8, imm8
    row(NONE, 0xB8, 0xF8, Shape::ImmV),           // mov r, imm
    row(NONE, 0x90, 0xF8, Shape::Plain),          // xchg eax, r
    row(NONE, 0xF8, 0xF8, Shape::Plain),          // clc/stc/cli/sti/cld/std
    row(NONE, 0x50, 0xF0, Shape::Plain),          // push/pop r64
    row(NONE, 0x70, 0xF0, Shape::Rel8Cond),       // jcc rel8
    row(NONE, 0x84, 0xFC, Shape::ModRm),          // test/xchg r/m
    row(NONE, 0x88, 0xFC, Shape::ModRm),          // mov r/m
    row(NONE, 0x04, 0xC7, Shape::Imm8),           // alu al, imm8
    row(NONE, 0x05, 0xC7, Shape::ImmZ),           // alu eax, immz
    row(NONE, 0x00, 0xC4, Shape::ModRm),          // alu r/m forms
];

// Secondary (0F) map.
static TWO_BYTE: &[OpRow] = &[
    row(NONE, 0x05, 0xFF, Shape::PlainTerminal),            // syscall
    row(NONE, 0x0B, 0xFF, Shape::PlainTerminal),            // ud2
    row(NONE, 0x1E, 0xFF, Shape::ModRm),                    // endbr64 et al.
    row(NONE, 0x1F, 0xFF, Shape::ModRm),                    // multi-byte nop
    row(NONE, 0xA2, 0xFF, Shape::Plain),                    // cpuid
    row(NONE, 0xAF, 0xFF, Shape::ModRm),                    // imul
    row(NONE, 0x80, 0xF0, Shape::Rel32Cond),                // jcc rel32
    row(NONE, 0x40, 0xF0, Shape::ModRm),                    // cmovcc
    row(NONE, 0x90, 0xF0, Shape::ModRm),                    // setcc
    row(NONE, 0xB6, 0xFE, Shape::ModRm),                    // movzx
    row(NONE, 0xBE, 0xFE, Shape::ModRm),                    // movsx
    row(CapabilitySet::SSE, 0x10, 0xFE, Shape::ModRm),      // movups/movss family
    row(CapabilitySet::SSE, 0x28, 0xFE, Shape::ModRm),      // movaps
    row(CapabilitySet::SSE, 0x2E, 0xFE, Shape::ModRm),      // ucomiss/comiss
    row(CapabilitySet::SSE, 0x57, 0xFF, Shape::ModRm),      // xorps
    row(CapabilitySet::SSE2, 0x6E, 0xFF, Shape::ModRm),     // movd
    row(CapabilitySet::SSE2, 0x7E, 0xFF, Shape::ModRm),
    row(CapabilitySet::SSE2, 0xEF, 0xFF, Shape::ModRm),     // pxor
];

struct ModRmInfo {
    /// Bytes consumed by ModRM + SIB + displacement.
    len: usize,
    /// /digit field.
    regop: u8,
    /// RIP-relative memory operand (mod=00, rm=101 without an address-size
    /// override).
    rip_relative: bool,
    /// Offset of the displacement field from the instruction start.
    disp_offset: usize,
    disp: i32,
}

fn parse_modrm(
    bytes: &[u8],
    pos: usize,
    address: u64,
    addr32: bool,
) -> Result<ModRmInfo, DecodeError> {
    let modrm = *bytes
        .get(pos)
        .ok_or(DecodeError::UnexpectedEof { address })?;
    let mode = modrm >> 6;
    let regop = (modrm >> 3) & 7;
    let rm = modrm & 7;

    let mut len = 1usize;
    let mut disp_size = 0usize;
    let mut rip_relative = false;

    if mode != 3 {
        if rm == 4 {
            let sib = *bytes
                .get(pos + 1)
                .ok_or(DecodeError::UnexpectedEof { address })?;
            len += 1;
            if mode == 0 && (sib & 7) == 5 {
                disp_size = 4;
            }
        } else if mode == 0 && rm == 5 {
            disp_size = 4;
            rip_relative = !addr32;
        }
        match mode {
            1 => disp_size = 1,
            2 => disp_size = 4,
            _ => {}
        }
    }

    let disp_offset = pos + len;
    if bytes.len() < disp_offset + disp_size {
        return Err(DecodeError::UnexpectedEof { address });
    }
    let disp = match disp_size {
        1 => bytes[disp_offset] as i8 as i32,
        4 => i32::from_le_bytes(bytes[disp_offset..disp_offset + 4].try_into().unwrap()),
        _ => 0,
    };
    len += disp_size;

    Ok(ModRmInfo {
        len,
        regop,
        rip_relative,
        disp_offset,
        disp,
    })
}

pub(crate) fn decode<'a>(
    buffer: &'a [u8],
    offset: usize,
    address: u64,
    profile: &Profile,
) -> Result<InstructionDescriptor<'a>, DecodeError> {
    let bytes = &buffer[offset..];
    let mut pos = 0usize;
    let mut opsize16 = false;
    let mut addr32 = false;

    // Legacy prefixes.
    loop {
        let byte = *bytes.get(pos).ok_or(DecodeError::UnexpectedEof { address })?;
        match byte {
            0x66 => opsize16 = true,
            0x67 => addr32 = true,
            0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {}
            _ => break,
        }
        pos += 1;
        if pos > 4 {
            return Err(DecodeError::Malformed { address });
        }
    }

    // REX.
    let mut rex_w = false;
    {
        let byte = *bytes.get(pos).ok_or(DecodeError::UnexpectedEof { address })?;
        if byte & 0xF0 == 0x40 {
            rex_w = byte & 0x08 != 0;
            pos += 1;
        }
    }

    // Opcode map selection.
    let mut opcode = *bytes.get(pos).ok_or(DecodeError::UnexpectedEof { address })?;
    pos += 1;
    let table = if opcode == 0x0F {
        opcode = *bytes.get(pos).ok_or(DecodeError::UnexpectedEof { address })?;
        if opcode == 0x38 || opcode == 0x3A {
            // Three-byte maps hold nothing relocation needs.
            return Err(DecodeError::Malformed { address });
        }
        pos += 1;
        TWO_BYTE
    } else {
        ONE_BYTE
    };

    let row = table
        .iter()
        .filter(|r| profile.is_enabled(r.caps))
        .find(|r| opcode & r.mask == r.pattern)
        .ok_or(DecodeError::Malformed { address })?;

    let imm_z = if opsize16 { 2 } else { 4 };
    let mut kind = InstructionKind::PositionIndependent;
    let mut operands = Operands::default();
    let mut terminal = false;

    let need = |end: usize| -> Result<(), DecodeError> {
        if bytes.len() < end {
            Err(DecodeError::UnexpectedEof { address })
        } else {
            Ok(())
        }
    };

    let apply_modrm = |pos: &mut usize,
                           kind: &mut InstructionKind,
                           operands: &mut Operands|
     -> Result<ModRmInfo, DecodeError> {
        let info = parse_modrm(bytes, *pos, address, addr32)?;
        if info.rip_relative {
            *kind = InstructionKind::PCRelativeMemoryOperand;
            operands.displacement = info.disp as i64;
            operands.disp_width = 32;
            operands.disp_offset = info.disp_offset as u8;
        }
        *pos += info.len;
        Ok(info)
    };

    match row.shape {
        Shape::Plain => {}
        Shape::PlainTerminal => terminal = true,
        Shape::Imm8 => {
            need(pos + 1)?;
            pos += 1;
        }
        Shape::Imm16Terminal => {
            need(pos + 2)?;
            pos += 2;
            terminal = true;
        }
        Shape::ImmZ => {
            need(pos + imm_z)?;
            pos += imm_z;
        }
        Shape::ImmV => {
            let size = if rex_w { 8 } else { imm_z };
            need(pos + size)?;
            pos += size;
        }
        Shape::ModRm => {
            apply_modrm(&mut pos, &mut kind, &mut operands)?;
        }
        Shape::ModRmImm8 => {
            apply_modrm(&mut pos, &mut kind, &mut operands)?;
            need(pos + 1)?;
            pos += 1;
        }
        Shape::ModRmImmZ => {
            apply_modrm(&mut pos, &mut kind, &mut operands)?;
            need(pos + imm_z)?;
            pos += imm_z;
        }
        Shape::GroupF6 | Shape::GroupF7 => {
            let info = apply_modrm(&mut pos, &mut kind, &mut operands)?;
            if info.regop < 2 {
                let size = if matches!(row.shape, Shape::GroupF6) { 1 } else { imm_z };
                need(pos + size)?;
                pos += size;
            }
        }
        Shape::GroupFF => {
            let info = apply_modrm(&mut pos, &mut kind, &mut operands)?;
            match info.regop {
                0 | 1 | 6 => {}
                2 | 3 => {
                    // Indirect call. A RIP-relative slot becomes a
                    // RelativeCall so the return-address rule applies.
                    if info.rip_relative {
                        kind = InstructionKind::RelativeCall;
                        operands.indirect = true;
                    }
                }
                4 | 5 => {
                    terminal = true;
                }
                _ => return Err(DecodeError::Malformed { address }),
            }
        }
        Shape::Rel8 | Shape::Rel8Cond => {
            need(pos + 1)?;
            operands.displacement = bytes[pos] as i8 as i64;
            operands.disp_width = 8;
            operands.disp_offset = pos as u8;
            pos += 1;
            if matches!(row.shape, Shape::Rel8) {
                kind = InstructionKind::RelativeBranch;
                terminal = true;
            } else {
                kind = InstructionKind::ConditionalRelativeBranch;
                operands.cond = Some(opcode & 0x0F);
            }
        }
        Shape::Rel32 | Shape::Rel32Cond | Shape::CallRel32 => {
            need(pos + 4)?;
            operands.displacement =
                i32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as i64;
            operands.disp_width = 32;
            operands.disp_offset = pos as u8;
            pos += 4;
            match row.shape {
                Shape::Rel32 => {
                    kind = InstructionKind::RelativeBranch;
                    terminal = true;
                }
                Shape::Rel32Cond => {
                    kind = InstructionKind::ConditionalRelativeBranch;
                    operands.cond = Some(opcode & 0x0F);
                }
                _ => kind = InstructionKind::RelativeCall,
            }
        }
    }

    let length = pos;
    if length > MAX_INSTRUCTION_LEN {
        return Err(DecodeError::Malformed { address });
    }

    // Relative targets resolve against the end of the instruction.
    match kind {
        InstructionKind::RelativeBranch
        | InstructionKind::RelativeCall
        | InstructionKind::ConditionalRelativeBranch
        | InstructionKind::PCRelativeMemoryOperand => {
            operands.target =
                (address + length as u64).wrapping_add_signed(operands.displacement);
        }
        _ => {}
    }

    Ok(InstructionDescriptor {
        address,
        raw_bytes: &bytes[..length],
        length,
        kind,
        operands,
        terminal,
    })
}

// Encoding templates, written into the output as raw bytes. All fields are
// packed, little-endian, no padding.

#[repr(packed)]
#[derive(Clone, Copy, Default)]
struct JmpE9 {
    #[default(0xE9)]
    opcode: u8,
    offset: i32,
}

/// `jmp [rip+0]` followed by the absolute target.
#[repr(packed)]
#[derive(Clone, Copy, Default)]
struct JmpAbs {
    #[default(0xFF)]
    opcode0: u8,
    #[default(0x25)]
    opcode1: u8,
    #[default(0)]
    rip_offset: u32,
    address: u64,
}

/// Inverted-condition short jump over a `jmp [rip+0]` + absolute target.
#[repr(packed)]
#[derive(Clone, Copy, Default)]
struct JccAbs {
    opcode: u8,
    #[default(0x0E)]
    skip: u8,
    #[default(0xFF)]
    jmp_opcode0: u8,
    #[default(0x25)]
    jmp_opcode1: u8,
    #[default(0)]
    rip_offset: u32,
    address: u64,
}

/// `push imm32` + `mov dword [rsp+4], imm32`: leaves a full 64-bit return
/// address on the stack without touching any register.
#[repr(packed)]
#[derive(Clone, Copy, Default)]
struct PushRet {
    #[default(0x68)]
    push_opcode: u8,
    low: u32,
    #[default([0xC7, 0x44, 0x24, 0x04])]
    mov_opcode: [u8; 4],
    high: u32,
}

fn push_raw<T: Copy>(out: &mut Vec<u8>, value: T) {
    let bytes = unsafe {
        std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
    };
    out.extend_from_slice(bytes);
}

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

/// Unconditional jump from `from` to `to`: near form when reachable,
/// RIP-indirect absolute form otherwise.
pub(crate) fn emit_jump(from: u64, to: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let disp = to.wrapping_sub(from + 5) as i64;
    if fits_i32(disp) {
        push_raw(
            &mut out,
            JmpE9 {
                offset: disp as i32,
                ..Default::default()
            },
        );
    } else {
        push_raw(
            &mut out,
            JmpAbs {
                address: to,
                ..Default::default()
            },
        );
    }
    out
}

pub(crate) fn relocate(
    descriptor: &InstructionDescriptor<'_>,
    old_address: u64,
    new_address: u64,
) -> Result<Vec<u8>, RelocateError> {
    let target = descriptor.operands.target;
    let mut out = Vec::new();

    match descriptor.kind {
        InstructionKind::RelativeBranch => {
            out = emit_jump(new_address, target);
        }
        InstructionKind::ConditionalRelativeBranch => {
            let cond = descriptor.operands.cond.unwrap_or(0);
            let disp = target.wrapping_sub(new_address + 6) as i64;
            if fits_i32(disp) {
                out.push(0x0F);
                out.push(0x80 | cond);
                out.extend_from_slice(&(disp as i32).to_le_bytes());
            } else {
                push_raw(
                    &mut out,
                    JccAbs {
                        opcode: 0x70 | (cond ^ 1),
                        address: target,
                        ..Default::default()
                    },
                );
            }
        }
        InstructionKind::RelativeCall => {
            // The callee must return to the instruction after the original
            // call, never into the trampoline.
            let return_address = old_address + descriptor.length as u64;
            push_raw(
                &mut out,
                PushRet {
                    low: return_address as u32,
                    high: (return_address >> 32) as u32,
                    ..Default::default()
                },
            );
            if descriptor.operands.indirect {
                // call [rip+disp]: jump through the original memory slot.
                let slot = target;
                let disp = slot.wrapping_sub(new_address + out.len() as u64 + 6) as i64;
                if !fits_i32(disp) {
                    return Err(RelocateError::DisplacementOverflow {
                        address: descriptor.address,
                        displacement: disp,
                    });
                }
                out.push(0xFF);
                out.push(0x25);
                out.extend_from_slice(&(disp as i32).to_le_bytes());
            } else {
                let jump = emit_jump(new_address + out.len() as u64, target);
                out.extend_from_slice(&jump);
            }
        }
        InstructionKind::PCRelativeMemoryOperand => {
            // Copy and patch the displacement field in place.
            out.extend_from_slice(descriptor.raw_bytes);
            let disp = target.wrapping_sub(new_address + descriptor.length as u64) as i64;
            if !fits_i32(disp) {
                return Err(RelocateError::DisplacementOverflow {
                    address: descriptor.address,
                    displacement: disp,
                });
            }
            let at = descriptor.operands.disp_offset as usize;
            out[at..at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        }
        _ => unreachable!("dispatched by kind"),
    }

    Ok(out)
}
