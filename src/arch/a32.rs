//! A32 (classic ARM) decode table and relocation emitter.
//!
//! Fixed-width 4-byte instructions, so length is O(1) and the whole decode
//! is one table scan. The unconditional (cond=1111) space is matched before
//! any cond-masked row; a generic row placed earlier would claim those words
//! and mis-classify them.
//!
//! Synthesized sequences use PC literal loads only and never clobber a
//! general register (`bl` writes `lr`, which the original wrote anyway).
//! The trampoline base is assumed 4-aligned, as any A32 code address is.

use crate::decoder::{DecodeError, InstructionDescriptor, InstructionKind, Operands};
use crate::profile::{CapabilitySet, Profile};
use crate::relocator::RelocateError;

const COND_AL: u8 = 0xE;

#[derive(Debug, Clone, Copy)]
enum Shape {
    /// BLX <label>: mode-switching immediate call, no rewrite rule.
    BlxImm,
    /// PLD and friends.
    Preload,
    /// Remaining cond=1111 space (barriers, CPS, SETEND).
    UncondSpace,
    Bx,
    BlxReg,
    MovPcReg,
    Branch,
    BranchLink,
    LdrLiteral,
    AdrAdd,
    AdrSub,
    MovwMovt,
    Hint,
    DataProcImm,
    DataProcReg,
    LoadStore,
    LoadStoreMulti,
    Svc,
    Coproc,
}

struct OpRow {
    caps: CapabilitySet,
    pattern: u32,
    mask: u32,
    shape: Shape,
}

const fn row(caps: CapabilitySet, pattern: u32, mask: u32, shape: Shape) -> OpRow {
    OpRow {
        caps,
        pattern,
        mask,
        shape,
    }
}

const NONE: CapabilitySet = CapabilitySet::empty();

static ROWS: &[OpRow] = &[
    // cond=1111 space first.
    row(CapabilitySet::V5T, 0xFA00_0000, 0xFE00_0000, Shape::BlxImm),
    row(CapabilitySet::V5TE, 0xF450_F000, 0xFC70_F000, Shape::Preload),
    row(NONE, 0xF000_0000, 0xF000_0000, Shape::UncondSpace),
    // Exact misc encodings before the data-processing catch-all.
    row(CapabilitySet::V4T, 0x012F_FF10, 0x0FFF_FFF0, Shape::Bx),
    row(CapabilitySet::V5T, 0x012F_FF30, 0x0FFF_FFF0, Shape::BlxReg),
    row(NONE, 0x01A0_F000, 0x0FFF_FFF0, Shape::MovPcReg),
    row(NONE, 0x0A00_0000, 0x0F00_0000, Shape::Branch),
    row(NONE, 0x0B00_0000, 0x0F00_0000, Shape::BranchLink),
    // PC-relative loads/address forms before the generic single-transfer
    // and data-processing rows that would otherwise claim them.
    row(NONE, 0x051F_0000, 0x0F7F_0000, Shape::LdrLiteral),
    row(NONE, 0x028F_0000, 0x0FFF_0000, Shape::AdrAdd),
    row(NONE, 0x024F_0000, 0x0FFF_0000, Shape::AdrSub),
    row(CapabilitySet::V6T2, 0x0300_0000, 0x0FF0_0000, Shape::MovwMovt),
    row(CapabilitySet::V6T2, 0x0340_0000, 0x0FF0_0000, Shape::MovwMovt),
    row(NONE, 0x0320_F000, 0x0FFF_F000, Shape::Hint),
    // Generic families.
    row(NONE, 0x0200_0000, 0x0E00_0000, Shape::DataProcImm),
    row(NONE, 0x0000_0000, 0x0C00_0000, Shape::DataProcReg),
    row(NONE, 0x0400_0000, 0x0C00_0000, Shape::LoadStore),
    row(NONE, 0x0800_0000, 0x0E00_0000, Shape::LoadStoreMulti),
    row(NONE, 0x0F00_0000, 0x0F00_0000, Shape::Svc),
    row(NONE, 0x0C00_0000, 0x0C00_0000, Shape::Coproc),
];

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Encode a value as an A32 modified immediate (8 bits rotated right by an
/// even amount), returning `rot << 8 | imm8`.
fn encode_modified_imm(value: u32) -> Option<u32> {
    for rot in 0..16u32 {
        let imm8 = value.rotate_left(2 * rot);
        if imm8 <= 0xFF {
            return Some(rot << 8 | imm8);
        }
    }
    None
}

pub(crate) fn decode<'a>(
    buffer: &'a [u8],
    offset: usize,
    address: u64,
    profile: &Profile,
) -> Result<InstructionDescriptor<'a>, DecodeError> {
    let bytes = &buffer[offset..];
    if bytes.len() < 4 {
        return Err(DecodeError::UnexpectedEof { address });
    }
    let word = u32::from_le_bytes(bytes[..4].try_into().unwrap());

    let row = ROWS
        .iter()
        .filter(|r| profile.is_enabled(r.caps))
        .find(|r| word & r.mask == r.pattern)
        .ok_or(DecodeError::Malformed { address })?;

    let cond = (word >> 28) as u8;
    let rn = ((word >> 16) & 0xF) as u8;
    let rd = ((word >> 12) & 0xF) as u8;
    let rm = (word & 0xF) as u8;

    let mut kind = InstructionKind::PositionIndependent;
    let mut operands = Operands::default();
    let mut terminal = false;

    match row.shape {
        Shape::BlxImm | Shape::Preload | Shape::UncondSpace | Shape::Coproc => {
            kind = InstructionKind::Unsupported;
        }
        Shape::Bx => terminal = true,
        Shape::BlxReg | Shape::Hint | Shape::MovwMovt | Shape::Svc => {}
        Shape::MovPcReg => terminal = true,
        Shape::Branch | Shape::BranchLink => {
            let disp = sign_extend(word & 0x00FF_FFFF, 24) << 2;
            operands.displacement = disp;
            operands.disp_width = 26;
            operands.cond = Some(cond);
            operands.target = (address + 8).wrapping_add_signed(disp);
            if matches!(row.shape, Shape::BranchLink) {
                kind = InstructionKind::RelativeCall;
            } else {
                kind = InstructionKind::RelativeBranch;
                if cond == COND_AL {
                    terminal = true;
                } else {
                    kind = InstructionKind::ConditionalRelativeBranch;
                }
            }
        }
        Shape::LdrLiteral => {
            let imm12 = (word & 0xFFF) as i64;
            let disp = if word & (1 << 23) != 0 { imm12 } else { -imm12 };
            operands.displacement = disp;
            operands.disp_width = 12;
            operands.cond = Some(cond);
            operands.target_reg = Some(rd);
            operands.target = (address + 8).wrapping_add_signed(disp);
            kind = InstructionKind::PCRelativeMemoryOperand;
            // ldr pc, [pc, #imm] is a literal-pool jump.
            terminal = rd == 15;
        }
        Shape::AdrAdd | Shape::AdrSub => {
            if rd == 15 {
                kind = InstructionKind::Unsupported;
            } else {
                let rot = (word >> 8) & 0xF;
                let value = (word & 0xFF).rotate_right(2 * rot) as i64;
                let disp = if matches!(row.shape, Shape::AdrAdd) { value } else { -value };
                operands.displacement = disp;
                operands.disp_width = 12;
                operands.cond = Some(cond);
                operands.target_reg = Some(rd);
                operands.target = (address + 8).wrapping_add_signed(disp);
                kind = InstructionKind::PCRelativeMemoryOperand;
            }
        }
        Shape::DataProcImm => {
            // Anything reading or writing the PC here has no rewrite rule
            // (the ADR forms were matched above).
            if rn == 15 || rd == 15 {
                kind = InstructionKind::Unsupported;
            }
        }
        Shape::DataProcReg => {
            let reg_shift = word & (1 << 4) != 0 && word & (1 << 7) == 0;
            let rs = ((word >> 8) & 0xF) as u8;
            if rn == 15 || rd == 15 || rm == 15 || (reg_shift && rs == 15) {
                kind = InstructionKind::Unsupported;
            }
        }
        Shape::LoadStore => {
            let load = word & (1 << 20) != 0;
            let reg_offset = word & (1 << 25) != 0;
            if rn == 15 || (reg_offset && rm == 15) || (rd == 15 && !load) {
                kind = InstructionKind::Unsupported;
            } else if rd == 15 {
                // ldr pc, [rn, ...]: indirect jump, position independent.
                terminal = true;
            }
        }
        Shape::LoadStoreMulti => {
            let load = word & (1 << 20) != 0;
            if rn == 15 {
                kind = InstructionKind::Unsupported;
            } else if load && word & (1 << 15) != 0 {
                // pop {.., pc}
                terminal = true;
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

fn push_word(out: &mut Vec<u8>, word: u32) {
    out.extend_from_slice(&word.to_le_bytes());
}

fn branch_displacement_fits(disp: i64) -> bool {
    disp % 4 == 0 && (-(1 << 25)..(1 << 25)).contains(&disp)
}

fn encode_branch(cond: u8, disp: i64) -> u32 {
    (cond as u32) << 28 | 0x0A00_0000 | ((disp >> 2) as u32 & 0x00FF_FFFF)
}

/// Unconditional jump from `from` to `to`: a plain B when in range, a
/// `ldr pc, [pc, #-4]` literal-pool jump otherwise.
pub(crate) fn emit_jump(from: u64, to: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let disp = to.wrapping_sub(from + 8) as i64;
    if branch_displacement_fits(disp) {
        push_word(&mut out, encode_branch(COND_AL, disp));
    } else {
        push_word(&mut out, 0xE51F_F004);
        push_word(&mut out, to as u32);
    }
    out
}

pub(crate) fn relocate(
    descriptor: &InstructionDescriptor<'_>,
    old_address: u64,
    new_address: u64,
) -> Result<Vec<u8>, RelocateError> {
    let target = descriptor.operands.target;
    let cond = descriptor.operands.cond.unwrap_or(COND_AL);
    let word = u32::from_le_bytes(descriptor.raw_bytes[..4].try_into().unwrap());
    let mut out = Vec::new();

    match descriptor.kind {
        InstructionKind::RelativeBranch => {
            out = emit_jump(new_address, target);
        }
        InstructionKind::ConditionalRelativeBranch => {
            let disp = target.wrapping_sub(new_address + 8) as i64;
            if branch_displacement_fits(disp) {
                push_word(&mut out, encode_branch(cond, disp));
            } else {
                // ldr<c> pc, [pc, #0]   ; literal at +8
                // b   +0                ; over the literal
                // .word target
                push_word(&mut out, (cond as u32) << 28 | 0x059F_F000);
                push_word(&mut out, encode_branch(COND_AL, 0));
                push_word(&mut out, target as u32);
            }
        }
        InstructionKind::RelativeCall => {
            // lr must hold the address after the *original* bl, so a plain
            // re-encoded bl (which would link to the trampoline) is never
            // emitted.
            let return_address = (old_address + 4) as u32;
            if cond == COND_AL {
                // ldr lr, [pc, #0] ; ldr pc, [pc, #0] ; .word ret ; .word target
                push_word(&mut out, 0xE59F_E000);
                push_word(&mut out, 0xE59F_F000);
                push_word(&mut out, return_address);
                push_word(&mut out, target as u32);
            } else {
                push_word(&mut out, (cond as u32) << 28 | 0x059F_E004);
                push_word(&mut out, (cond as u32) << 28 | 0x059F_F004);
                push_word(&mut out, encode_branch(COND_AL, 4));
                push_word(&mut out, return_address);
                push_word(&mut out, target as u32);
            }
        }
        InstructionKind::PCRelativeMemoryOperand => {
            let disp = target.wrapping_sub(new_address + 8) as i64;
            if word >> 26 & 0x3 == 0x1 {
                // LDR literal: re-encode U bit + imm12.
                if disp.unsigned_abs() > 0xFFF {
                    return Err(RelocateError::DisplacementOverflow {
                        address: descriptor.address,
                        displacement: disp,
                    });
                }
                let mut encoded = word & !(1 << 23) & !0xFFF;
                if disp >= 0 {
                    encoded |= 1 << 23;
                }
                encoded |= disp.unsigned_abs() as u32;
                push_word(&mut out, encoded);
            } else {
                // ADR: re-encode as ADD/SUB rd, pc, #modified-imm.
                let rd = descriptor.operands.target_reg.unwrap_or(0) as u32;
                let magnitude = u32::try_from(disp.unsigned_abs()).map_err(|_| {
                    RelocateError::DisplacementOverflow {
                        address: descriptor.address,
                        displacement: disp,
                    }
                })?;
                let imm = encode_modified_imm(magnitude).ok_or(
                    RelocateError::DisplacementOverflow {
                        address: descriptor.address,
                        displacement: disp,
                    },
                )?;
                let opcode = if disp >= 0 { 0x028F_0000 } else { 0x024F_0000 };
                push_word(&mut out, (cond as u32) << 28 | opcode | rd << 12 | imm);
            }
        }
        _ => unreachable!("dispatched by kind"),
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_one;

    fn a32() -> Profile {
        Profile::a32()
    }

    fn decode_word(word: u32, address: u64) -> (InstructionDescriptor<'static>, Vec<u8>) {
        let bytes = word.to_le_bytes().to_vec().leak();
        (decode_one(bytes, 0, address, &a32()).unwrap(), bytes.to_vec())
    }

    #[test]
    fn branch_forms() {
        // b .+8
        let (b, _) = decode_word(0xEA00_0000, 0x8000);
        assert_eq!(b.kind, InstructionKind::RelativeBranch);
        assert!(b.terminal);
        assert_eq!(b.operands.target, 0x8008);

        // bne .-4 (imm24 = -3)
        let (bne, _) = decode_word(0x1AFF_FFFD, 0x8000);
        assert_eq!(bne.kind, InstructionKind::ConditionalRelativeBranch);
        assert!(!bne.terminal);
        assert_eq!(bne.operands.cond, Some(0x1));
        assert_eq!(bne.operands.target, 0x7FFC);

        // bl .+8
        let (bl, _) = decode_word(0xEB00_0000, 0x8000);
        assert_eq!(bl.kind, InstructionKind::RelativeCall);
        assert_eq!(bl.operands.target, 0x8008);
    }

    #[test]
    fn literal_load_and_adr() {
        // ldr r0, [pc, #4]
        let (ldr, _) = decode_word(0xE59F_0004, 0x8000);
        assert_eq!(ldr.kind, InstructionKind::PCRelativeMemoryOperand);
        assert_eq!(ldr.operands.target, 0x800C);
        assert_eq!(ldr.operands.target_reg, Some(0));

        // ldr r1, [pc, #-8]
        let (neg, _) = decode_word(0xE51F_1008, 0x8000);
        assert_eq!(neg.operands.target, 0x8000);

        // adr r2, .+16 (add r2, pc, #8)
        let (adr, _) = decode_word(0xE28F_2008, 0x8000);
        assert_eq!(adr.kind, InstructionKind::PCRelativeMemoryOperand);
        assert_eq!(adr.operands.target, 0x8010);
    }

    #[test]
    fn position_independent_and_terminal() {
        // push {r4, lr}
        let (push, _) = decode_word(0xE92D_4010, 0x8000);
        assert_eq!(push.kind, InstructionKind::PositionIndependent);
        assert!(!push.terminal);

        // pop {r4, pc}
        let (pop, _) = decode_word(0xE8BD_8010, 0x8000);
        assert_eq!(pop.kind, InstructionKind::PositionIndependent);
        assert!(pop.terminal);

        // bx lr
        let (bx, _) = decode_word(0xE12F_FF1E, 0x8000);
        assert_eq!(bx.kind, InstructionKind::PositionIndependent);
        assert!(bx.terminal);

        // mov r0, #0
        let (mov, _) = decode_word(0xE3A0_0000, 0x8000);
        assert_eq!(mov.kind, InstructionKind::PositionIndependent);
    }

    #[test]
    fn pc_operands_are_unsupported() {
        // add r0, pc, r1
        let (add, _) = decode_word(0xE08F_0001, 0x8000);
        assert_eq!(add.kind, InstructionKind::Unsupported);
        assert_eq!(add.length, 4);

        // str r0, [pc, #4]
        let (str_pc, _) = decode_word(0xE58F_0004, 0x8000);
        assert_eq!(str_pc.kind, InstructionKind::Unsupported);
    }

    #[test]
    fn capability_gating() {
        // movw r0, #0xf000: imm4 = 15 sits in the Rn field, so without V6T2
        // the word falls through to the data-processing row and is flagged.
        let word = 0xE300_0000 | 0xF << 16;
        let (movw, _) = decode_word(word, 0x8000);
        assert_eq!(movw.kind, InstructionKind::PositionIndependent);

        let v4 = Profile::a32().with_capabilities(CapabilitySet::V4T);
        let bytes = word.to_le_bytes();
        let old = decode_one(&bytes, 0, 0x8000, &v4).unwrap();
        assert_eq!(old.kind, InstructionKind::Unsupported);
    }

    #[test]
    fn branch_reencode_round_trip() {
        let (b, _) = decode_word(0xEA00_0010, 0x8000); // b .+0x48
        let out = relocate(&b, 0x8000, 0x4_0000).unwrap();
        assert_eq!(out.len(), 4);
        let word = u32::from_le_bytes(out[..4].try_into().unwrap());
        assert_eq!(word >> 24, 0xEA);
        let disp = sign_extend(word & 0xFF_FFFF, 24) << 2;
        assert_eq!(b.operands.target, (0x4_0000u64 + 8).wrapping_add_signed(disp));
    }

    #[test]
    fn far_branch_uses_literal_pool_jump() {
        let (b, _) = decode_word(0xEA00_0000, 0x8000);
        let out = relocate(&b, 0x8000, 0x7000_0000).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), 0xE51F_F004);
        assert_eq!(
            u32::from_le_bytes(out[4..8].try_into().unwrap()),
            b.operands.target as u32
        );
    }

    #[test]
    fn conditional_far_branch_skips_literal() {
        let (beq, _) = decode_word(0x0A00_0000, 0x8000); // beq .+8
        let out = relocate(&beq, 0x8000, 0x7000_0000).unwrap();
        assert_eq!(out.len(), 12);
        // ldreq pc, [pc, #0]
        assert_eq!(
            u32::from_le_bytes(out[..4].try_into().unwrap()),
            0x059F_F000
        );
        // b over the literal
        assert_eq!(
            u32::from_le_bytes(out[4..8].try_into().unwrap()),
            0xEA00_0000
        );
        assert_eq!(
            u32::from_le_bytes(out[8..12].try_into().unwrap()),
            beq.operands.target as u32
        );
    }

    #[test]
    fn call_links_original_return_address() {
        let (bl, _) = decode_word(0xEB00_0000, 0x8000); // bl .+8
        let out = relocate(&bl, 0x8000, 0x7000_0000).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), 0xE59F_E000);
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 0xE59F_F000);
        // lr literal: the address after the original bl, not the trampoline.
        assert_eq!(u32::from_le_bytes(out[8..12].try_into().unwrap()), 0x8004);
        assert_eq!(u32::from_le_bytes(out[12..16].try_into().unwrap()), 0x8008);
    }

    #[test]
    fn literal_load_reencode_and_overflow() {
        let (ldr, _) = decode_word(0xE59F_0004, 0x8000); // ldr r0, [pc, #4]
        // Close by: re-encoded with a new displacement.
        let out = relocate(&ldr, 0x8000, 0x8100).unwrap();
        let word = u32::from_le_bytes(out[..4].try_into().unwrap());
        let imm12 = (word & 0xFFF) as i64;
        let disp = if word & (1 << 23) != 0 { imm12 } else { -imm12 };
        assert_eq!(ldr.operands.target, (0x8100u64 + 8).wrapping_add_signed(disp));

        // Too far: imm12 cannot express the new displacement.
        let err = relocate(&ldr, 0x8000, 0x7000_0000).unwrap_err();
        assert!(matches!(err, RelocateError::DisplacementOverflow { .. }));
    }
}
