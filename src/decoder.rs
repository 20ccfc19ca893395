//! Minimal architecture-aware instruction decoder.
//!
//! The decoder's only job is to find safe instruction boundaries and classify
//! each instruction's addressing mode; there is no mnemonic or operand text.
//! Each architecture owns an ordered table of `{capabilities, pattern, mask,
//! shape}` rows scanned linearly, first match wins. Rows are ordered
//! most-specific-mask first: special-cased encodings (privileged, size
//! prefixed, extension forms) must be checked before their generic supersets,
//! so the ordering is a correctness requirement, not an optimization.

use crate::arch;
use crate::profile::{Arch, Profile};

/// Addressing-mode classification of one decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// Byte-for-byte copyable; executes identically at any address.
    PositionIndependent,
    /// Unconditional branch with an address-relative target.
    RelativeBranch,
    /// Call with an address-relative target. The relocated form must leave
    /// the return address of the *original* next instruction, never a
    /// trampoline address.
    RelativeCall,
    /// Conditional branch with an address-relative target.
    ConditionalRelativeBranch,
    /// Memory operand addressed relative to the instruction's own address
    /// (RIP-relative, PC literal load, ADR).
    PCRelativeMemoryOperand,
    /// Recognized encoding with no defined rewrite rule. The length is still
    /// valid so the cursor can advance; relocation of this instruction fails.
    Unsupported,
}

/// Architecture-specific fields needed to rewrite an instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Operands {
    /// Signed displacement as encoded, scaled to bytes.
    pub displacement: i64,
    /// Effective width of the displacement in bits.
    pub disp_width: u8,
    /// Byte offset of the displacement/immediate field inside the
    /// instruction (used by x64 in-place displacement patching).
    pub disp_offset: u8,
    /// Resolved absolute branch target or effective memory address.
    pub target: u64,
    /// Condition code for conditional forms.
    pub cond: Option<u8>,
    /// Destination/transfer register for literal loads and ADR forms, and
    /// the tested register for CBZ/CBNZ.
    pub target_reg: Option<u8>,
    /// Number of predicated instructions following an IT instruction. The
    /// IT instruction and its block form an atomic unit that must never be
    /// split across the patch boundary.
    pub it_block_len: u8,
    /// The target is reached through a memory slot (x64 `call [rip+disp]`).
    pub indirect: bool,
}

/// One decoded instruction. Created per decode step, consumed immediately by
/// the relocator, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct InstructionDescriptor<'a> {
    /// Absolute address the instruction originally executes at.
    pub address: u64,
    /// The encoded bytes, exactly `length` long.
    pub raw_bytes: &'a [u8],
    pub length: usize,
    pub kind: InstructionKind,
    pub operands: Operands,
    /// Control flow never falls through this instruction (return,
    /// unconditional indirect jump, pop into the program counter).
    pub terminal: bool,
}

/// Position within the source byte buffer plus the originating absolute
/// address. Advances monotonically; the decoder never produces a zero-length
/// instruction, so a decode loop can never stall.
#[derive(Debug, Clone, Copy)]
pub struct DecodeCursor {
    pub offset: usize,
    pub address: u64,
}

impl DecodeCursor {
    pub fn new(address: u64) -> Self {
        Self { offset: 0, address }
    }

    pub fn advance(&mut self, len: usize) {
        debug_assert!(len > 0, "decoder must consume at least one byte");
        self.offset += len;
        self.address += len as u64;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// No decode-table row matches the bytes at the cursor.
    #[error("no decode table row matches the encoding at {address:#x}")]
    Malformed { address: u64 },
    /// The source buffer ends in the middle of an instruction.
    #[error("source buffer ends inside the instruction at {address:#x}")]
    UnexpectedEof { address: u64 },
}

/// Decode exactly one instruction.
///
/// `buffer[offset]` is the first byte of the instruction and
/// `base_address + offset` its absolute address. Pure function of its inputs;
/// the returned length is always strictly positive.
pub fn decode_one<'a>(
    buffer: &'a [u8],
    offset: usize,
    base_address: u64,
    profile: &Profile,
) -> Result<InstructionDescriptor<'a>, DecodeError> {
    let address = base_address + offset as u64;
    if offset >= buffer.len() {
        return Err(DecodeError::UnexpectedEof { address });
    }
    match profile.arch() {
        Arch::X64 => arch::x64::decode(buffer, offset, address, profile),
        Arch::A32 => arch::a32::decode(buffer, offset, address, profile),
        Arch::Thumb => arch::thumb::decode(buffer, offset, address, profile),
    }
}
