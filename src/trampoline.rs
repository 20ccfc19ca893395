//! Trampoline builder.
//!
//! Decodes whole instructions from the patch site until the patch window is
//! covered, relocates each one for execution at the trampoline address, and
//! appends a continuation jump back to the first uncopied instruction. The
//! builder is a pure planner: it never touches target memory, it only
//! produces bytes and a plan describing them.

use log::{debug, trace};

use crate::arch;
use crate::decoder::{decode_one, DecodeCursor, DecodeError, InstructionKind};
use crate::profile::{Arch, Profile};
use crate::relocator::{relocate, RelocateError, RelocationFragment, ScratchPolicy};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The instruction stream cannot cover the patch window: the source
    /// buffer ran out, or control flow terminates before enough bytes are
    /// consumed.
    #[error("cannot cover the patch window; instruction stream ends at {address:#x}")]
    InsufficientSpace { address: u64 },
    /// An instruction in the window has no decode row or sits where the
    /// builder cannot place it (non-trivial instruction inside an IT block).
    #[error("unsupported instruction at {address:#x}")]
    UnsupportedInstruction { address: u64 },
    #[error(transparent)]
    Relocate(#[from] RelocateError),
}

/// The outcome of planning: ordered fragments plus the bookkeeping a caller
/// needs to install the hook.
#[derive(Debug, Clone)]
pub struct TrampolinePlan {
    fragments: Vec<RelocationFragment>,
    relocated_length: usize,
    continuation_address: u64,
}

impl TrampolinePlan {
    /// Relocated instruction fragments in original program order, followed
    /// by the synthesized continuation jump.
    pub fn fragments(&self) -> &[RelocationFragment] {
        &self.fragments
    }

    /// Source bytes consumed at the patch site. Always at least the
    /// requested patch window, and always a whole number of instructions.
    pub fn relocated_length(&self) -> usize {
        self.relocated_length
    }

    /// First original instruction *not* copied into the trampoline; the
    /// continuation jump lands here.
    pub fn continuation_address(&self) -> u64 {
        self.continuation_address
    }

    /// Concatenate the fragments into the final byte image.
    pub fn emit(&self) -> TrampolineBuffer {
        let mut bytes = Vec::with_capacity(self.fragments.iter().map(RelocationFragment::len).sum());
        for fragment in &self.fragments {
            bytes.extend_from_slice(fragment.bytes());
        }
        TrampolineBuffer { bytes }
    }
}

/// Finished trampoline image, ready to be copied to executable memory at the
/// address the plan was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrampolineBuffer {
    bytes: Vec<u8>,
}

impl TrampolineBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builder over a snapshot of the bytes at the patch site.
///
/// `trampoline_address` is where the emitted bytes will execute; relocated
/// displacements and the continuation jump are computed against it, so the
/// caller must place the buffer exactly there.
pub struct TrampolineBuilder<'a> {
    source_address: u64,
    source: &'a [u8],
    profile: Profile,
    trampoline_address: u64,
    min_patch_size: Option<usize>,
    scratch_policy: ScratchPolicy,
}

impl<'a> TrampolineBuilder<'a> {
    pub fn new(
        source_address: u64,
        source: &'a [u8],
        profile: Profile,
        trampoline_address: u64,
    ) -> Self {
        Self {
            source_address,
            source,
            profile,
            trampoline_address,
            min_patch_size: None,
            scratch_policy: ScratchPolicy::default(),
        }
    }

    /// Override the patch window. Defaults to the profile's minimum patch
    /// jump size.
    pub fn min_patch_size(mut self, size: usize) -> Self {
        self.min_patch_size = Some(size);
        self
    }

    pub fn scratch_policy(mut self, policy: ScratchPolicy) -> Self {
        self.scratch_policy = policy;
        self
    }

    pub fn build(self) -> Result<TrampolinePlan, BuildError> {
        let min_patch = self
            .min_patch_size
            .unwrap_or_else(|| self.profile.min_patch_size());
        plan(
            self.source_address,
            self.source,
            min_patch,
            &self.profile,
            self.trampoline_address,
            self.scratch_policy,
        )
    }
}

/// One-call form of [`TrampolineBuilder`] with the default scratch policy.
pub fn build_trampoline(
    source_address: u64,
    source: &[u8],
    min_patch_size: usize,
    profile: &Profile,
    trampoline_address: u64,
) -> Result<TrampolinePlan, BuildError> {
    plan(
        source_address,
        source,
        min_patch_size,
        profile,
        trampoline_address,
        ScratchPolicy::default(),
    )
}

fn plan(
    source_address: u64,
    source: &[u8],
    min_patch_size: usize,
    profile: &Profile,
    trampoline_address: u64,
    scratch_policy: ScratchPolicy,
) -> Result<TrampolinePlan, BuildError> {
    let mut cursor = DecodeCursor::new(source_address);
    let mut fragments = Vec::new();
    let mut new_offset = 0usize;
    // Predicated instructions still owed to an open IT block. The block is
    // atomic: the window is extended past min_patch_size until it closes.
    let mut it_remaining = 0u8;

    while cursor.offset < min_patch_size || it_remaining > 0 {
        let descriptor = match decode_one(source, cursor.offset, source_address, profile) {
            Ok(descriptor) => descriptor,
            Err(DecodeError::Malformed { address }) => {
                return Err(BuildError::UnsupportedInstruction { address });
            }
            Err(DecodeError::UnexpectedEof { address }) => {
                return Err(BuildError::InsufficientSpace { address });
            }
        };
        if it_remaining > 0 && descriptor.kind != InstructionKind::PositionIndependent {
            // Relocating a predicated branch or literal reference would
            // change its size and break the IT mask.
            return Err(BuildError::UnsupportedInstruction {
                address: descriptor.address,
            });
        }

        let fragment = relocate(
            &descriptor,
            descriptor.address,
            trampoline_address + new_offset as u64,
            scratch_policy,
            profile,
        )?;
        trace!(
            "{:#x}: {} byte(s) -> {} byte(s) at trampoline offset {:#x}",
            descriptor.address,
            descriptor.length,
            fragment.len(),
            new_offset
        );
        new_offset += fragment.len();

        if it_remaining > 0 {
            it_remaining -= 1;
        } else {
            it_remaining = descriptor.operands.it_block_len;
        }

        let terminal = descriptor.terminal;
        fragments.push(fragment);
        cursor.advance(descriptor.length);

        if terminal && (cursor.offset < min_patch_size || it_remaining > 0) {
            // Nothing executes after a terminal instruction; the bytes that
            // follow cannot be assumed to be code.
            return Err(BuildError::InsufficientSpace {
                address: cursor.address,
            });
        }
    }

    let continuation_address = cursor.address;
    let jump = match profile.arch() {
        Arch::X64 => arch::x64::emit_jump(trampoline_address + new_offset as u64, continuation_address),
        Arch::A32 => arch::a32::emit_jump(trampoline_address + new_offset as u64, continuation_address),
        Arch::Thumb => {
            arch::thumb::emit_jump(trampoline_address + new_offset as u64, continuation_address)
        }
    };
    fragments.push(RelocationFragment::Synthesized(jump));

    debug!(
        "trampoline for {:#x}: {} source byte(s) relocated, continuation {:#x}",
        source_address, cursor.offset, continuation_address
    );
    Ok(TrampolinePlan {
        fragments,
        relocated_length: cursor.offset,
        continuation_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_whole_instructions_past_the_window() {
        let profile = Profile::x64();
        // push rbp; mov rbp, rsp; mov eax, imm32 (boundary at 4 splits the mov)
        let code = [0x55, 0x48, 0x89, 0xE5, 0xB8, 0x01, 0x00, 0x00, 0x00];
        let plan = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap();
        assert_eq!(plan.relocated_length(), 9);
        assert_eq!(plan.continuation_address(), 0x1009);
    }

    #[test]
    fn terminal_before_window_is_insufficient_space() {
        let profile = Profile::x64();
        // xor eax, eax; ret; then padding
        let code = [0x31, 0xC0, 0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC];
        let err = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap_err();
        assert!(matches!(err, BuildError::InsufficientSpace { address: 0x1003 }));
    }

    #[test]
    fn truncated_source_is_insufficient_space() {
        let profile = Profile::x64();
        let code = [0x55, 0x48];
        let err = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap_err();
        assert!(matches!(err, BuildError::InsufficientSpace { .. }));
    }

    #[test]
    fn undecodable_byte_is_unsupported() {
        let profile = Profile::x64();
        let code = [0x06, 0x90, 0x90, 0x90, 0x90];
        let err = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnsupportedInstruction { address: 0x1000 }
        ));
    }

    #[test]
    fn builder_defaults_to_profile_window() {
        let profile = Profile::a32();
        // push {fp, lr}; mov fp, sp; sub sp, sp, #8
        let code: Vec<u8> = [0xE92D4800u32, 0xE1A0B00D, 0xE24DD008]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let plan = TrampolineBuilder::new(0x1_0000, &code, profile, 0x9_0000)
            .build()
            .unwrap();
        assert_eq!(plan.relocated_length(), 8);
        assert_eq!(plan.continuation_address(), 0x1_0008);
    }

    #[test]
    fn it_block_is_kept_whole() {
        let profile = Profile::thumb();
        // push {r4, lr}; sub sp, #8; mov r4, r0; add r1, r2;
        // it eq; moveq r0, #1; bx lr
        let code: Vec<u8> = [0xB510u16, 0xB082, 0x4604, 0x4411, 0xBF08, 0x2001, 0x4770]
            .iter()
            .flat_map(|hw| hw.to_le_bytes())
            .collect();
        // A 10-byte window ends right after the IT instruction; the block
        // must drag its predicated mov in as well.
        let plan = build_trampoline(0x9000, &code, 10, &profile, 0x0002_0000).unwrap();
        assert_eq!(plan.relocated_length(), 12);
        assert_eq!(plan.continuation_address(), 0x900C);
    }

    #[test]
    fn predicated_branch_in_it_block_is_rejected() {
        let profile = Profile::thumb();
        // nop sled; it eq; beq .+0x20 (predicated branch cannot be resized)
        let code: Vec<u8> = [0xBF00u16, 0xBF00, 0xBF00, 0xBF00, 0xBF08, 0xD010, 0x4770]
            .iter()
            .flat_map(|hw| hw.to_le_bytes())
            .collect();
        let err = build_trampoline(0x9000, &code, 10, &profile, 0x0002_0000).unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnsupportedInstruction { address: 0x900A }
        ));
    }

    #[test]
    fn emit_concatenates_fragments_in_order() {
        let profile = Profile::x64();
        let code = [0x55, 0x48, 0x89, 0xE5, 0x90, 0x90];
        let plan = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap();
        let buffer = plan.emit();
        let total: usize = plan.fragments().iter().map(RelocationFragment::len).sum();
        assert_eq!(buffer.len(), total);
        assert_eq!(&buffer.as_bytes()[..5], &code[..5]);
    }
}
