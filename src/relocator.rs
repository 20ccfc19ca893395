//! Relocator / code emitter.
//!
//! Given a classified instruction and its old/new addresses, emits either a
//! verbatim copy or a semantically equivalent rewritten encoding. Pure: no
//! memory is written here, only bytes are produced.

use log::trace;

use crate::arch;
use crate::decoder::{InstructionDescriptor, InstructionKind};
use crate::profile::{Arch, Profile};

/// Bytes produced for one instruction. An ordered sequence of fragments
/// forms the trampoline body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationFragment {
    /// Verbatim copy of the original encoding.
    Copy(Vec<u8>),
    /// Rewritten or synthesized replacement sequence. May be longer than the
    /// original instruction.
    Synthesized(Vec<u8>),
}

impl RelocationFragment {
    pub fn bytes(&self) -> &[u8] {
        match self {
            RelocationFragment::Copy(bytes) => bytes,
            RelocationFragment::Synthesized(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

/// Register-clobber policy for synthesized absolute-jump sequences.
///
/// No liveness analysis is performed. The default policy never touches a
/// general register: x64 sequences go through RIP-indirect jumps and stack
/// pushes, A32/Thumb sequences go through PC literal loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScratchPolicy {
    /// Synthesize register-free sequences only.
    #[default]
    AvoidRegisters,
    /// The caller vouches that this general register is dead across the
    /// patch boundary. Accepted for forward compatibility; every sequence
    /// currently emitted is register-free, so this behaves like
    /// [`ScratchPolicy::AvoidRegisters`].
    Register(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum RelocateError {
    /// The instruction's addressing mode has no defined rewrite rule.
    #[error("unsupported instruction at {address:#x}")]
    UnsupportedInstruction { address: u64 },
    /// A PC-relative reference cannot be re-expressed at the new address.
    #[error("displacement {displacement:#x} not encodable at new address for instruction at {address:#x}")]
    DisplacementOverflow { address: u64, displacement: i64 },
}

/// Rewrite one instruction for execution at `new_address`.
///
/// The emitted fragment, executed at `new_address`, has the same observable
/// effect as the original instruction at `old_address`, except that any
/// program-counter-valued side effect is corrected to the recomputed target.
pub fn relocate(
    descriptor: &InstructionDescriptor<'_>,
    old_address: u64,
    new_address: u64,
    _scratch_policy: ScratchPolicy,
    profile: &Profile,
) -> Result<RelocationFragment, RelocateError> {
    match descriptor.kind {
        InstructionKind::PositionIndependent => {
            Ok(RelocationFragment::Copy(descriptor.raw_bytes.to_vec()))
        }
        InstructionKind::Unsupported => Err(RelocateError::UnsupportedInstruction {
            address: descriptor.address,
        }),
        _ => {
            trace!(
                "relocating {:?} at {:#x} -> {:#x}, target {:#x}",
                descriptor.kind,
                old_address,
                new_address,
                descriptor.operands.target
            );
            let bytes = match profile.arch() {
                Arch::X64 => arch::x64::relocate(descriptor, old_address, new_address)?,
                Arch::A32 => arch::a32::relocate(descriptor, old_address, new_address)?,
                Arch::Thumb => {
                    arch::thumb::relocate(descriptor, old_address, new_address, profile)?
                }
            };
            Ok(RelocationFragment::Synthesized(bytes))
        }
    }
}
