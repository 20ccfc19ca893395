//! Instruction-level machinery for inline function hooking: a boundary
//! decoder, a relocating code emitter, and a trampoline planner for x86-64,
//! A32 and Thumb.
//!
//! The crate stays below memory management: it reads a snapshot of the bytes
//! at a prospective patch site and produces the bytes of a trampoline that
//! re-executes the displaced instructions before jumping back. Allocating
//! executable memory, flushing caches and writing the patch itself are the
//! caller's business.
//!
//! ```no_run
//! use springboard::{build_trampoline, Profile};
//!
//! let profile = Profile::x64();
//! let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
//! let plan = build_trampoline(0x1000, &code, profile.min_patch_size(), &profile, 0x7000_0000)?;
//! let image = plan.emit();
//! # Ok::<(), springboard::BuildError>(())
//! ```

mod arch;
pub mod decoder;
pub mod profile;
pub mod relocator;
pub mod trampoline;

pub use decoder::{
    decode_one, DecodeCursor, DecodeError, InstructionDescriptor, InstructionKind, Operands,
};
pub use profile::{Arch, CapabilitySet, Profile};
pub use relocator::{relocate, RelocateError, RelocationFragment, ScratchPolicy};
pub use trampoline::{
    build_trampoline, BuildError, TrampolineBuffer, TrampolineBuilder, TrampolinePlan,
};
