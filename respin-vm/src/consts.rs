//! Session parameters and defaults.

/// Default capacity for decoded instructions per session.
pub const DEFAULT_DECODE_INSTRS: usize = 2048;

/// Default capacity for decoded basic blocks per session.
pub const DEFAULT_DECODE_BLOCKS: usize = 256;

/// Default capacity for captured instructions per session.
pub const DEFAULT_CAPTURE_INSTRS: usize = 4096;

/// Default capacity for captured basic blocks per session.
pub const DEFAULT_CAPTURE_BLOCKS: usize = 256;

/// Default size of the generated-code region in bytes.
pub const DEFAULT_CODE_BYTES: usize = 64 * 1024;

/// Size of the emulated stack in bytes.
pub const EMU_STACK_SIZE: usize = 16 * 1024;

/// Gap left above the initial stack pointer for the caller-visible frame
/// (return address slot plus alignment slack).
pub const EMU_STACK_HEADROOM: usize = 256;

/// Maximum number of integer argument registers under the System-V ABI.
pub const MAX_INT_ARGS: usize = 6;
