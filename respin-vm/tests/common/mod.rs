//! Shared helpers: hand-assembled guest functions hosted in executable
//! storage.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use respin_vm::CodeStorage;

/// A guest function built from raw machine code. The storage keeps the
/// bytes mapped (and executable) for the test's lifetime.
pub struct Guest {
    _storage: CodeStorage,
    pub addr: u64,
}

impl Guest {
    pub fn load(bytes: &[u8]) -> Self {
        let mut storage = CodeStorage::new(4096).expect("map guest storage");
        let addr = storage.push(bytes).expect("store guest code");
        storage.make_executable().expect("make guest executable");
        Self {
            _storage: storage,
            addr,
        }
    }

    /// Address the next `load` within `reserve`d storage would get; used
    /// when the bytes must embed their own absolute addresses.
    pub fn load_with(build: impl FnOnce(u64) -> Vec<u8>) -> Self {
        let mut storage = CodeStorage::new(4096).expect("map guest storage");
        let at = storage.reserve(0).expect("reserve");
        let bytes = build(at);
        let addr = storage.push(&bytes).expect("store guest code");
        storage.make_executable().expect("make guest executable");
        Self {
            _storage: storage,
            addr,
        }
    }
}

/// Call `addr` as `fn(u64) -> u64` under the System-V ABI.
pub fn call1(addr: u64, a: u64) -> u64 {
    let f: extern "sysv64" fn(u64) -> u64 = unsafe { std::mem::transmute(addr as usize) };
    f(a)
}

/// Call `addr` as `fn(u64, u64) -> u64`.
pub fn call2(addr: u64, a: u64, b: u64) -> u64 {
    let f: extern "sysv64" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(addr as usize) };
    f(a, b)
}

/// Call `addr` as `fn(*const f64, i64, *const u8) -> f64`.
pub fn call_fp(addr: u64, m: *const f64, xsize: i64, s: *const u8) -> f64 {
    let f: extern "sysv64" fn(*const f64, i64, *const u8) -> f64 =
        unsafe { std::mem::transmute(addr as usize) };
    f(m, xsize, s)
}

/// Bytes of the generated function, for structural assertions.
pub fn generated_bytes(rw: &respin_vm::Rewriter) -> Vec<u8> {
    let addr = rw.generated_code().expect("code was generated");
    let size = rw.generated_size();
    unsafe { std::slice::from_raw_parts(addr as *const u8, size) }.to_vec()
}
