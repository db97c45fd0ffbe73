//! Runtime helpers called from generated code.
//!
//! Every helper takes its operands by address so that one calling sequence
//! works on all targets, whatever their float return convention. The
//! conversions follow Rust `as` semantics: saturating, with NaN mapping
//! to zero.

macro_rules! convert {
    ($($name:ident: $from:ty => $to:ty;)*) => {
        $(
            /// Convert the value at `src` and store it at `dst`.
            ///
            /// # Safety
            /// Both pointers must be valid and may be unaligned.
            pub unsafe extern "C" fn $name(dst: *mut $to, src: *const $from) {
                // SAFETY: guaranteed by the caller.
                unsafe { dst.write_unaligned(src.read_unaligned() as $to) }
            }
        )*
    };
}

convert! {
    f32_to_i32: f32 => i32;
    f32_to_u32: f32 => u32;
    f32_to_i64: f32 => i64;
    f32_to_u64: f32 => u64;
    f64_to_i32: f64 => i32;
    f64_to_u32: f64 => u32;
    f64_to_i64: f64 => i64;
    f64_to_u64: f64 => u64;
    u32_to_f32: u32 => f32;
    u32_to_f64: u32 => f64;
    i64_to_f32: i64 => f32;
    i64_to_f64: i64 => f64;
    u64_to_f32: u64 => f32;
    u64_to_f64: u64 => f64;
}

/// `*dst = *a % *b` with `fmod` semantics.
///
/// # Safety
/// All pointers must be valid and may be unaligned.
pub unsafe extern "C" fn rem_f32(dst: *mut f32, a: *const f32, b: *const f32) {
    // SAFETY: guaranteed by the caller.
    unsafe { dst.write_unaligned(a.read_unaligned() % b.read_unaligned()) }
}

/// # Safety
/// All pointers must be valid and may be unaligned.
pub unsafe extern "C" fn rem_f64(dst: *mut f64, a: *const f64, b: *const f64) {
    // SAFETY: guaranteed by the caller.
    unsafe { dst.write_unaligned(a.read_unaligned() % b.read_unaligned()) }
}

/// Copy `dwords` 32-bit words from `src` to `dst`.
///
/// # Safety
/// Both ranges must be valid; they may overlap.
pub unsafe extern "C" fn copy_dwords(dst: *mut u8, src: *const u8, dwords: u32) {
    // SAFETY: guaranteed by the caller.
    unsafe { std::ptr::copy(src, dst, dwords as usize * 4) }
}
