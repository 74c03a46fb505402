//! `WrapCerrno_h`: `strerror` and `__errno_location` (spec-full §4.13). Both
//! return pointers into libc-owned static storage (spec §4.11 step 6).

use std::io;
use std::os::raw::c_char;

use crate::pointer_object::PointerTarget;

use super::{RawArgs, RawResult, ShimCall};

pub fn strerror(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, errnum) = (args[0] as u32, args[1] as i32);
    let result = unsafe { libc::strerror(errnum) } as u64;
    let tag = if result != 0 {
        let len = unsafe { libc::strlen(result as *const c_char) };
        call.record_internal_static(result, len as u64 + 1);
        PointerTarget::new(result, 0)
    } else {
        PointerTarget::NULL
    };
    call.listener.notify_value_ptr(instr, result, tag)?;
    Ok(Some(result))
}

pub fn errno_location(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let instr = args[0] as u32;
    let result = unsafe { libc::__errno_location() } as u64;
    call.record_internal_static(result, std::mem::size_of::<i32>() as u64);
    let tag = PointerTarget::new(result, 0);
    call.listener.notify_value_ptr(instr, result, tag)?;
    Ok(Some(result))
}
