//! `WrapClocale_h`: `localeconv`/`setlocale` (spec-full §4.13). Both return
//! pointers into libc-owned static storage, marked as internal-static known
//! regions rather than tracer-owned allocations (spec §4.11 step 6).

use std::io;
use std::os::raw::c_char;

use crate::pointer_object::PointerTarget;

use super::{RawArgs, RawResult, ShimCall};

pub fn localeconv(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let instr = args[0] as u32;
    let result = unsafe { libc::localeconv() } as u64;
    let tag = if result != 0 {
        call.record_internal_static(result, std::mem::size_of::<libc::lconv>() as u64);
        PointerTarget::new(result, 0)
    } else {
        PointerTarget::NULL
    };
    call.listener.notify_value_ptr(instr, result, tag)?;
    Ok(Some(result))
}

pub fn setlocale(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, category, locale) = (args[0] as u32, args[1] as i32, args[2]);
    if locale != 0 && call.check_c_string(1, locale)?.is_none() {
        return Ok(None);
    }
    let locale_ptr = if locale == 0 { std::ptr::null() } else { locale as *const c_char };
    let result = unsafe { libc::setlocale(category, locale_ptr) } as u64;
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
