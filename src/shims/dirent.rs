//! `WrapPOSIXdirent_h`: `opendir`/`readdir`/`closedir` (spec-full §4.13).

use std::io;
use std::os::raw::c_char;

use crate::checker::DIRChecker;
use crate::error::Argument;
use crate::pointer_object::PointerTarget;

use super::{RawArgs, RawResult, ShimCall};

fn check_dir(call: &mut ShimCall<'_, '_>, parameter_index: u32, handle: u64) -> io::Result<bool> {
    let known = call.process.dirs.snapshot();
    match DIRChecker::check_dir(handle, &known) {
        Ok(()) => Ok(true),
        Err(mut e) => {
            e.arguments_mut().push(Argument::ParameterIndex(parameter_index));
            call.listener.raise(e)?;
            Ok(false)
        }
    }
}

pub fn opendir(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, name) = (args[0] as u32, args[1]);
    if call.check_c_string(0, name)?.is_none() {
        return Ok(None);
    }
    let handle = unsafe { libc::opendir(name as *const c_char) } as u64;
    let tag = if handle != 0 {
        call.process.dirs.register(handle);
        PointerTarget::new(handle, 0)
    } else {
        PointerTarget::NULL
    };
    call.listener.notify_value_ptr(instr, handle, tag)?;
    Ok(Some(handle))
}

pub fn readdir(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dir) = (args[0] as u32, args[1]);
    if !check_dir(&mut call, 0, dir)? {
        return Ok(None);
    }
    let entry = unsafe { libc::readdir(dir as *mut libc::DIR) } as u64;
    let tag =
        if entry != 0 { PointerTarget::new(entry, 0) } else { PointerTarget::NULL };
    call.listener.notify_value_ptr(instr, entry, tag)?;
    Ok(Some(entry))
}

pub fn closedir(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dir) = (args[0] as u32, args[1]);
    if !check_dir(&mut call, 0, dir)? {
        return Ok(None);
    }
    let result = unsafe { libc::closedir(dir as *mut libc::DIR) };
    call.process.dirs.deregister(dir);
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}
