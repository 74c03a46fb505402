//! `WrapPOSIXunistd_h`: `read`/`write`/`close` (spec-full §4.13).

use std::io;
use std::os::raw::c_void;

use super::{RawArgs, RawResult, ShimCall};

pub fn read(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, fd, buf, count) = (args[0] as u32, args[1] as i32, args[2], args[3]);
    if !call.check_write(1, buf, count)? {
        return Ok(None);
    }
    let n = unsafe { libc::read(fd, buf as *mut c_void, count as usize) };
    if n > 0 {
        call.record_write(buf, n as u64)?;
    }
    call.listener.notify_value_int(instr, n as i64 as u64)?;
    Ok(Some(n as i64 as u64))
}

pub fn write(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, fd, buf, count) = (args[0] as u32, args[1] as i32, args[2], args[3]);
    if !call.check_read(1, buf, count)? {
        return Ok(None);
    }
    let n = unsafe { libc::write(fd, buf as *const c_void, count as usize) };
    call.listener.notify_value_int(instr, n as i64 as u64)?;
    Ok(Some(n as i64 as u64))
}

pub fn close(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, fd) = (args[0] as u32, args[1] as i32);
    let result = unsafe { libc::close(fd) };
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}
