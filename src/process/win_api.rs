//! Win32 handle helpers for probing and killing server processes.

use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, TerminateProcess, PROCESS_ACCESS_RIGHTS,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
};

/// Open `pid` with `access`, run `f` on the handle and close it again.
fn with_process<T>(pid: u32, access: PROCESS_ACCESS_RIGHTS, f: impl FnOnce(HANDLE) -> T) -> Option<T> {
    let handle = unsafe { OpenProcess(access, false, pid) }.ok()?;
    let result = f(handle);
    let _ = unsafe { CloseHandle(handle) };
    Some(result)
}

pub fn is_process_alive(pid: u32) -> bool {
    with_process(pid, PROCESS_QUERY_LIMITED_INFORMATION, |handle| {
        let mut exit_code: u32 = 0;
        unsafe { GetExitCodeProcess(handle, &mut exit_code) }.is_ok()
            && exit_code as i32 == STILL_ACTIVE.0
    })
    .unwrap_or(false)
}

/// Terminate a single process. Children are left alone.
pub fn terminate_process(pid: u32) -> windows::core::Result<()> {
    let handle = unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) }?;
    let result = unsafe { TerminateProcess(handle, 1) };
    let _ = unsafe { CloseHandle(handle) };
    result
}
