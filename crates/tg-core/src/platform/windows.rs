//! Windows implementation of the platform traits.
//!
//! Every kernel handle lives in an [`OwnedHandle`] and every registry key in
//! a [`RegKey`]; both close exactly once on drop, whichever path returns.

use super::{accept_truncated, ExitWatch, Platform, ProcessExit, PolicyStore, ProcessControl, ProcessEntry, ProcessGroup};
use crossbeam_channel::Sender;
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::OnceLock;
use tg_common::{OsError, ProcessId};
use tracing::{debug, trace, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, BOOL, BOOLEAN, ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, HANDLE,
    INVALID_HANDLE_VALUE, WIN32_ERROR,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, Thread32First, Thread32Next,
    PROCESSENTRY32W, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, IsProcessInJob, JobObjectBasicProcessIdList,
    JobObjectExtendedLimitInformation, QueryInformationJobObject, SetInformationJobObject,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK,
};
use windows::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegDeleteKeyW, RegDeleteValueW, RegOpenKeyExW,
    RegQueryInfoKeyW, RegQueryValueExW, RegSetValueExW, HKEY, HKEY_CURRENT_USER,
    HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_READ, KEY_SET_VALUE, KEY_WRITE, REG_DWORD, REG_OPTION_NON_VOLATILE, REG_VALUE_TYPE,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, GetProcessInformation, OpenProcess, OpenThread,
    ProcessPowerThrottling, QueryFullProcessImageNameW, RegisterWaitForSingleObject,
    SetPriorityClass, SetProcessInformation, SetThreadInformation, SetThreadPriority,
    ThreadPowerThrottling, UnregisterWaitEx, HIGH_PRIORITY_CLASS, PROCESS_MODE_BACKGROUND_END,
    PROCESS_NAME_WIN32, PROCESS_POWER_THROTTLING_CURRENT_VERSION,
    PROCESS_POWER_THROTTLING_EXECUTION_SPEED, PROCESS_POWER_THROTTLING_IGNORE_TIMER_RESOLUTION,
    PROCESS_POWER_THROTTLING_STATE, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_INFORMATION,
    PROCESS_SET_QUOTA, PROCESS_SYNCHRONIZE, PROCESS_TERMINATE, THREAD_POWER_THROTTLING_CURRENT_VERSION,
    THREAD_POWER_THROTTLING_EXECUTION_SPEED, THREAD_POWER_THROTTLING_STATE,
    THREAD_PRIORITY_ABOVE_NORMAL, THREAD_QUERY_LIMITED_INFORMATION, THREAD_SET_INFORMATION,
    WT_EXECUTEONLYONCE,
};

const STILL_ACTIVE: u32 = 259;
const INFINITE: u32 = u32::MAX;
const WINDOWS_11_FIRST_BUILD: u32 = 22000;

const POWER_THROTTLING_KEY: &str = r"SYSTEM\CurrentControlSet\Control\Power\PowerThrottling";
const IFEO_KEY: &str = r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Image File Execution Options";
const CURRENT_VERSION_KEY: &str = r"SOFTWARE\Microsoft\Windows NT\CurrentVersion";
const CPU_PRIORITY_HIGH: u32 = 3;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_os_error(err: &windows::core::Error) -> OsError {
    let hr = err.code().0 as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        OsError::new(hr & 0xFFFF)
    } else {
        OsError::new(hr)
    }
}

fn win32(status: WIN32_ERROR) -> Result<(), OsError> {
    if status == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(OsError::new(status.0))
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|c| *c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// RAII wrapper for a kernel HANDLE.
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn new(handle: HANDLE) -> Option<Self> {
        if handle.is_invalid() {
            None
        } else {
            Some(Self(handle))
        }
    }

    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is valid and owned exclusively by this guard.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

// SAFETY: kernel handles are process-global and may be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

/// Registry root a key path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hive {
    LocalMachine,
    #[cfg_attr(not(test), allow(dead_code))]
    CurrentUser,
}

impl Hive {
    fn hkey(self) -> HKEY {
        match self {
            Hive::LocalMachine => HKEY_LOCAL_MACHINE,
            Hive::CurrentUser => HKEY_CURRENT_USER,
        }
    }
}

/// RAII wrapper for an open registry key.
struct RegKey(HKEY);

impl Drop for RegKey {
    fn drop(&mut self) {
        // SAFETY: the key was opened by us and is closed exactly once.
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

impl RegKey {
    fn create(hive: Hive, path: &str) -> Result<Self, OsError> {
        let sub = wide(path);
        let mut key = HKEY::default();
        // SAFETY: all pointers reference live locals for the duration of the call.
        let status = unsafe {
            RegCreateKeyExW(
                hive.hkey(),
                PCWSTR(sub.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_WRITE,
                None,
                &mut key,
                None,
            )
        };
        win32(status)?;
        Ok(Self(key))
    }

    fn open(
        hive: Hive,
        path: &str,
        access: windows::Win32::System::Registry::REG_SAM_FLAGS,
    ) -> Result<Self, OsError> {
        let sub = wide(path);
        let mut key = HKEY::default();
        // SAFETY: as above.
        let status =
            unsafe { RegOpenKeyExW(hive.hkey(), PCWSTR(sub.as_ptr()), 0, access, &mut key) };
        win32(status)?;
        Ok(Self(key))
    }

    fn set_dword(&self, name: &str, value: u32) -> Result<(), OsError> {
        let name = wide(name);
        let bytes = value.to_le_bytes();
        // SAFETY: `bytes` outlives the call.
        let status =
            unsafe { RegSetValueExW(self.0, PCWSTR(name.as_ptr()), 0, REG_DWORD, Some(&bytes)) };
        win32(status)
    }

    fn delete_value(&self, name: &str) -> Result<(), OsError> {
        let name = wide(name);
        // SAFETY: `name` outlives the call.
        let status = unsafe { RegDeleteValueW(self.0, PCWSTR(name.as_ptr())) };
        ignore_not_found(win32(status))
    }

    fn query_string(&self, name: &str) -> Option<String> {
        let name = wide(name);
        let mut buf = [0u16; 64];
        let mut len = (buf.len() * 2) as u32;
        let mut kind = REG_VALUE_TYPE::default();
        // SAFETY: buffer and length describe the same live allocation.
        let status = unsafe {
            RegQueryValueExW(
                self.0,
                PCWSTR(name.as_ptr()),
                None,
                Some(&mut kind),
                Some(buf.as_mut_ptr().cast()),
                Some(&mut len),
            )
        };
        win32(status).ok()?;
        Some(from_wide(&buf))
    }

    /// Whether the key has neither subkeys nor values.
    fn is_empty(&self) -> Result<bool, OsError> {
        let mut subkeys = 0u32;
        let mut values = 0u32;
        // SAFETY: only the two counters are requested; both are live locals.
        let status = unsafe {
            RegQueryInfoKeyW(
                self.0,
                PWSTR::null(),
                None,
                None,
                Some(&mut subkeys),
                None,
                None,
                Some(&mut values),
                None,
                None,
                None,
                None,
            )
        };
        win32(status)?;
        Ok(subkeys == 0 && values == 0)
    }
}

fn delete_key(hive: Hive, path: &str) -> Result<(), OsError> {
    let sub = wide(path);
    // SAFETY: `sub` outlives the call.
    let status = unsafe { RegDeleteKeyW(hive.hkey(), PCWSTR(sub.as_ptr())) };
    ignore_not_found(win32(status))
}

fn ignore_not_found(result: Result<(), OsError>) -> Result<(), OsError> {
    match result {
        Err(err) if err.code == ERROR_FILE_NOT_FOUND.0 => Ok(()),
        other => other,
    }
}

/// Windows 11 added timer-resolution throttling; include it in the mask
/// there so both forms of EcoQoS are cleared.
fn throttling_control_mask() -> u32 {
    static MASK: OnceLock<u32> = OnceLock::new();
    *MASK.get_or_init(|| {
        let build = RegKey::open(Hive::LocalMachine, CURRENT_VERSION_KEY, KEY_READ)
            .ok()
            .and_then(|key| key.query_string("CurrentBuildNumber"))
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);
        debug!(build, "detected Windows build");
        if build >= WINDOWS_11_FIRST_BUILD {
            PROCESS_POWER_THROTTLING_EXECUTION_SPEED | PROCESS_POWER_THROTTLING_IGNORE_TIMER_RESOLUTION
        } else {
            PROCESS_POWER_THROTTLING_EXECUTION_SPEED
        }
    })
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

struct WindowsProcess {
    pid: ProcessId,
    handle: OwnedHandle,
}

impl ProcessControl for WindowsProcess {
    fn is_throttled(&self) -> Result<bool, OsError> {
        let mut state = PROCESS_POWER_THROTTLING_STATE {
            Version: PROCESS_POWER_THROTTLING_CURRENT_VERSION,
            ..Default::default()
        };
        // SAFETY: `state` is a correctly sized, writable struct.
        unsafe {
            GetProcessInformation(
                self.handle.raw(),
                ProcessPowerThrottling,
                &mut state as *mut _ as *mut c_void,
                size_of::<PROCESS_POWER_THROTTLING_STATE>() as u32,
            )
        }
        .map_err(|e| to_os_error(&e))?;
        Ok(state.StateMask & PROCESS_POWER_THROTTLING_EXECUTION_SPEED != 0)
    }

    fn force_full_power(&self) -> Result<(), OsError> {
        let handle = self.handle.raw();
        // Leaving background mode fails harmlessly when not in it.
        // SAFETY: handle has PROCESS_SET_INFORMATION.
        if let Err(e) = unsafe { SetPriorityClass(handle, PROCESS_MODE_BACKGROUND_END) } {
            trace!(pid = %self.pid, code = to_os_error(&e).code, "background end rejected");
        }

        let state = PROCESS_POWER_THROTTLING_STATE {
            Version: PROCESS_POWER_THROTTLING_CURRENT_VERSION,
            ControlMask: throttling_control_mask(),
            StateMask: 0,
        };
        // SAFETY: `state` is a correctly sized struct that outlives the call.
        unsafe {
            SetProcessInformation(
                handle,
                ProcessPowerThrottling,
                &state as *const _ as *const c_void,
                size_of::<PROCESS_POWER_THROTTLING_STATE>() as u32,
            )
        }
        .map_err(|e| to_os_error(&e))?;

        // SAFETY: as above.
        unsafe { SetPriorityClass(handle, HIGH_PRIORITY_CLASS) }.map_err(|e| to_os_error(&e))
    }

    fn is_alive(&self) -> bool {
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer.
        match unsafe { GetExitCodeProcess(self.handle.raw(), &mut code) } {
            Ok(()) => code == STILL_ACTIVE,
            Err(_) => false,
        }
    }

    fn image_path(&self) -> Option<String> {
        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        // SAFETY: buffer and length describe the same live allocation.
        unsafe {
            QueryFullProcessImageNameW(
                self.handle.raw(),
                PROCESS_NAME_WIN32,
                windows::core::PWSTR(buf.as_mut_ptr()),
                &mut len,
            )
        }
        .ok()?;
        Some(String::from_utf16_lossy(&buf[..len as usize]))
    }

    fn in_foreign_group(&self) -> bool {
        let mut in_job = BOOL(0);
        // SAFETY: a null job handle asks about membership in any job.
        match unsafe { IsProcessInJob(self.handle.raw(), HANDLE::default(), &mut in_job) } {
            Ok(()) => in_job.as_bool(),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Exit notification
// ---------------------------------------------------------------------------

struct ExitContext {
    exit: ProcessExit,
    notify: Sender<ProcessExit>,
}

unsafe extern "system" fn on_process_exit(context: *mut c_void, _timed_out: BOOLEAN) {
    // SAFETY: `context` points at the boxed ExitContext owned by the
    // WindowsExitWatch, which outlives every callback (UnregisterWaitEx
    // blocks until callbacks finish before the box is freed).
    let ctx = unsafe { &*(context as *const ExitContext) };
    let _ = ctx.notify.send(ctx.exit);
}

struct WindowsExitWatch {
    wait: HANDLE,
    _process: OwnedHandle,
    _context: Box<ExitContext>,
}

// SAFETY: the wait handle is only used to unregister, from any thread.
unsafe impl Send for WindowsExitWatch {}

impl ExitWatch for WindowsExitWatch {}

impl Drop for WindowsExitWatch {
    fn drop(&mut self) {
        // SAFETY: INVALID_HANDLE_VALUE makes this block until any running
        // callback has returned, after which the context may be freed.
        if let Err(e) = unsafe { UnregisterWaitEx(self.wait, INVALID_HANDLE_VALUE) } {
            warn!(code = to_os_error(&e).code, "failed to unregister exit wait");
        }
    }
}

// ---------------------------------------------------------------------------
// Job objects
// ---------------------------------------------------------------------------

const MAX_JOB_PIDS: usize = 1024;

#[repr(C)]
struct PidList {
    assigned: u32,
    in_list: u32,
    ids: [usize; MAX_JOB_PIDS],
}

struct WindowsJob {
    job: OwnedHandle,
}

impl ProcessGroup for WindowsJob {
    fn assign(&self, pid: ProcessId) -> Result<(), OsError> {
        // SAFETY: plain FFI call.
        let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid.0) }
            .map_err(|e| to_os_error(&e))?;
        let process = OwnedHandle::new(process).ok_or_else(OsError::invalid_handle)?;
        // SAFETY: both handles are valid for the call.
        unsafe { AssignProcessToJobObject(self.job.raw(), process.raw()) }
            .map_err(|e| to_os_error(&e))
    }

    fn member_pids(&self, buf: &mut [u32]) -> Result<usize, OsError> {
        let mut list = Box::new(PidList {
            assigned: 0,
            in_list: 0,
            ids: [0; MAX_JOB_PIDS],
        });
        // SAFETY: `list` is a writable buffer of the advertised size.
        let queried = unsafe {
            QueryInformationJobObject(
                self.job.raw(),
                JobObjectBasicProcessIdList,
                list.as_mut() as *mut PidList as *mut c_void,
                size_of::<PidList>() as u32,
                None,
            )
        }
        .map_err(|e| to_os_error(&e));
        if accept_truncated(queried)? {
            trace!(
                assigned = list.assigned,
                listed = list.in_list,
                "job member list truncated"
            );
        }
        let n = (list.in_list as usize).min(MAX_JOB_PIDS).min(buf.len());
        for (slot, id) in buf.iter_mut().zip(list.ids.iter()).take(n) {
            *slot = *id as u32;
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Live Windows platform.
#[derive(Debug, Default)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }

    fn open(&self, pid: ProcessId, access: windows::Win32::System::Threading::PROCESS_ACCESS_RIGHTS) -> Result<OwnedHandle, OsError> {
        // SAFETY: plain FFI call.
        let handle = unsafe { OpenProcess(access, false, pid.0) }.map_err(|e| to_os_error(&e))?;
        OwnedHandle::new(handle).ok_or_else(OsError::invalid_handle)
    }
}

impl Platform for WindowsPlatform {
    fn open_process(&self, pid: ProcessId) -> Result<Box<dyn ProcessControl>, OsError> {
        let handle = self.open(
            pid,
            PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_SET_INFORMATION,
        )?;
        Ok(Box::new(WindowsProcess { pid, handle }))
    }

    fn watch_exit(
        &self,
        exit: ProcessExit,
        notify: Sender<ProcessExit>,
    ) -> Result<Box<dyn ExitWatch>, OsError> {
        let process = self.open(exit.pid, PROCESS_SYNCHRONIZE)?;
        let context = Box::new(ExitContext { exit, notify });
        let mut wait = HANDLE::default();
        // SAFETY: the context box is kept alive by the returned watch until
        // the wait has been unregistered.
        unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                process.raw(),
                Some(on_process_exit),
                Some(context.as_ref() as *const ExitContext as *const c_void),
                INFINITE,
                WT_EXECUTEONLYONCE,
            )
        }
        .map_err(|e| to_os_error(&e))?;
        Ok(Box::new(WindowsExitWatch {
            wait,
            _process: process,
            _context: context,
        }))
    }

    fn create_group(&self) -> Result<Box<dyn ProcessGroup>, OsError> {
        // SAFETY: anonymous job with default security.
        let job = unsafe { CreateJobObjectW(None, PCWSTR::null()) }.map_err(|e| to_os_error(&e))?;
        let job = OwnedHandle::new(job).ok_or_else(OsError::invalid_handle)?;

        let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK;
        // SAFETY: `limits` is a correctly sized struct that outlives the call.
        unsafe {
            SetInformationJobObject(
                job.raw(),
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const c_void,
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        }
        .map_err(|e| to_os_error(&e))?;
        Ok(Box::new(WindowsJob { job }))
    }

    fn disable_thread_throttling(&self, pid: ProcessId) -> usize {
        // SAFETY: plain FFI call.
        let snapshot = match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) } {
            Ok(h) => match OwnedHandle::new(h) {
                Some(h) => h,
                None => return 0,
            },
            Err(_) => return 0,
        };

        let state = THREAD_POWER_THROTTLING_STATE {
            Version: THREAD_POWER_THROTTLING_CURRENT_VERSION,
            ControlMask: THREAD_POWER_THROTTLING_EXECUTION_SPEED,
            StateMask: 0,
        };
        let mut entry = THREADENTRY32 {
            dwSize: size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut updated = 0;

        // SAFETY: `entry` is sized and writable; snapshot handle is valid.
        let mut more = unsafe { Thread32First(snapshot.raw(), &mut entry) }.is_ok();
        while more {
            if entry.th32OwnerProcessID == pid.0 {
                // SAFETY: plain FFI call.
                let opened = unsafe {
                    OpenThread(
                        THREAD_SET_INFORMATION | THREAD_QUERY_LIMITED_INFORMATION,
                        false,
                        entry.th32ThreadID,
                    )
                };
                if let Some(thread) = opened.ok().and_then(OwnedHandle::new) {
                    // SAFETY: `state` is a correctly sized struct.
                    let cleared = unsafe {
                        SetThreadInformation(
                            thread.raw(),
                            ThreadPowerThrottling,
                            &state as *const _ as *const c_void,
                            size_of::<THREAD_POWER_THROTTLING_STATE>() as u32,
                        )
                    };
                    // SAFETY: plain FFI call.
                    let _ = unsafe { SetThreadPriority(thread.raw(), THREAD_PRIORITY_ABOVE_NORMAL) };
                    if cleared.is_ok() {
                        updated += 1;
                    }
                }
            }
            // SAFETY: as above.
            more = unsafe { Thread32Next(snapshot.raw(), &mut entry) }.is_ok();
        }
        updated
    }

    fn snapshot(&self) -> Result<Vec<ProcessEntry>, OsError> {
        // SAFETY: plain FFI call.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
            .map_err(|e| to_os_error(&e))?;
        let snapshot = OwnedHandle::new(snapshot).ok_or_else(OsError::invalid_handle)?;

        let mut entry = PROCESSENTRY32W {
            dwSize: size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };
        let mut out = Vec::with_capacity(256);
        // SAFETY: `entry` is sized and writable; snapshot handle is valid.
        let mut more = unsafe { Process32FirstW(snapshot.raw(), &mut entry) }.is_ok();
        while more {
            out.push(ProcessEntry {
                pid: ProcessId(entry.th32ProcessID),
                parent: ProcessId(entry.th32ParentProcessID),
                image: from_wide(&entry.szExeFile),
            });
            // SAFETY: as above.
            more = unsafe { Process32NextW(snapshot.raw(), &mut entry) }.is_ok();
        }
        Ok(out)
    }

    fn image_name(&self, pid: ProcessId) -> Option<String> {
        let handle = self.open(pid, PROCESS_QUERY_LIMITED_INFORMATION).ok()?;
        let process = WindowsProcess { pid, handle };
        let path = process.image_path()?;
        Some(tg_common::normalize_image_name(&path))
    }
}

// ---------------------------------------------------------------------------
// Registry policy store
// ---------------------------------------------------------------------------

/// Persistent policy entries in HKLM.
#[derive(Debug)]
pub struct RegistryPolicyStore {
    hive: Hive,
    throttling_key: String,
    ifeo_key: String,
}

impl Default for RegistryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryPolicyStore {
    pub fn new() -> Self {
        Self {
            hive: Hive::LocalMachine,
            throttling_key: POWER_THROTTLING_KEY.to_string(),
            ifeo_key: IFEO_KEY.to_string(),
        }
    }

    /// Same layout under a per-user scratch key.
    #[cfg(test)]
    fn under_user_key(base: &str) -> Self {
        Self {
            hive: Hive::CurrentUser,
            throttling_key: format!(r"{base}\PowerThrottling"),
            ifeo_key: format!(r"{base}\Image File Execution Options"),
        }
    }

    fn ifeo_path(&self, image: &str) -> String {
        format!(r"{}\{image}", self.ifeo_key)
    }

    /// Delete the IFEO key for `image` only when nothing else lives in it.
    fn delete_image_key_if_empty(&self, image_key: &str) -> Result<bool, OsError> {
        let key = match RegKey::open(self.hive, image_key, KEY_QUERY_VALUE) {
            Ok(key) => key,
            Err(err) if err.code == ERROR_FILE_NOT_FOUND.0 => return Ok(false),
            Err(err) => return Err(err),
        };
        if !key.is_empty()? {
            return Ok(false);
        }
        drop(key);
        delete_key(self.hive, image_key)?;
        Ok(true)
    }
}

impl PolicyStore for RegistryPolicyStore {
    fn set_throttle_exclusion(&self, path: &str) -> Result<(), OsError> {
        RegKey::create(self.hive, &self.throttling_key)?.set_dword(path, 1)
    }

    fn remove_throttle_exclusion(&self, path: &str) -> Result<(), OsError> {
        match RegKey::open(self.hive, &self.throttling_key, KEY_SET_VALUE) {
            Ok(key) => key.delete_value(path),
            Err(err) => ignore_not_found(Err(err)),
        }
    }

    fn set_priority_override(&self, image: &str) -> Result<(), OsError> {
        let perf = format!(r"{}\PerfOptions", self.ifeo_path(image));
        RegKey::create(self.hive, &perf)?.set_dword("CpuPriorityClass", CPU_PRIORITY_HIGH)
    }

    fn remove_priority_override(&self, image: &str) -> Result<(), OsError> {
        let image_key = self.ifeo_path(image);
        delete_key(self.hive, &format!(r"{image_key}\PerfOptions"))?;
        match self.delete_image_key_if_empty(&image_key) {
            Ok(true) => {}
            Ok(false) => debug!(image, "IFEO image key has other settings, kept"),
            Err(err) => debug!(image, code = err.code, "IFEO image key kept"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store(tag: &str) -> (RegistryPolicyStore, String) {
        let base = format!(r"Software\throttle-guard-test-{}-{tag}", std::process::id());
        (RegistryPolicyStore::under_user_key(&base), base)
    }

    fn cleanup(base: &str) {
        for key in [
            format!(r"{base}\Image File Execution Options\game.exe\PerfOptions"),
            format!(r"{base}\Image File Execution Options\game.exe"),
            format!(r"{base}\Image File Execution Options"),
            format!(r"{base}\PowerThrottling"),
            base.to_string(),
        ] {
            let _ = delete_key(Hive::CurrentUser, &key);
        }
    }

    #[test]
    fn test_priority_override_removal_keeps_other_ifeo_values() {
        let (store, base) = scratch_store("kept");
        let image_key = store.ifeo_path("game.exe");
        RegKey::create(Hive::CurrentUser, &image_key)
            .unwrap()
            .set_dword("MitigationOptions", 1)
            .unwrap();

        store.set_priority_override("game.exe").unwrap();
        store.remove_priority_override("game.exe").unwrap();

        let key = RegKey::open(Hive::CurrentUser, &image_key, KEY_QUERY_VALUE).unwrap();
        assert!(!key.is_empty().unwrap());
        drop(key);
        assert!(
            RegKey::open(Hive::CurrentUser, &format!(r"{image_key}\PerfOptions"), KEY_READ).is_err()
        );
        cleanup(&base);
    }

    #[test]
    fn test_priority_override_removal_deletes_empty_image_key() {
        let (store, base) = scratch_store("empty");
        store.set_priority_override("game.exe").unwrap();
        store.remove_priority_override("game.exe").unwrap();
        assert!(RegKey::open(Hive::CurrentUser, &store.ifeo_path("game.exe"), KEY_READ).is_err());
        // removing again is a no-op
        store.remove_priority_override("game.exe").unwrap();
        cleanup(&base);
    }
}
