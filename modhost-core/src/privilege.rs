//! Elevation probing and token privilege adjustment.

use crate::error::PrivilegeError;
use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, LUID, WIN32_ERROR};
use windows::Win32::Security::{
    AdjustTokenPrivileges, CheckTokenMembership, CreateWellKnownSid, LookupPrivilegeValueW,
    WinBuiltinAdministratorsSid, LUID_AND_ATTRIBUTES, PSID, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

/// `AdjustTokenPrivileges` reports this via `GetLastError` when the token
/// does not hold the requested privilege at all.
const ERROR_NOT_ALL_ASSIGNED: WIN32_ERROR = WIN32_ERROR(1300);

/// Privilege operations for the current process.
///
/// The registry calls [`PrivilegeManager::is_elevated`] exactly once at
/// startup to pick its watch strategy; elevated hosts also enable
/// SeDebugPrivilege so processes of other users can be opened and probed.
pub struct PrivilegeManager;

impl PrivilegeManager {
    /// Whether the current token belongs to the Administrators group.
    pub fn is_elevated() -> Result<bool, PrivilegeError> {
        unsafe {
            // First call sizes the SID buffer, second call fills it
            let mut sid_size = 0u32;
            let _ = CreateWellKnownSid(
                WinBuiltinAdministratorsSid,
                None,
                PSID(std::ptr::null_mut()),
                &mut sid_size,
            );

            let mut sid = vec![0u8; sid_size as usize];
            CreateWellKnownSid(
                WinBuiltinAdministratorsSid,
                None,
                PSID(sid.as_mut_ptr() as *mut _),
                &mut sid_size,
            )
            .map_err(|_| PrivilegeError::SidCreationFailed(std::io::Error::last_os_error()))?;

            let mut is_member = Default::default();
            CheckTokenMembership(None, PSID(sid.as_ptr() as *mut _), &mut is_member)
                .map_err(|_| {
                    PrivilegeError::MembershipCheckFailed(std::io::Error::last_os_error())
                })?;

            log::debug!("Elevation probe: {}", is_member.as_bool());
            Ok(is_member.as_bool())
        }
    }

    /// Enables SeDebugPrivilege on the current token.
    ///
    /// Needed to open handles to processes of other users; only available to
    /// elevated hosts, so non-elevated callers get
    /// [`PrivilegeError::NotAdministrator`] without touching the token.
    pub fn enable_debug_privilege() -> Result<(), PrivilegeError> {
        if !Self::is_elevated()? {
            return Err(PrivilegeError::NotAdministrator);
        }

        unsafe {
            let mut token = HANDLE::default();
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            )
            .map_err(|_| PrivilegeError::OpenTokenFailed(std::io::Error::last_os_error()))?;
            let _token = TokenGuard(token);

            let mut luid = LUID::default();
            LookupPrivilegeValueW(None, windows::core::w!("SeDebugPrivilege"), &mut luid)
                .map_err(|_| {
                    PrivilegeError::LookupPrivilegeFailed(std::io::Error::last_os_error())
                })?;

            let mut privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [LUID_AND_ATTRIBUTES {
                    Luid: luid,
                    Attributes: SE_PRIVILEGE_ENABLED,
                }],
            };

            AdjustTokenPrivileges(token, false, Some(&mut privileges), 0, None, None).map_err(
                |_| PrivilegeError::AdjustPrivilegeFailed(std::io::Error::last_os_error()),
            )?;

            // AdjustTokenPrivileges succeeds even when nothing was assigned
            let last_error = GetLastError();
            if last_error == ERROR_NOT_ALL_ASSIGNED {
                log::error!("SeDebugPrivilege not held by this token");
                return Err(PrivilegeError::NotAdministrator);
            }
            if last_error.0 != 0 {
                return Err(PrivilegeError::AdjustPrivilegeFailed(
                    std::io::Error::from_raw_os_error(last_error.0 as i32),
                ));
            }

            log::info!("SeDebugPrivilege enabled");
            Ok(())
        }
    }
}

/// Closes the process token handle on drop.
struct TokenGuard(HANDLE);

impl Drop for TokenGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_elevated_returns_answer() {
        // Either answer is fine depending on the test environment; the probe
        // itself must not fail
        assert!(PrivilegeManager::is_elevated().is_ok());
    }
}
