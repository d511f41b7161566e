//! Host facts the materializer depends on: current user, elevation and the
//! default key-storage locations.

use std::path::PathBuf;
use std::sync::Arc;

use super::registry::RegistryHive;
use crate::error::Result;
#[cfg(windows)]
use crate::error::EnrollKitError;

/// `SOFTWARE\WOW6432Node` on 64-bit hosts, `SOFTWARE` otherwise.
pub fn registry_prefix() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        r"SOFTWARE\WOW6432Node"
    } else {
        "SOFTWARE"
    }
}

#[cfg(unix)]
pub fn current_user_name() -> Result<String> {
    let uid = unsafe { libc::geteuid() };
    let entry = unsafe { libc::getpwuid(uid) };
    if entry.is_null() {
        // No passwd entry, as in some containers.
        return Ok(std::env::var("USER").unwrap_or_else(|_| uid.to_string()));
    }
    let name = unsafe { std::ffi::CStr::from_ptr((*entry).pw_name) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(unix)]
pub fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Unix has no security identifiers; the user name stands in for one.
#[cfg(unix)]
pub fn current_user_sid() -> Result<String> {
    current_user_name()
}

#[cfg(unix)]
pub fn default_key_root() -> Result<PathBuf> {
    Ok(PathBuf::from("/var/opt/cprocsp/keys").join(current_user_name()?))
}

#[cfg(unix)]
pub fn native_hive() -> Arc<dyn RegistryHive> {
    Arc::new(super::registry::MemoryHive::default())
}

#[cfg(windows)]
pub fn current_user_name() -> Result<String> {
    std::env::var("USERNAME")
        .map_err(|_| EnrollKitError::provider("cannot resolve the current user"))
}

#[cfg(windows)]
pub fn is_elevated() -> bool {
    use std::mem::MaybeUninit;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{
        GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = HANDLE::default();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).is_err() {
            return false;
        }

        let mut elevation = MaybeUninit::<TOKEN_ELEVATION>::uninit();
        let mut size = 0u32;
        let result = GetTokenInformation(
            token,
            TokenElevation,
            Some(elevation.as_mut_ptr() as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );
        let _ = CloseHandle(token);

        result.is_ok() && elevation.assume_init().TokenIsElevated != 0
    }
}

#[cfg(windows)]
pub fn current_user_sid() -> Result<String> {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::Authorization::ConvertSidToStringSidW;
    use windows::Win32::Security::{GetTokenInformation, TOKEN_QUERY, TOKEN_USER, TokenUser};
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
    use windows::core::PWSTR;

    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .map_err(|e| EnrollKitError::provider(format!("OpenProcessToken: {e}")))?;

        let mut size = 0u32;
        let _ = GetTokenInformation(token, TokenUser, None, 0, &mut size);
        let mut buffer = vec![0u8; size as usize];
        let result = GetTokenInformation(
            token,
            TokenUser,
            Some(buffer.as_mut_ptr() as *mut _),
            size,
            &mut size,
        );
        let _ = CloseHandle(token);
        result.map_err(|e| EnrollKitError::provider(format!("GetTokenInformation: {e}")))?;

        let user = &*(buffer.as_ptr() as *const TOKEN_USER);
        let mut sid = PWSTR::null();
        ConvertSidToStringSidW(user.User.Sid, &mut sid)
            .map_err(|e| EnrollKitError::provider(format!("ConvertSidToStringSidW: {e}")))?;
        // The LocalAlloc'd string is not released; this runs once per container.
        sid.to_string()
            .map_err(|e| EnrollKitError::provider(format!("invalid SID string: {e}")))
    }
}

#[cfg(windows)]
pub fn default_key_root() -> Result<PathBuf> {
    Ok(PathBuf::from(r"C:\Users")
        .join(current_user_name()?)
        .join(r"AppData\Local\Crypto Pro"))
}

#[cfg(windows)]
pub fn native_hive() -> Arc<dyn RegistryHive> {
    Arc::new(super::registry::WindowsHive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_tracks_pointer_width() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(registry_prefix(), r"SOFTWARE\WOW6432Node");
        #[cfg(not(target_pointer_width = "64"))]
        assert_eq!(registry_prefix(), "SOFTWARE");
    }

    #[cfg(unix)]
    #[test]
    fn unix_key_root_is_per_user() {
        let root = default_key_root().unwrap();
        assert!(root.starts_with("/var/opt/cprocsp/keys"));
        assert_eq!(
            root.file_name().and_then(|n| n.to_str()),
            Some(current_user_name().unwrap().as_str())
        );
    }
}
