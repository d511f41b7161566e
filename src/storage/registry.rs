//! Hierarchical key-value stores holding registry-resident key containers.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{EnrollKitError, Result};

/// Read access to a registry-like hive. Paths use `\` separators and are
/// relative to the hive root (`HKEY_LOCAL_MACHINE` on Windows).
pub trait RegistryHive: Send + Sync {
    fn key_exists(&self, path: &str) -> bool;

    /// Names of all values directly under `path`.
    fn value_names(&self, path: &str) -> Result<Vec<String>>;

    fn read_binary(&self, path: &str, value: &str) -> Result<Vec<u8>>;
}

/// Registry paths compare case-insensitively.
fn normalize(path: &str) -> String {
    path.trim_matches('\\').to_ascii_lowercase()
}

type Keys = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// In-process hive, used where no native registry exists and by the software
/// provider for its registry-resident containers.
#[derive(Debug, Default)]
pub struct MemoryHive {
    keys: Mutex<Keys>,
}

impl MemoryHive {
    fn keys(&self) -> Result<MutexGuard<'_, Keys>> {
        self.keys
            .lock()
            .map_err(|_| EnrollKitError::provider("registry hive lock poisoned"))
    }

    /// Creates the key if needed and sets a binary value.
    pub fn write_binary(&self, path: &str, value: &str, data: &[u8]) -> Result<()> {
        self.keys()?
            .entry(normalize(path))
            .or_default()
            .insert(value.to_string(), data.to_vec());
        Ok(())
    }

    pub fn delete_key(&self, path: &str) -> Result<()> {
        self.keys()?.remove(&normalize(path));
        Ok(())
    }
}

impl RegistryHive for MemoryHive {
    fn key_exists(&self, path: &str) -> bool {
        self.keys()
            .map(|keys| keys.contains_key(&normalize(path)))
            .unwrap_or(false)
    }

    fn value_names(&self, path: &str) -> Result<Vec<String>> {
        self.keys()?
            .get(&normalize(path))
            .map(|values| values.keys().cloned().collect())
            .ok_or_else(|| EnrollKitError::ContainerNotFound(path.to_string()))
    }

    fn read_binary(&self, path: &str, value: &str) -> Result<Vec<u8>> {
        self.keys()?
            .get(&normalize(path))
            .and_then(|values| values.get(value).cloned())
            .ok_or_else(|| EnrollKitError::ContainerNotFound(format!("{path}\\{value}")))
    }
}

#[cfg(windows)]
pub use self::windows_hive::WindowsHive;

#[cfg(windows)]
mod windows_hive {
    use windows::Win32::Foundation::{ERROR_MORE_DATA, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        HKEY, HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, RegCloseKey, RegEnumValueW, RegOpenKeyExW,
        RegQueryValueExW,
    };
    use windows::core::{HSTRING, PWSTR};

    use super::RegistryHive;
    use crate::error::{EnrollKitError, Result};

    /// `HKEY_LOCAL_MACHINE`, read only.
    #[derive(Debug, Default)]
    pub struct WindowsHive;

    struct OpenKey(HKEY);

    impl Drop for OpenKey {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.0);
            }
        }
    }

    fn open(path: &str) -> Result<OpenKey> {
        let mut key = HKEY::default();
        let status = unsafe {
            RegOpenKeyExW(
                HKEY_LOCAL_MACHINE,
                &HSTRING::from(path),
                0,
                KEY_QUERY_VALUE,
                &mut key,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(EnrollKitError::ContainerNotFound(format!(
                "{path}: registry error {}",
                status.0
            )));
        }
        Ok(OpenKey(key))
    }

    impl RegistryHive for WindowsHive {
        fn key_exists(&self, path: &str) -> bool {
            open(path).is_ok()
        }

        fn value_names(&self, path: &str) -> Result<Vec<String>> {
            let key = open(path)?;
            let mut names = Vec::new();
            let mut buffer = vec![0u16; 16384];
            for index in 0.. {
                let mut len = buffer.len() as u32;
                let status = unsafe {
                    RegEnumValueW(
                        key.0,
                        index,
                        PWSTR(buffer.as_mut_ptr()),
                        &mut len,
                        None,
                        None,
                        None,
                        None,
                    )
                };
                if status == ERROR_NO_MORE_ITEMS {
                    break;
                }
                if status != ERROR_SUCCESS {
                    return Err(EnrollKitError::provider(format!(
                        "enumerating {path}: registry error {}",
                        status.0
                    )));
                }
                names.push(String::from_utf16_lossy(&buffer[..len as usize]));
            }
            Ok(names)
        }

        fn read_binary(&self, path: &str, value: &str) -> Result<Vec<u8>> {
            let key = open(path)?;
            let name = HSTRING::from(value);
            let mut size = 0u32;
            let status =
                unsafe { RegQueryValueExW(key.0, &name, None, None, None, Some(&mut size)) };
            if status != ERROR_SUCCESS && status != ERROR_MORE_DATA {
                return Err(EnrollKitError::provider(format!(
                    "reading {path}\\{value}: registry error {}",
                    status.0
                )));
            }
            let mut data = vec![0u8; size as usize];
            let status = unsafe {
                RegQueryValueExW(
                    key.0,
                    &name,
                    None,
                    None,
                    Some(data.as_mut_ptr()),
                    Some(&mut size),
                )
            };
            if status != ERROR_SUCCESS {
                return Err(EnrollKitError::provider(format!(
                    "reading {path}\\{value}: registry error {}",
                    status.0
                )));
            }
            data.truncate(size as usize);
            Ok(data)
        }
    }
}
