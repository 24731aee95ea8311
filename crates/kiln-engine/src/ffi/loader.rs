//! Dynamic library loading for extern symbol resolution.
//!
//! Thin wrapper over the platform loader. On unix this is
//! `dlopen`/`dlsym` with `RTLD_NOW | RTLD_GLOBAL`; the process's own image
//! (and everything it already links, such as libc) is reachable through
//! [`Library::this_process`].

use std::ffi::c_void;

use crate::error::{Error, Result};

pub struct Library {
    handle: *mut c_void,
    owned: bool,
}

#[cfg(unix)]
impl Library {
    /// Load a shared library by path or soname.
    pub fn open(name: &str) -> Result<Library> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| Error::Link(format!("invalid library name `{}`", name)))?;
        let handle = unsafe { libc::dlopen(c_name.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(Error::Link(format!(
                "failed to load library `{}`: {}",
                name,
                last_dl_error()
            )));
        }
        Ok(Library {
            handle,
            owned: true,
        })
    }

    /// Handle for symbols already visible in the process image.
    pub fn this_process() -> Library {
        Library {
            handle: unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW) },
            owned: false,
        }
    }

    /// Look up a symbol address.
    pub fn symbol(&self, name: &str) -> Result<*mut c_void> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| Error::Link(format!("invalid symbol name `{}`", name)))?;
        unsafe {
            libc::dlerror();
            let addr = libc::dlsym(self.handle, c_name.as_ptr());
            let err = libc::dlerror();
            if !err.is_null() {
                return Err(Error::Link(format!(
                    "symbol `{}` not found: {}",
                    name,
                    std::ffi::CStr::from_ptr(err).to_string_lossy()
                )));
            }
            Ok(addr)
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

#[cfg(unix)]
impl Drop for Library {
    fn drop(&mut self) {
        if self.owned && !self.handle.is_null() {
            unsafe { libc::dlclose(self.handle) };
        }
    }
}

#[cfg(not(unix))]
impl Library {
    pub fn open(name: &str) -> Result<Library> {
        let _ = name;
        Err(Error::Unsupported(
            "dynamic library loading is only implemented for unix".into(),
        ))
    }

    pub fn this_process() -> Library {
        Library {
            handle: std::ptr::null_mut(),
            owned: false,
        }
    }

    pub fn symbol(&self, name: &str) -> Result<*mut c_void> {
        Err(Error::Unsupported(format!(
            "cannot resolve `{}`: dynamic loading is only implemented for unix",
            name
        )))
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library() {
        assert!(Library::open("/nonexistent/libkiln-missing.so").is_err());
    }

    #[test]
    fn test_process_symbols_reach_libc() {
        let this = Library::this_process();
        let addr = this.symbol("strlen").unwrap();
        assert!(!addr.is_null());
    }

    #[test]
    fn test_unknown_symbol() {
        let this = Library::this_process();
        assert!(this.symbol("kiln_definitely_not_a_symbol").is_err());
    }
}
