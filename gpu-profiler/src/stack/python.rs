//! Python stack capture
//!
//! The interpreter is never linked against: the C API symbols are looked up in
//! the running process. Calling into CPython without the GIL is undefined
//! behavior, so `PyGILState_Check` decides whether to capture; the GIL is never
//! taken.

use super::{LOCK_NOT_HELD, NOT_INITIALIZED, STACK_UNAVAILABLE};
use cuprof_shared::protocol::line::flatten;
use once_cell::sync::OnceCell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

type PyObject = c_void;

type FnIsInitialized = unsafe extern "C" fn() -> c_int;
type FnGilStateCheck = unsafe extern "C" fn() -> c_int;
type FnImportModule = unsafe extern "C" fn(name: *const c_char) -> *mut PyObject;
type FnGetAttrString = unsafe extern "C" fn(o: *mut PyObject, name: *const c_char) -> *mut PyObject;
type FnCallObject = unsafe extern "C" fn(callable: *mut PyObject, args: *mut PyObject) -> *mut PyObject;
type FnUnicodeFromString = unsafe extern "C" fn(s: *const c_char) -> *mut PyObject;
type FnUnicodeJoin = unsafe extern "C" fn(sep: *mut PyObject, seq: *mut PyObject) -> *mut PyObject;
type FnUnicodeAsUtf8 = unsafe extern "C" fn(o: *mut PyObject) -> *const c_char;
type FnDecRef = unsafe extern "C" fn(o: *mut PyObject);
type FnErrClear = unsafe extern "C" fn();

/// CPython C API entry points found in this process
struct PythonApi {
    is_initialized: FnIsInitialized,
    gil_state_check: FnGilStateCheck,
    import_module: FnImportModule,
    get_attr_string: FnGetAttrString,
    call_object: FnCallObject,
    unicode_from_string: FnUnicodeFromString,
    unicode_join: FnUnicodeJoin,
    unicode_as_utf8: FnUnicodeAsUtf8,
    dec_ref: FnDecRef,
    err_clear: FnErrClear,
}

impl PythonApi {
    #[cfg(unix)]
    fn resolve() -> Result<Self, libloading::Error> {
        use libloading::os::unix::Library;

        // The symbols live either in the python executable or in a libpython
        // loaded with RTLD_GLOBAL; both are visible through the global scope.
        let this = Library::this();
        unsafe {
            Ok(Self {
                is_initialized: *this.get::<FnIsInitialized>(b"Py_IsInitialized\0")?,
                gil_state_check: *this.get::<FnGilStateCheck>(b"PyGILState_Check\0")?,
                import_module: *this.get::<FnImportModule>(b"PyImport_ImportModule\0")?,
                get_attr_string: *this.get::<FnGetAttrString>(b"PyObject_GetAttrString\0")?,
                call_object: *this.get::<FnCallObject>(b"PyObject_CallObject\0")?,
                unicode_from_string: *this.get::<FnUnicodeFromString>(b"PyUnicode_FromString\0")?,
                unicode_join: *this.get::<FnUnicodeJoin>(b"PyUnicode_Join\0")?,
                unicode_as_utf8: *this.get::<FnUnicodeAsUtf8>(b"PyUnicode_AsUTF8\0")?,
                dec_ref: *this.get::<FnDecRef>(b"Py_DecRef\0")?,
                err_clear: *this.get::<FnErrClear>(b"PyErr_Clear\0")?,
            })
        }
    }

    #[cfg(not(unix))]
    fn resolve() -> Result<Self, libloading::Error> {
        Err(libloading::Error::DlSymUnknown)
    }

    /// Wrap a new reference; null means the call failed.
    fn own(&self, ptr: *mut PyObject) -> Option<PyRef<'_>> {
        if ptr.is_null() {
            None
        } else {
            Some(PyRef { api: self, ptr })
        }
    }

    /// `"".join(traceback.format_stack())`.
    ///
    /// # Safety
    /// The interpreter must be initialized and the calling thread must hold the GIL.
    unsafe fn format_stack(&self) -> Option<String> {
        let module = self.own((self.import_module)(b"traceback\0".as_ptr() as *const c_char))?;
        let format_stack =
            self.own((self.get_attr_string)(module.ptr, b"format_stack\0".as_ptr() as *const c_char))?;
        let frames = self.own((self.call_object)(format_stack.ptr, std::ptr::null_mut()))?;
        let empty = self.own((self.unicode_from_string)(b"\0".as_ptr() as *const c_char))?;
        let joined = self.own((self.unicode_join)(empty.ptr, frames.ptr))?;

        let utf8 = (self.unicode_as_utf8)(joined.ptr);
        if utf8.is_null() {
            return None;
        }
        // Copy out before `joined` releases the buffer.
        Some(CStr::from_ptr(utf8).to_string_lossy().into_owned())
    }
}

/// Owned Python reference, released on drop
struct PyRef<'a> {
    api: &'a PythonApi,
    ptr: *mut PyObject,
}

impl Drop for PyRef<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.dec_ref)(self.ptr) }
    }
}

/// Python stack capturer for the current process.
pub struct PythonStack {
    /// `None` once a lookup has failed
    api: OnceCell<Option<PythonApi>>,
}

impl PythonStack {
    pub fn new() -> Self {
        Self {
            api: OnceCell::new(),
        }
    }

    /// Resolved API. Looked up on first use only: a process without the
    /// interpreter at that point never gets Python stacks.
    fn api(&self) -> Option<&PythonApi> {
        self.api_with(PythonApi::resolve)
    }

    fn api_with<E: fmt::Display>(
        &self,
        resolve: impl FnOnce() -> Result<PythonApi, E>,
    ) -> Option<&PythonApi> {
        self.api
            .get_or_init(|| match resolve() {
                Ok(api) => Some(api),
                Err(e) => {
                    debug!("Python C API not found: {}", e);
                    None
                }
            })
            .as_ref()
    }

    /// Whether an initialized interpreter is present in this process
    pub fn is_available(&self) -> bool {
        self.api()
            .is_some_and(|api| unsafe { (api.is_initialized)() } != 0)
    }

    /// Current Python stack on one line, or a sentinel.
    pub fn capture(&self) -> String {
        let Some(api) = self.api() else {
            return NOT_INITIALIZED.to_string();
        };
        if unsafe { (api.is_initialized)() } == 0 {
            return NOT_INITIALIZED.to_string();
        }
        if unsafe { (api.gil_state_check)() } == 0 {
            return LOCK_NOT_HELD.to_string();
        }

        // From here on the GIL is held by this thread.
        let captured = catch_unwind(AssertUnwindSafe(|| unsafe { api.format_stack() }));
        match captured {
            Ok(Some(stack)) => flatten(&stack),
            _ => {
                unsafe { (api.err_clear)() };
                STACK_UNAVAILABLE.to_string()
            }
        }
    }
}

impl Default for PythonStack {
    fn default() -> Self {
        Self::new()
    }
}
