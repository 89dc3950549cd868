//! Thread-local last-error slot for FFI-safe reporting, plus the
//! `RuntimeError` taxonomy raised by the interpreter surface.
//!
//! FFI functions (finalizers, closure trampolines) can report a failure
//! without panicking across the FFI boundary by calling `set_runtime_error`
//! instead of unwinding; callers on the VM side check `has_runtime_error`
//! and decide whether to surface it as a `RuntimeError::Panic` or a thrown
//! Value.

use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::ptr;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };

    /// Cached C string for FFI access; avoids allocating on every get.
    static ERROR_CSTRING: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last runtime error message for the calling thread.
///
/// Clears any cached `CString` first, since it would otherwise dangle
/// once a new message replaces the one it was built from.
pub fn set_runtime_error(msg: impl Into<String>) {
    ERROR_CSTRING.with(|cs| *cs.borrow_mut() = None);
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

/// Take (and clear) the last runtime error message.
pub fn take_runtime_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

/// Is there a pending runtime error on the calling thread?
pub fn has_runtime_error() -> bool {
    LAST_ERROR.with(|e| e.borrow().is_some())
}

/// Clear any pending runtime error.
pub fn clear_runtime_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
    ERROR_CSTRING.with(|e| *e.borrow_mut() = None);
}

/// Format a `catch_unwind` payload into a human-readable message.
pub fn format_panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Get the last error as a C string pointer, without clearing it.
///
/// The returned pointer is valid only until the next call to
/// `set_runtime_error`, `ffi_get_error`, `ffi_take_error`, or
/// `clear_runtime_error` on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn loom_ffi_get_error() -> *const i8 {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(msg) => cache_error_cstring(msg),
        None => ptr::null(),
    })
}

/// Take (and clear) the last error, returning it as a C string.
#[unsafe(no_mangle)]
pub extern "C" fn loom_ffi_take_error() -> *const i8 {
    match take_runtime_error() {
        Some(msg) => cache_error_cstring(&msg),
        None => ptr::null(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn loom_ffi_has_error() -> bool {
    has_runtime_error()
}

#[unsafe(no_mangle)]
pub extern "C" fn loom_ffi_clear_error() {
    clear_runtime_error();
}

fn cache_error_cstring(msg: &str) -> *const i8 {
    let safe_msg: String = msg.chars().map(|c| if c == '\0' { '?' } else { c }).collect();
    ERROR_CSTRING.with(|cs| {
        let cstring = CString::new(safe_msg).expect("null bytes already replaced");
        let ptr = cstring.as_ptr();
        *cs.borrow_mut() = Some(cstring);
        ptr
    })
}

/// The error taxonomy raised by the interpreter surface (§7).
///
/// `Panic` is an unrecoverable VM invariant violation; the rest are typed
/// tags a program can catch with a matching `try`/`catch` handler.
#[derive(Debug)]
pub enum RuntimeError {
    /// Pattern-match exhaustion: no arm matched the scrutinee.
    MatchError { message: String },
    /// Out-of-bounds array/tuple/string access.
    IndexError { index: i64, len: usize },
    /// No operator or method implementation found for the receiver's class.
    DispatchError { op_or_method: String, class: String },
    /// Unrecoverable VM invariant violation; terminates the current thread.
    Panic { component: String, message: String },
    /// A Value raised through `throw` that escaped every try frame.
    UserThrow { message: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::MatchError { message } => write!(f, "match error: {message}"),
            RuntimeError::IndexError { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
            RuntimeError::DispatchError { op_or_method, class } => {
                write!(f, "no implementation of `{op_or_method}` for class `{class}`")
            }
            RuntimeError::Panic { component, message } => write!(f, "{component}: {message}"),
            RuntimeError::UserThrow { message } => write!(f, "uncaught throw: {message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_take_round_trip() {
        clear_runtime_error();
        assert!(!has_runtime_error());
        set_runtime_error("boom");
        assert!(has_runtime_error());
        assert_eq!(take_runtime_error(), Some("boom".to_string()));
        assert!(!has_runtime_error());
    }

    #[test]
    fn clear_drops_pending_error() {
        set_runtime_error("another error");
        clear_runtime_error();
        assert!(!has_runtime_error());
        assert!(take_runtime_error().is_none());
    }

    #[test]
    fn panic_payload_formats_str_and_string() {
        let p: Box<dyn std::any::Any + Send> = Box::new("oops");
        assert_eq!(format_panic_payload(&*p), "oops");
        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("owned oops"));
        assert_eq!(format_panic_payload(&*p), "owned oops");
    }

    #[test]
    fn runtime_error_display_messages() {
        let e = RuntimeError::IndexError { index: -1, len: 3 };
        assert_eq!(e.to_string(), "index -1 out of bounds for length 3");
        let e = RuntimeError::DispatchError {
            op_or_method: "+".into(),
            class: "Widget".into(),
        };
        assert_eq!(e.to_string(), "no implementation of `+` for class `Widget`");
    }
}
