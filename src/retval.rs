//! Return-value type hints and rendering
//!
//! The instrumentation layer knows (from the call's prototype) how a return
//! value should be read. The cache keeps that hint alongside each record and
//! renders the value only when the record is flushed.

use crate::memory::MemoryReader;
use serde::{Deserialize, Serialize};

/// Printed for records flushed before their return value arrived
pub const UNKNOWN_VALUE: &str = "?";

/// Printed for calls that never return to the caller
pub const NEVER_RETURNS: &str = "??";

/// Printed when a string pointer cannot be dereferenced
pub const INVALID_MEMORY: &str = "<invalid memory>";

/// How a pointer-sized return value should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnHint {
    /// Raw pointer-sized value, printed in hex
    #[default]
    Pointer,
    /// `int`
    SignedInt,
    /// `unsigned int`
    UnsignedInt,
    /// `size_t`
    Size,
    /// `const char *`
    CString,
    /// `const wchar_t *` (UTF-16)
    WideString,
}

impl ReturnHint {
    /// Render `value` according to this hint.
    ///
    /// String pointers are read through `memory`; without a reader only the
    /// address is printed.
    pub fn render(self, value: usize, memory: Option<&dyn MemoryReader>) -> String {
        match self {
            // Integer returns live in the low half of the return register
            ReturnHint::SignedInt => format!("{}", value as u32 as i32),
            ReturnHint::UnsignedInt => format!("{}", value as u32),
            ReturnHint::Size => format!("{}", value),
            ReturnHint::CString | ReturnHint::WideString => {
                render_string(self, value, memory)
            }
            ReturnHint::Pointer => format!("{:#x}", value),
        }
    }
}

fn render_string(hint: ReturnHint, value: usize, memory: Option<&dyn MemoryReader>) -> String {
    if value == 0 {
        return "<NULL>".to_string();
    }

    let Some(memory) = memory else {
        return format!("{:#x}", value);
    };

    let text = if hint == ReturnHint::WideString {
        memory.read_wide_string(value)
    } else {
        memory.read_c_string(value)
    };

    match text {
        Some(s) => format!("{:#x}:\"{}\"", value, s),
        None => INVALID_MEMORY.to_string(),
    }
}
