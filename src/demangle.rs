//! Demangling of C++ and Rust symbol names.

/// Demangle the given symbol name, if it is mangled at all.
///
/// Returns `None` for names that are not mangled (or mangled in a
/// scheme we do not understand); such names are best displayed as-is.
#[cfg(feature = "demangle")]
pub(crate) fn maybe_demangle(name: &str) -> Option<String> {
    if name.starts_with("_Z") {
        if let Ok(sym) = cpp_demangle::Symbol::new(name) {
            return Some(sym.to_string())
        }
    }

    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return Some(format!("{demangled:#}"))
    }
    None
}

#[cfg(not(feature = "demangle"))]
pub(crate) fn maybe_demangle(_name: &str) -> Option<String> {
    None
}


#[cfg(all(test, feature = "demangle"))]
mod tests {
    use super::*;


    /// Check that C++ and Rust mangled names are demangled while plain
    /// names pass through untouched.
    #[test]
    fn name_demangling() {
        assert_eq!(maybe_demangle("_Z3foov").as_deref(), Some("foo()"));
        assert_eq!(
            maybe_demangle("_RNvNtCs1234_7mycrate3foo3bar").as_deref(),
            Some("mycrate::foo::bar")
        );
        assert_eq!(maybe_demangle("malloc"), None);
        assert_eq!(maybe_demangle("tcp_sendmsg"), None);
    }
}
