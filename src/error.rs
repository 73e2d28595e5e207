use std::borrow::Cow;
use std::error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;
use std::result;

/// A result type using our [`Error`] by default.
pub type Result<T, E = Error> = result::Result<T, E>;


/// An enum providing a rough classification of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An entity was not found.
    NotFound,
    /// The operation lacked the necessary privileges to complete.
    PermissionDenied,
    /// Data not valid for the operation were encountered.
    InvalidData,
    /// A parameter was incorrect.
    InvalidInput,
    /// This operation is unsupported on this platform.
    Unsupported,
    /// A custom error that does not fall under any other I/O error
    /// kind.
    Other,
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => ErrorKind::InvalidData,
            io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
            io::ErrorKind::Unsupported => ErrorKind::Unsupported,
            _ => ErrorKind::Other,
        }
    }
}


enum Repr {
    Io(io::Error),
    Adhoc(ErrorKind, Cow<'static, str>),
    Context(Cow<'static, str>, Box<Repr>),
}

impl Repr {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(err) => ErrorKind::from(err.kind()),
            Self::Adhoc(kind, ..) => *kind,
            Self::Context(_ctx, source) => source.kind(),
        }
    }
}

impl Display for Repr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Io(err) => Display::fmt(err, f),
            Self::Adhoc(_kind, msg) => f.write_str(msg),
            Self::Context(ctx, source) => write!(f, "{ctx}: {source}"),
        }
    }
}

impl Debug for Repr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(self, f)
    }
}


/// The error type used by the entire crate.
///
/// Lookup *misses* are not represented as errors: a symbol that cannot
/// be found for an address is an expected outcome when tracing
/// arbitrary code and surfaces as `None` instead. `Error` captures the
/// exceptional cases only, such as I/O failures or malformed input
/// data.
pub struct Error {
    repr: Box<Repr>,
}

impl Error {
    fn adhoc<M>(kind: ErrorKind, msg: M) -> Self
    where
        M: ToString,
    {
        Self {
            repr: Box::new(Repr::Adhoc(kind, Cow::Owned(msg.to_string()))),
        }
    }

    /// Create an [`ErrorKind::InvalidData`] error.
    pub fn with_invalid_data<M>(msg: M) -> Self
    where
        M: ToString,
    {
        Self::adhoc(ErrorKind::InvalidData, msg)
    }

    /// Create an [`ErrorKind::InvalidInput`] error.
    pub fn with_invalid_input<M>(msg: M) -> Self
    where
        M: ToString,
    {
        Self::adhoc(ErrorKind::InvalidInput, msg)
    }

    /// Create an [`ErrorKind::NotFound`] error.
    pub fn with_not_found<M>(msg: M) -> Self
    where
        M: ToString,
    {
        Self::adhoc(ErrorKind::NotFound, msg)
    }

    /// Create an [`ErrorKind::Unsupported`] error.
    pub fn with_unsupported<M>(msg: M) -> Self
    where
        M: ToString,
    {
        Self::adhoc(ErrorKind::Unsupported, msg)
    }

    /// Retrieve a rough classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.repr.kind()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self {
            repr: Box::new(Repr::Io(err)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.repr, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Error({})", self.repr)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &*self.repr {
            Repr::Io(err) => err.source(),
            _ => None,
        }
    }
}


/// A trait providing ergonomic chaining capabilities to [`Error`].
pub trait ErrorExt: Sized {
    /// The output type produced by [`context`](Self::context) and
    /// [`with_context`](Self::with_context).
    type Output;

    /// Add context to this error.
    fn context<C>(self, context: C) -> Self::Output
    where
        C: ToString;

    /// Add context to this error, provided lazily.
    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: ToString,
        F: FnOnce() -> C;
}

impl ErrorExt for Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: ToString,
    {
        Self {
            repr: Box::new(Repr::Context(
                Cow::Owned(context.to_string()),
                self.repr,
            )),
        }
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.context(f())
    }
}

impl ErrorExt for io::Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: ToString,
    {
        Error::from(self).context(context)
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.context(f())
    }
}

impl<T, E> ErrorExt for Result<T, E>
where
    E: ErrorExt,
{
    type Output = Result<T, E::Output>;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: ToString,
    {
        self.map_err(|err| err.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.with_context(f))
    }
}


/// A trait for conversion of `Option` into our `Result`.
pub trait IntoError<T>: Sized {
    #[doc(hidden)]
    fn ok_or_error<C, F>(self, kind: ErrorKind, f: F) -> Result<T, Error>
    where
        C: ToString,
        F: FnOnce() -> C;

    /// Convert a `None` into an [`ErrorKind::InvalidData`] error.
    #[inline]
    fn ok_or_invalid_data<C, F>(self, f: F) -> Result<T, Error>
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.ok_or_error(ErrorKind::InvalidData, f)
    }

    /// Convert a `None` into an [`ErrorKind::InvalidInput`] error.
    #[inline]
    fn ok_or_invalid_input<C, F>(self, f: F) -> Result<T, Error>
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.ok_or_error(ErrorKind::InvalidInput, f)
    }

    /// Convert a `None` into an [`ErrorKind::NotFound`] error.
    #[inline]
    fn ok_or_not_found<C, F>(self, f: F) -> Result<T, Error>
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.ok_or_error(ErrorKind::NotFound, f)
    }
}

impl<T> IntoError<T> for Option<T> {
    #[inline]
    fn ok_or_error<C, F>(self, kind: ErrorKind, f: F) -> Result<T, Error>
    where
        C: ToString,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::adhoc(kind, f()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    /// Check that error classification behaves as expected.
    #[test]
    fn error_kinds() {
        let err = Error::with_invalid_data("some data is bad");
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = err.context("while doing something");
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "no such thing"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Make sure that context is reflected in the `Display`
    /// representation.
    #[test]
    fn error_context_display() {
        let err = Error::with_not_found("no symbol");
        let err = err.context("resolving address 0x1337");
        assert_eq!(err.to_string(), "resolving address 0x1337: no symbol");
    }

    /// Exercise `Option` conversions.
    #[test]
    fn option_conversion() {
        let option = Some(42u64);
        assert_eq!(option.ok_or_invalid_data(|| "").unwrap(), 42);

        let option = Option::<u64>::None;
        let err = option.ok_or_not_found(|| "it's gone").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "it's gone");
    }

    /// Make sure that we can chain context on `Result` values.
    #[test]
    fn result_context() {
        fn inner() -> Result<()> {
            Err(Error::with_invalid_input("bad argument"))
        }

        let err = inner().context("outer operation").unwrap_err();
        assert_eq!(err.to_string(), "outer operation: bad argument");
    }
}
