//! Per-entity non-fatal diagnostics.
//!
//! Directory loaders never abort on a recoverable problem; they attach an
//! error code to the smallest entity the problem describes (one imported
//! function, one relocation entry, or the directory itself) and keep going.
//! Codes are subsystem-scoped enums; equivalent `(code, context)` pairs are
//! stored once.

use core::fmt;

/// A subsystem-scoped diagnostic code.
///
/// Codes are compared by identity (enum variant within its subsystem), never
/// by message text.
pub trait ErrorCode: Copy + Eq + fmt::Debug + 'static {
    /// Stable name of the emitting subsystem.
    fn subsystem(&self) -> &'static str;
    /// Human-readable description of the code.
    fn message(&self) -> &'static str;
}

/// Optional qualifier pinning a code to a name or an element index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    Name(String),
    Index(usize),
}

/// One recorded diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry<C: ErrorCode> {
    pub code: C,
    pub context: Option<ErrorContext>,
}

/// A deduplicated list of `(code, context)` diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorList<C: ErrorCode> {
    entries: Vec<ErrorEntry<C>>,
}

impl<C: ErrorCode> Default for ErrorList<C> {
    fn default() -> Self {
        ErrorList {
            entries: Vec::new(),
        }
    }
}

impl<C: ErrorCode> ErrorList<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, code: C) {
        if !self.has_error(code) {
            self.entries.push(ErrorEntry {
                code,
                context: None,
            });
        }
    }

    pub fn add_error_with_name(&mut self, code: C, name: impl Into<String>) {
        let name = name.into();
        if !self.has_error_with_name(code, &name) {
            self.entries.push(ErrorEntry {
                code,
                context: Some(ErrorContext::Name(name)),
            });
        }
    }

    pub fn add_error_with_index(&mut self, code: C, index: usize) {
        if !self.has_error_with_index(code, index) {
            self.entries.push(ErrorEntry {
                code,
                context: Some(ErrorContext::Index(index)),
            });
        }
    }

    /// Whether `code` was recorded with no context.
    pub fn has_error(&self, code: C) -> bool {
        self.entries
            .iter()
            .any(|e| e.code == code && e.context.is_none())
    }

    pub fn has_error_with_name(&self, code: C, name: &str) -> bool {
        self.entries.iter().any(|e| {
            e.code == code
                && matches!(&e.context, Some(ErrorContext::Name(stored)) if stored == name)
        })
    }

    pub fn has_error_with_index(&self, code: C, index: usize) -> bool {
        self.entries.iter().any(|e| {
            e.code == code && matches!(&e.context, Some(ErrorContext::Index(i)) if *i == index)
        })
    }

    /// Whether `code` was recorded with any context.
    pub fn has_any_error(&self, code: C) -> bool {
        self.entries.iter().any(|e| e.code == code)
    }

    pub fn has_errors(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn get_errors(&self) -> &[ErrorEntry<C>] {
        &self.entries
    }

    pub fn clear_errors(&mut self) {
        self.entries.clear();
    }
}

/// Declares a subsystem error-code enum together with its messages.
macro_rules! error_codes {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($subsystem:literal) {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $message:literal,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )*
        }

        impl $crate::error_list::ErrorCode for $name {
            fn subsystem(&self) -> &'static str {
                $subsystem
            }

            fn message(&self) -> &'static str {
                match self {
                    $(Self::$variant => $message,)*
                }
            }
        }
    };
}

pub(crate) use error_codes;

#[cfg(test)]
mod tests {
    use super::*;

    error_codes! {
        enum TestError("test") {
            First => "first thing went wrong",
            Second => "second thing went wrong",
        }
    }

    #[test]
    fn duplicates_are_stored_once() {
        let mut list = ErrorList::new();
        list.add_error(TestError::First);
        list.add_error(TestError::First);
        list.add_error_with_index(TestError::First, 3);
        list.add_error_with_index(TestError::First, 3);
        list.add_error_with_name(TestError::Second, "ctx");
        list.add_error_with_name(TestError::Second, "ctx");
        assert_eq!(list.get_errors().len(), 3);
    }

    #[test]
    fn context_narrows_lookup() {
        let mut list = ErrorList::new();
        list.add_error_with_index(TestError::First, 7);
        assert!(!list.has_error(TestError::First));
        assert!(list.has_error_with_index(TestError::First, 7));
        assert!(!list.has_error_with_index(TestError::First, 8));
        assert!(list.has_any_error(TestError::First));
        assert!(!list.has_any_error(TestError::Second));
    }

    #[test]
    fn messages_are_stable() {
        assert_eq!(TestError::First.subsystem(), "test");
        assert_eq!(TestError::Second.message(), "second thing went wrong");
    }
}
