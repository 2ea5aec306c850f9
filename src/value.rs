use std::fmt;

use static_assertions::{assert_eq_size, assert_impl_all};

/// Word sized payload handed over by [crate::call].
///
/// No type tag is attached. Producer and consumer agree on its interpretation out of band, the
/// same word could be read as pointer, integer or character.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(usize);

assert_eq_size!(Value, usize);
assert_eq_size!(Value, *const u8);
assert_impl_all!(Value: Send, Sync);

impl Value {
    /// Zero word.
    pub const NONE: Value = Value(0);

    pub const fn from_usize(u: usize) -> Value {
        Value(u)
    }

    pub const fn from_int(i: isize) -> Value {
        Value(i as usize)
    }

    pub const fn from_char(c: char) -> Value {
        Value(c as usize)
    }

    pub fn from_ptr<T>(p: *const T) -> Value {
        Value(p as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn as_int(self) -> isize {
        self.0 as isize
    }

    /// Reads this value as character, `None` if it is not a valid unicode scalar value.
    pub fn as_char(self) -> Option<char> {
        u32::try_from(self.0).ok().and_then(char::from_u32)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:#x})", self.0)
    }
}

impl From<usize> for Value {
    fn from(u: usize) -> Value {
        Value(u)
    }
}

impl From<isize> for Value {
    fn from(i: isize) -> Value {
        Value::from_int(i)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Value {
        Value::from_char(c)
    }
}
