use crate::exception::Exception;
use std::fmt;

/// Cell is the machine word used uniformly for stacks, compiled code and
/// data. Chosen at build time through the target's pointer width.
pub type Cell = isize;
pub type UCell = usize;

/// Size of a cell in bytes.
pub const CELL: usize = std::mem::size_of::<Cell>();

/// Action of a native primitive.
pub type Action<T> = fn(&mut T);

/// What `execute` dispatches through for a dictionary entry.
///
/// Code pointers of the classical threaded model are re-architected as a
/// tagged variant plus a dispatch in `execute`, so no function address ever
/// crosses the flash boundary and the image stays relocatable.
pub enum Code<T> {
    /// Native word.
    Primitive(Action<T>),
    /// Colon definition, body threaded at the pfa.
    Colon,
    /// CREATEd word, pushes its pfa.
    Field,
    /// CONSTANT, pushes the cell stored at its pfa.
    Constant,
}

impl<T> Clone for Code<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Code<T> {}

impl<T> fmt::Debug for Code<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tag = match self {
            Code::Primitive(_) => "primitive",
            Code::Colon => "colon",
            Code::Field => "field",
            Code::Constant => "constant",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flag {
    Normal,
    Immediate,
    Undefined,
}

/// Dictionary entry.
///
/// `nfa` is the interned name in the string cache, `pfa` the body in flash;
/// both are arena byte offsets, zero when absent.
pub struct Entry<T> {
    pub nfa: usize,
    pub code: Code<T>,
    pub flag: Flag,
    pub pfa: usize,
}

impl<T> Entry<T> {
    pub fn new(nfa: usize, code: Code<T>, flag: Flag, pfa: usize) -> Entry<T> {
        Entry {
            nfa,
            code,
            flag,
            pfa,
        }
    }
}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Entry code {:?}, flg {:?}, nfa {:x}, pfa {:x}",
            self.code, self.flag, self.nfa, self.pfa
        )
    }
}

/// Execution token.
///
/// Tokens are 1-based cells: `1..=primitive count` names a primitive,
/// anything above names a colon definition. Zero is the null terminator of
/// a threaded body and never a valid token.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Xt(pub usize);

impl Xt {
    pub fn to_cell(self) -> Cell {
        self.0 as Cell
    }

    pub fn from_cell(cell: Cell) -> Result<Xt, Exception> {
        if cell > 0 {
            Ok(Xt(cell as usize))
        } else {
            Err(Exception::NoWord)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xt_cell() {
        let xt = Xt(42);
        assert_eq!(xt.to_cell(), 42);
        assert_eq!(Xt::from_cell(42), Ok(xt));
        assert!(Xt::from_cell(0).is_err());
        assert!(Xt::from_cell(-1).is_err());
    }
}
