//! Exception and reset-reason constants

use std::fmt;

/// One-byte error code recorded by a failing primitive.
///
/// The outer interpreter's `catch` inspects the code after every dispatch;
/// anything other than `Ok` unwinds the inner interpreter back to `quit`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Exception {
    /// = 0, not an error
    Ok = 0,
    /// = 1, push beyond stack ceiling
    StackOverflow,
    /// = 2, operation requires more items than present
    StackUnderflow,
    /// = 3, `/` or `%` with zero divisor
    DivisionByZero,
    /// = 4, input stack empty and no interactive source
    NoInput,
    /// = 5, radix outside 2..36
    BadBase,
    /// = 6, digit outside radix
    BadLiteral,
    /// = 7, number-to-string output would exceed buffer
    BufferOverflow,
    /// = 8, fetch/store through null
    NullPointer,
    /// = 9, compile into full flash arena
    NoSpace,
    /// = 10, defining word used in wrong state
    BadState,
    /// = 11, branch left unresolved at definition end
    Unresolved,
    /// = 12, OS signal delivered
    CaughtSignal,
    /// = 13, attempt to uncache a non-top string
    Unsave,
    /// = 14, tick of a non-existent name
    NoWord,
    /// = 15, host call failed
    SysCall,
    /// = 16, literal parse failure while compiling
    BadString,
    /// = 17, cannot open include file
    NoFile,
    /// = 18, input-stack overflow
    InStack,
    /// = 19, argument outside legal interval
    Range,
    /// = 20, fencepost
    Undefined,
}

impl Exception {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Description of the exception.
    pub fn description(self) -> &'static str {
        match self {
            Exception::Ok => "Not an error",
            Exception::StackOverflow => "Stack overflow",
            Exception::StackUnderflow => "Stack underflow",
            Exception::DivisionByZero => "Division by zero",
            Exception::NoInput => "No more input",
            Exception::BadBase => "Radix is out of range",
            Exception::BadLiteral => "Bad literal conversion",
            Exception::BufferOverflow => "Buffer overflow",
            Exception::NullPointer => "NULL pointer",
            Exception::NoSpace => "Dictionary space exhausted",
            Exception::BadState => "Bad state",
            Exception::Unresolved => "Unresolved branch",
            Exception::CaughtSignal => "Caught a signal",
            Exception::Unsave => "Too late to un-save",
            Exception::NoWord => "No such word exists",
            Exception::SysCall => "System call glitch",
            Exception::BadString => "Bad string",
            Exception::NoFile => "No file access",
            Exception::InStack => "Input stack overflow",
            Exception::Range => "Argument out of range",
            Exception::Undefined => "Undefined error",
        }
    }

    pub fn from_code(code: isize) -> Exception {
        match code {
            0 => Exception::Ok,
            1 => Exception::StackOverflow,
            2 => Exception::StackUnderflow,
            3 => Exception::DivisionByZero,
            4 => Exception::NoInput,
            5 => Exception::BadBase,
            6 => Exception::BadLiteral,
            7 => Exception::BufferOverflow,
            8 => Exception::NullPointer,
            9 => Exception::NoSpace,
            10 => Exception::BadState,
            11 => Exception::Unresolved,
            12 => Exception::CaughtSignal,
            13 => Exception::Unsave,
            14 => Exception::NoWord,
            15 => Exception::SysCall,
            16 => Exception::BadString,
            17 => Exception::NoFile,
            18 => Exception::InStack,
            19 => Exception::Range,
            _ => Exception::Undefined,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "-- {}.", self.description())
    }
}

/// Why the outer interpreter was re-entered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetReason {
    Unexpected = 0,
    SignalHandler = 1,
    Catch = 2,
    Application = 3,
    CheckStack = 4,
    ColdStart = 5,
    User = 6,
}

impl ResetReason {
    pub fn description(self) -> &'static str {
        match self {
            ResetReason::Unexpected => "unexpected",
            ResetReason::SignalHandler => "sig_hdlr",
            ResetReason::Catch => "catch",
            ResetReason::Application => "application",
            ResetReason::CheckStack => "checkstack",
            ResetReason::ColdStart => "cold start",
            ResetReason::User => "user",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in 0..=19 {
            let e = Exception::from_code(code);
            assert_eq!(e.code() as isize, code);
        }
        assert_eq!(Exception::from_code(99), Exception::Undefined);
    }

    #[test]
    fn test_description() {
        assert_eq!(Exception::StackUnderflow.description(), "Stack underflow");
        assert_eq!(format!("{}", Exception::DivisionByZero), "-- Division by zero.");
    }
}
