//! The instruction set executed by the VM (spec §4.4).
//!
//! Instructions are stored as a flat stream of `i32`s: every instruction
//! occupies exactly two slots, `[opcode, arg]`, even when the opcode ignores
//! its argument. This keeps absolute jump targets (byte offsets into
//! `co_code`) stable regardless of which opcodes precede them, per spec
//! §4.4: "instructions without arguments still advance the program counter
//! by two slots".

/// A single value-stack comparison kind, the immediate argument of
/// `COMPARE_OP` (spec §4.4: "op code 0..5 for `== != < <= > >=`").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CompareOp {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

impl CompareOp {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Lt,
            3 => Self::Le,
            4 => Self::Gt,
            5 => Self::Ge,
            _ => return None,
        })
    }

    pub fn method_names(self) -> (&'static str, &'static str) {
        match self {
            Self::Eq => ("__eq__", "__eq__"),
            Self::Ne => ("__ne__", "__ne__"),
            Self::Lt => ("__lt__", "__gt__"),
            Self::Le => ("__le__", "__ge__"),
            Self::Gt => ("__gt__", "__lt__"),
            Self::Ge => ("__ge__", "__le__"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// The number of variants in reserved `RAISE_VARARGS` forms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RaiseKind {
    Reraise = 0,
    Raise = 1,
    RaiseFrom = 2,
}

impl RaiseKind {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Reraise,
            1 => Self::Raise,
            2 => Self::RaiseFrom,
            _ => return None,
        })
    }
}

macro_rules! opcodes {
    ($($name:ident = $val:expr),* $(,)?) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $val),*
        }

        impl Opcode {
            pub fn from_i32(v: i32) -> Option<Self> {
                Some(match v {
                    $($val => Self::$name,)*
                    _ => return None,
                })
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    // Stack shuffles
    NOP = 0,
    POP_TOP = 1,
    DUP_TOP = 2,
    DUP_TOP_TWO = 3,
    ROT_TWO = 4,
    ROT_THREE = 5,
    ROT_FOUR = 6,

    // Constants / names
    LOAD_CONST = 10,
    LOAD_NAME = 11,
    STORE_NAME = 12,
    DELETE_NAME = 13,
    LOAD_GLOBAL = 14,
    STORE_GLOBAL = 15,
    DELETE_GLOBAL = 16,
    LOAD_FAST = 17,
    STORE_FAST = 18,
    DELETE_FAST = 19,
    LOAD_DEREF = 20,
    STORE_DEREF = 21,
    DELETE_DEREF = 22,
    LOAD_CLOSURE = 23,

    // Attributes / subscripts
    LOAD_ATTR = 30,
    STORE_ATTR = 31,
    DELETE_ATTR = 32,
    BINARY_SUBSCR = 33,
    STORE_SUBSCR = 34,
    DELETE_SUBSCR = 35,

    // Binary / in-place arithmetic
    BINARY_ADD = 40,
    BINARY_SUBTRACT = 41,
    BINARY_MULTIPLY = 42,
    BINARY_TRUE_DIVIDE = 43,
    BINARY_FLOOR_DIVIDE = 44,
    BINARY_MODULO = 45,
    BINARY_POWER = 46,
    BINARY_LSHIFT = 47,
    BINARY_RSHIFT = 48,
    BINARY_AND = 49,
    BINARY_OR = 50,
    BINARY_XOR = 51,

    INPLACE_ADD = 60,
    INPLACE_SUBTRACT = 61,
    INPLACE_MULTIPLY = 62,
    INPLACE_TRUE_DIVIDE = 63,
    INPLACE_FLOOR_DIVIDE = 64,
    INPLACE_MODULO = 65,
    INPLACE_POWER = 66,
    INPLACE_LSHIFT = 67,
    INPLACE_RSHIFT = 68,
    INPLACE_AND = 69,
    INPLACE_OR = 70,
    INPLACE_XOR = 71,

    // Unary
    UNARY_POSITIVE = 80,
    UNARY_NEGATIVE = 81,
    UNARY_INVERT = 82,
    UNARY_NOT = 83,

    // Comparisons
    COMPARE_OP = 90,
    IS_OP = 91,
    IS_NOT_OP = 92,
    IN_OP = 93,
    NOT_IN_OP = 94,

    // Containers
    BUILD_LIST = 100,
    BUILD_TUPLE = 101,
    BUILD_MAP = 102,
    BUILD_SET = 103,
    BUILD_SLICE = 104,
    BUILD_STRING = 105,
    UNPACK_SEQUENCE = 106,
    UNPACK_EX = 107,
    LIST_APPEND = 108,
    SET_ADD = 109,
    MAP_ADD = 110,
    FORMAT_VALUE = 111,

    // Control flow
    JUMP_ABSOLUTE = 120,
    JUMP_FORWARD = 121,
    POP_JUMP_IF_FALSE = 122,
    POP_JUMP_IF_TRUE = 123,
    JUMP_IF_FALSE_OR_POP = 124,
    JUMP_IF_TRUE_OR_POP = 125,
    GET_ITER = 126,
    FOR_ITER = 127,

    // Calls / frames
    CALL_FUNCTION = 140,
    CALL_FUNCTION_KW = 141,
    CALL_FUNCTION_EX = 142,
    MAKE_FUNCTION = 143,
    RETURN_VALUE = 144,
    YIELD_VALUE = 145,
    YIELD_FROM = 146,
    GET_YIELD_FROM_ITER = 147,

    // Exceptions / blocks
    SETUP_FINALLY = 160,
    POP_BLOCK = 161,
    RAISE_VARARGS = 162,
    RERAISE = 163,
    SETUP_WITH = 164,
    WITH_CLEANUP = 165,
    POP_EXCEPT = 166,
    END_FINALLY = 167,
    LOAD_ASSERTION_ERROR = 168,

    // Imports
    IMPORT_NAME = 180,
    IMPORT_FROM = 181,
    IMPORT_STAR = 182,

    // Misc
    LOAD_BUILD_CLASS = 190,
    PRINT_EXPR = 191,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_i32() {
        for op in [
            Opcode::LOAD_CONST,
            Opcode::CALL_FUNCTION,
            Opcode::RETURN_VALUE,
            Opcode::YIELD_VALUE,
        ] {
            let v = op as u8 as i32;
            assert_eq!(Opcode::from_i32(v), Some(op));
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert_eq!(Opcode::from_i32(255), None);
    }
}
