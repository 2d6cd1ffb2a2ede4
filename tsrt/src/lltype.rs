//! Low-level types, the closed vocabulary of scalar operations, and the handful of runtime
//! services (allocation, raw memory access, native calls) that folding, concrete interpretation,
//! and generated code all share.
//!
//! Every value is a 64-bit word. Struct field `i` lives at byte offset `8 * i`; an array stores
//! its length at offset 0 and item `i` at offset `8 + 8 * i`.

use crate::error::CompilationError;
use std::{cell::Cell, fmt, rc::Rc};
use strum::{EnumCount, EnumIter, IntoStaticStr};

/// The size in bytes of every field, item, and value.
pub const WORD: i64 = 8;

#[derive(Clone, Debug)]
pub enum LLType {
    Void,
    Bool,
    Char,
    Signed,
    Ptr(Rc<ContainerType>),
    Func(Rc<FuncType>),
}

impl LLType {
    /// Create a pointer to a new struct type.
    pub fn new_struct(name: &str, fields: &[(&str, LLType)], immutable: bool) -> Self {
        LLType::Ptr(Rc::new(ContainerType::Struct(StructType {
            name: name.to_owned(),
            fields: fields
                .iter()
                .map(|(n, t)| ((*n).to_owned(), t.clone()))
                .collect(),
            immutable,
            noidentity: false,
        })))
    }

    /// Create a pointer to a new immutable struct type whose instances have no identity: two
    /// instances with the same field values are interchangeable.
    pub fn new_value_struct(name: &str, fields: &[(&str, LLType)]) -> Self {
        LLType::Ptr(Rc::new(ContainerType::Struct(StructType {
            name: name.to_owned(),
            fields: fields
                .iter()
                .map(|(n, t)| ((*n).to_owned(), t.clone()))
                .collect(),
            immutable: true,
            noidentity: true,
        })))
    }

    /// Create a pointer to a new array type.
    pub fn new_array(of: LLType, immutable: bool) -> Self {
        LLType::Ptr(Rc::new(ContainerType::Array(ArrayType { of, immutable })))
    }

    pub fn new_func(args: &[LLType], result: LLType) -> Self {
        LLType::Func(Rc::new(FuncType {
            args: args.to_vec(),
            result,
        }))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, LLType::Void)
    }

    pub fn container(&self) -> Option<&Rc<ContainerType>> {
        match self {
            LLType::Ptr(c) => Some(c),
            _ => None,
        }
    }

    pub fn struct_type(&self) -> Option<&StructType> {
        match self {
            LLType::Ptr(c) => match &**c {
                ContainerType::Struct(s) => Some(s),
                ContainerType::Array(_) => None,
            },
            _ => None,
        }
    }

    pub fn array_type(&self) -> Option<&ArrayType> {
        match self {
            LLType::Ptr(c) => match &**c {
                ContainerType::Array(a) => Some(a),
                ContainerType::Struct(_) => None,
            },
            _ => None,
        }
    }

    /// The type of field `name` of the struct this type points to.
    pub fn field_type(&self, name: &str) -> Result<&LLType, CompilationError> {
        let st = self
            .struct_type()
            .ok_or_else(|| CompilationError::General(format!("{self} is not a struct pointer")))?;
        st.field(name).map(|(_, t)| t)
    }
}

impl PartialEq for LLType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LLType::Void, LLType::Void)
            | (LLType::Bool, LLType::Bool)
            | (LLType::Char, LLType::Char)
            | (LLType::Signed, LLType::Signed) => true,
            (LLType::Ptr(a), LLType::Ptr(b)) => Rc::ptr_eq(a, b),
            (LLType::Func(a), LLType::Func(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for LLType {}

impl fmt::Display for LLType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLType::Void => write!(f, "Void"),
            LLType::Bool => write!(f, "Bool"),
            LLType::Char => write!(f, "Char"),
            LLType::Signed => write!(f, "Signed"),
            LLType::Ptr(c) => match &**c {
                ContainerType::Struct(s) => write!(f, "*{}", s.name),
                ContainerType::Array(a) => write!(f, "*Array({})", a.of),
            },
            LLType::Func(ft) => {
                write!(
                    f,
                    "Func({}) -> {}",
                    ft.args
                        .iter()
                        .map(|x| x.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    ft.result
                )
            }
        }
    }
}

#[derive(Debug)]
pub enum ContainerType {
    Struct(StructType),
    Array(ArrayType),
}

#[derive(Debug)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<(String, LLType)>,
    /// Fields can never be written after initialization.
    pub immutable: bool,
    /// Instances have no identity, so an all-constant instance can be shared.
    pub noidentity: bool,
}

impl StructType {
    /// Return the index and type of field `name`.
    pub fn field(&self, name: &str) -> Result<(usize, &LLType), CompilationError> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, (n, _))| n == name)
            .map(|(i, (_, t))| (i, t))
            .ok_or_else(|| {
                CompilationError::General(format!("struct {} has no field '{name}'", self.name))
            })
    }

    pub fn size(&self) -> i64 {
        WORD * self.fields.len() as i64
    }
}

#[derive(Debug)]
pub struct ArrayType {
    pub of: LLType,
    pub immutable: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FuncType {
    pub args: Vec<LLType>,
    pub result: LLType,
}

/// The scalar operations. Every one of them is foldable and side-effect free: the memory, call,
/// and hint operations are separate [crate::flowgraph::OpKind] variants.
#[derive(Clone, Copy, Debug, EnumCount, EnumIter, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum LLOp {
    IntAdd,
    IntSub,
    IntMul,
    #[strum(serialize = "int_floordiv")]
    IntFloorDiv,
    IntMod,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    IntNeg,
    IntInvert,
    IntIsTrue,
    BoolNot,
    CharEq,
    CharNe,
    CastBoolToInt,
    CastCharToInt,
    CastIntToChar,
}

impl LLOp {
    pub fn opname(self) -> &'static str {
        self.into()
    }

    pub fn nargs(self) -> usize {
        match self {
            LLOp::IntNeg
            | LLOp::IntInvert
            | LLOp::IntIsTrue
            | LLOp::BoolNot
            | LLOp::CastBoolToInt
            | LLOp::CastCharToInt
            | LLOp::CastIntToChar => 1,
            _ => 2,
        }
    }

    /// Can this operation be evaluated at specialization time when all its arguments are known?
    pub fn canfold(self) -> bool {
        true
    }

    pub fn sideeffects(self) -> bool {
        false
    }

    pub fn result_type(self) -> LLType {
        match self {
            LLOp::IntLt
            | LLOp::IntLe
            | LLOp::IntEq
            | LLOp::IntNe
            | LLOp::IntGt
            | LLOp::IntGe
            | LLOp::IntIsTrue
            | LLOp::BoolNot
            | LLOp::CharEq
            | LLOp::CharNe => LLType::Bool,
            LLOp::CastIntToChar => LLType::Char,
            _ => LLType::Signed,
        }
    }

    /// Evaluate this operation. Arithmetic wraps, shift counts are taken modulo 64 (as the
    /// machine does), and division truncates towards zero.
    pub fn fold(self, args: &[i64]) -> Result<i64, CompilationError> {
        if args.len() != self.nargs() {
            return Err(CompilationError::InternalError(format!(
                "{} takes {} arguments, got {}",
                self.opname(),
                self.nargs(),
                args.len()
            )));
        }
        let x = args[0];
        let y = args.get(1).copied().unwrap_or(0);
        let r = match self {
            LLOp::IntAdd => x.wrapping_add(y),
            LLOp::IntSub => x.wrapping_sub(y),
            LLOp::IntMul => x.wrapping_mul(y),
            LLOp::IntFloorDiv => x.checked_div(y).ok_or_else(|| {
                CompilationError::General(format!("int_floordiv({x}, {y}) cannot be folded"))
            })?,
            LLOp::IntMod => x.checked_rem(y).ok_or_else(|| {
                CompilationError::General(format!("int_mod({x}, {y}) cannot be folded"))
            })?,
            LLOp::IntAnd => x & y,
            LLOp::IntOr => x | y,
            LLOp::IntXor => x ^ y,
            LLOp::IntLshift => x.wrapping_shl((y & 63) as u32),
            LLOp::IntRshift => x.wrapping_shr((y & 63) as u32),
            LLOp::IntLt => i64::from(x < y),
            LLOp::IntLe => i64::from(x <= y),
            LLOp::IntEq | LLOp::CharEq => i64::from(x == y),
            LLOp::IntNe | LLOp::CharNe => i64::from(x != y),
            LLOp::IntGt => i64::from(x > y),
            LLOp::IntGe => i64::from(x >= y),
            LLOp::IntNeg => x.wrapping_neg(),
            LLOp::IntInvert => !x,
            LLOp::IntIsTrue => i64::from(x != 0),
            LLOp::BoolNot => i64::from(x == 0),
            LLOp::CastBoolToInt | LLOp::CastCharToInt => x,
            LLOp::CastIntToChar => x & 0xff,
        };
        Ok(r)
    }
}

/// Allocate `size` zeroed bytes. Memory is never freed.
pub(crate) extern "C" fn tsrt_malloc(size: i64) -> i64 {
    let size = usize::try_from(size.max(WORD)).unwrap_or(usize::MAX);
    let p = unsafe { libc::calloc(1, size) };
    if p.is_null() {
        eprintln!("tsrt: out of memory allocating {size} bytes");
        std::process::abort();
    }
    p as i64
}

/// Allocate a zeroed array of `len` words (plus its length word). The caller stores the length.
pub(crate) extern "C" fn tsrt_malloc_varsize(len: i64) -> i64 {
    if len < 0 {
        eprintln!("tsrt: negative array length {len}");
        std::process::abort();
    }
    tsrt_malloc(len.saturating_add(1).saturating_mul(WORD))
}

/// Allocate and initialize an array of `len` items, as generated code does.
pub(crate) fn alloc_array(len: i64) -> Result<i64, CompilationError> {
    if len < 0 {
        return Err(CompilationError::General(format!(
            "negative array length {len}"
        )));
    }
    let p = tsrt_malloc_varsize(len);
    write_word(p, 0, len)?;
    Ok(p)
}

/// Byte offset of array item `index`.
pub(crate) fn item_offset(index: i64) -> i64 {
    WORD + WORD * index
}

pub(crate) fn read_word(addr: i64, offset: i64) -> Result<i64, CompilationError> {
    if addr == 0 {
        return Err(CompilationError::General(
            "read through a null pointer".to_owned(),
        ));
    }
    Ok(unsafe { *((addr + offset) as *const i64) })
}

pub(crate) fn write_word(addr: i64, offset: i64, value: i64) -> Result<(), CompilationError> {
    if addr == 0 {
        return Err(CompilationError::General(
            "write through a null pointer".to_owned(),
        ));
    }
    unsafe { *((addr + offset) as *mut i64) = value };
    Ok(())
}

/// Read item `index` of the array at `addr`, checking bounds.
pub(crate) fn read_item(addr: i64, index: i64) -> Result<i64, CompilationError> {
    let len = read_word(addr, 0)?;
    if index < 0 || index >= len {
        return Err(CompilationError::General(format!(
            "array index {index} out of bounds (length {len})"
        )));
    }
    read_word(addr, item_offset(index))
}

pub(crate) fn write_item(addr: i64, index: i64, value: i64) -> Result<(), CompilationError> {
    let len = read_word(addr, 0)?;
    if index < 0 || index >= len {
        return Err(CompilationError::General(format!(
            "array index {index} out of bounds (length {len})"
        )));
    }
    write_word(addr, item_offset(index), value)
}

/// One of the two words of the pending exception. A type of 0 means no exception is pending.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ExcField {
    Type,
    Value,
}

thread_local! {
    /// The pending exception of this thread, shared by interpreted graphs and generated code.
    static EXC_DATA: Cell<(i64, i64)> = const { Cell::new((0, 0)) };
}

pub(crate) fn exc_field(f: ExcField) -> i64 {
    let (t, v) = EXC_DATA.get();
    match f {
        ExcField::Type => t,
        ExcField::Value => v,
    }
}

pub(crate) fn set_exc_field(f: ExcField, x: i64) {
    let (t, v) = EXC_DATA.get();
    EXC_DATA.set(match f {
        ExcField::Type => (x, v),
        ExcField::Value => (t, x),
    });
}

/// Take this thread's pending exception, if any, as `(type, value)`. Graphs report exceptions
/// through [crate::flowgraph::OpKind::SetExc]; a specialized portal leaves its exception here
/// when it returns.
pub fn take_exception() -> Option<(i64, i64)> {
    let (t, v) = EXC_DATA.replace((0, 0));
    (t != 0).then_some((t, v))
}

pub(crate) extern "C" fn tsrt_exc_fetch_type() -> i64 {
    exc_field(ExcField::Type)
}

pub(crate) extern "C" fn tsrt_exc_fetch_value() -> i64 {
    exc_field(ExcField::Value)
}

pub(crate) extern "C" fn tsrt_exc_clear() -> i64 {
    EXC_DATA.set((0, 0));
    0
}

pub(crate) extern "C" fn tsrt_exc_raise(etype: i64, evalue: i64) -> i64 {
    EXC_DATA.set((etype, evalue));
    0
}

/// Call the native function at `addr` with word arguments using the platform C calling
/// convention.
///
/// # Safety
///
/// `addr` must be the address of a function taking exactly `args.len()` word arguments and
/// returning a word.
pub(crate) unsafe fn call_native(addr: i64, args: &[i64]) -> Result<i64, CompilationError> {
    type F0 = extern "C" fn() -> i64;
    type F1 = extern "C" fn(i64) -> i64;
    type F2 = extern "C" fn(i64, i64) -> i64;
    type F3 = extern "C" fn(i64, i64, i64) -> i64;
    type F4 = extern "C" fn(i64, i64, i64, i64) -> i64;
    type F5 = extern "C" fn(i64, i64, i64, i64, i64) -> i64;
    type F6 = extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64;
    let p = addr as usize as *const ();
    let r = match *args {
        [] => unsafe { std::mem::transmute::<*const (), F0>(p)() },
        [a] => unsafe { std::mem::transmute::<*const (), F1>(p)(a) },
        [a, b] => unsafe { std::mem::transmute::<*const (), F2>(p)(a, b) },
        [a, b, c] => unsafe { std::mem::transmute::<*const (), F3>(p)(a, b, c) },
        [a, b, c, d] => unsafe { std::mem::transmute::<*const (), F4>(p)(a, b, c, d) },
        [a, b, c, d, e] => unsafe { std::mem::transmute::<*const (), F5>(p)(a, b, c, d, e) },
        [a, b, c, d, e, f] => unsafe { std::mem::transmute::<*const (), F6>(p)(a, b, c, d, e, f) },
        _ => {
            return Err(CompilationError::LimitExceeded(format!(
                "native calls take at most 6 arguments, got {}",
                args.len()
            )))
        }
    };
    Ok(r)
}
