use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::IndexMap;
use vks_syntax::{Ast, BinOp, BuiltinFn, Literal, LogicOp, Node, NodeId, Pos, UnOp};

pub use vks_syntax::SyntaxError;

/// Every executed instruction costs one tick; a program that spends more
/// than this many ticks is aborted.
pub const OP_BUDGET: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Either phase of failure, for callers that go from source text straight
/// to a result.
#[derive(Debug)]
pub enum Error {
    Syntax(SyntaxError),
    Runtime(RuntimeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syntax(err) => err.fmt(f),
            Error::Runtime(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<SyntaxError> for Error {
    fn from(err: SyntaxError) -> Self {
        Error::Syntax(err)
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        Error::Runtime(err)
    }
}

/// The host-facing value type. Scripts receive their argument as a `Value`
/// and return one; API handlers trade in them as well.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Record(IndexMap<String, Value>),
}

/// Runtime representation. Arrays and records collapse into one ordered
/// string-keyed map; integers are raw 32-bit words interpreted as signed
/// only where an operation calls for it.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Bool(bool),
    Int(u32),
    Float(f64),
    Str(String),
    Object(IndexMap<String, Cell>),
}

/// Numeric coercion result.
enum Num {
    Int(u32),
    Float(f64),
}

impl Num {
    fn as_float(&self) -> f64 {
        match self {
            Num::Int(n) => f64::from(*n as i32),
            Num::Float(d) => *d,
        }
    }
}

impl Cell {
    /// Coercion rank. Two operands combine with bitwise OR, so int beats
    /// nothing, float beats int, and strings absorb almost everything.
    fn rank(&self) -> u8 {
        match self {
            Cell::Int(_) => 1,
            Cell::Float(_) => 3,
            Cell::Object(_) => 4,
            _ => 7,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Cell::Null => false,
            Cell::Bool(b) => *b,
            Cell::Int(n) => *n != 0,
            Cell::Float(d) => *d != 0.0,
            Cell::Str(s) => !s.is_empty(),
            Cell::Object(map) => !map.is_empty(),
        }
    }

    fn to_number(&self) -> Result<Num, RuntimeError> {
        match self {
            Cell::Int(n) => Ok(Num::Int(*n)),
            Cell::Float(d) => Ok(Num::Float(*d)),
            Cell::Bool(b) => Ok(Num::Int(u32::from(*b))),
            Cell::Str(s) => {
                if let Some(n) = parse_int_str(s) {
                    Ok(Num::Int(n))
                } else if let Some(d) = parse_float_str(s) {
                    Ok(Num::Float(d))
                } else {
                    Err(RuntimeError::new("Numeric value is expected"))
                }
            }
            _ => Err(RuntimeError::new("Numeric value is expected")),
        }
    }

    fn to_int(&self) -> Result<u32, RuntimeError> {
        match self.to_number()? {
            Num::Int(n) => Ok(n),
            // Truncation toward zero, wrapped into 32 bits.
            Num::Float(d) => Ok(d as i64 as u32),
        }
    }

    fn to_float(&self) -> Result<f64, RuntimeError> {
        Ok(self.to_number()?.as_float())
    }

    fn to_text(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(b) => {
                if *b {
                    "1".to_string()
                } else {
                    String::new()
                }
            }
            Cell::Int(n) => (*n as i32).to_string(),
            Cell::Float(d) => {
                if d.is_nan() {
                    "NaN".to_string()
                } else if d.is_infinite() {
                    if *d > 0.0 {
                        "Infinity".to_string()
                    } else {
                        "-Infinity".to_string()
                    }
                } else {
                    format!("{d:?}")
                }
            }
            Cell::Str(s) => s.clone(),
            Cell::Object(map) => {
                let parts: Vec<String> = map.values().map(Cell::to_text).collect();
                parts.join(",")
            }
        }
    }

    fn to_object(&self) -> IndexMap<String, Cell> {
        match self {
            Cell::Object(map) => map.clone(),
            _ => IndexMap::new(),
        }
    }
}

/// A whole decimal integer, optionally signed, folded into 32 bits.
fn parse_int_str(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut value: u32 = 0;
    for b in digits.bytes() {
        value = value
            .wrapping_mul(10)
            .wrapping_add(u32::from(b - b'0'));
    }
    Some(if negative { value.wrapping_neg() } else { value })
}

fn parse_float_str(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn value_to_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Bool(*b),
        Value::Int(n) => Cell::Int(*n as u32),
        Value::Float(d) => Cell::Float(*d),
        Value::String(s) => Cell::Str(s.clone()),
        Value::Array(items) => Cell::Object(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| (i.to_string(), value_to_cell(item)))
                .collect(),
        ),
        Value::Record(map) => Cell::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), value_to_cell(item)))
                .collect(),
        ),
    }
}

fn cell_to_value(cell: &Cell) -> Value {
    match cell {
        Cell::Null => Value::Null,
        Cell::Bool(b) => Value::Bool(*b),
        Cell::Int(n) => Value::Int(*n as i32),
        Cell::Float(d) => Value::Float(*d),
        Cell::Str(s) => Value::String(s.clone()),
        Cell::Object(map) => {
            // Keys forming exactly the run "0".."n-1" in order read back as
            // an array; anything else is a record.
            let is_array = map.keys().enumerate().all(|(i, key)| key == &i.to_string());
            if is_array {
                Value::Array(map.values().map(cell_to_value).collect())
            } else {
                Value::Record(
                    map.iter()
                        .map(|(key, item)| (key.clone(), cell_to_value(item)))
                        .collect(),
                )
            }
        }
    }
}

fn binary(op: BinOp, lhs: Cell, rhs: Cell) -> Result<Cell, RuntimeError> {
    match op {
        BinOp::Add => add(lhs, rhs),
        BinOp::Sub | BinOp::Mul | BinOp::Div => numeric(op, lhs, rhs),
        BinOp::Mod | BinOp::BitAnd | BinOp::BitOr | BinOp::Shl | BinOp::Shr => {
            int_binary(op, lhs, rhs)
        }
        BinOp::Eq | BinOp::Ne | BinOp::Ge | BinOp::Gt | BinOp::Le | BinOp::Lt => {
            compare(op, lhs, rhs)
        }
    }
}

fn add(lhs: Cell, rhs: Cell) -> Result<Cell, RuntimeError> {
    match lhs.rank() | rhs.rank() {
        1 => Ok(Cell::Int(lhs.to_int()?.wrapping_add(rhs.to_int()?))),
        3 => Ok(Cell::Float(lhs.to_float()? + rhs.to_float()?)),
        4 => {
            let mut merged = lhs.to_object();
            for (key, item) in rhs.to_object() {
                merged.insert(key, item);
            }
            Ok(Cell::Object(merged))
        }
        7 => Ok(Cell::Str(lhs.to_text() + &rhs.to_text())),
        _ => Err(RuntimeError::new("Numeric value is expected")),
    }
}

fn numeric(op: BinOp, lhs: Cell, rhs: Cell) -> Result<Cell, RuntimeError> {
    let a = lhs.to_number()?;
    let b = rhs.to_number()?;
    if let (Num::Int(x), Num::Int(y)) = (&a, &b) {
        let (x, y) = (*x, *y);
        return match op {
            BinOp::Sub => Ok(Cell::Int(x.wrapping_sub(y))),
            BinOp::Mul => Ok(Cell::Int(x.wrapping_mul(y))),
            BinOp::Div => {
                if y == 0 {
                    return Err(RuntimeError::new("Division by zero"));
                }
                // Signed truncating division, wrapped back into 32 bits.
                let quotient = i64::from(x as i32) / i64::from(y as i32);
                Ok(Cell::Int(quotient as u32))
            }
            _ => Err(RuntimeError::new("Numeric value is expected")),
        };
    }
    let x = a.as_float();
    let y = b.as_float();
    match op {
        BinOp::Sub => Ok(Cell::Float(x - y)),
        BinOp::Mul => Ok(Cell::Float(x * y)),
        BinOp::Div => Ok(Cell::Float(x / y)),
        _ => Err(RuntimeError::new("Numeric value is expected")),
    }
}

fn int_binary(op: BinOp, lhs: Cell, rhs: Cell) -> Result<Cell, RuntimeError> {
    let x = lhs.to_int()?;
    let y = rhs.to_int()?;
    let result = match op {
        BinOp::Mod => {
            if y as i32 == 0 {
                return Err(RuntimeError::new("Division by zero"));
            }
            (i64::from(x as i32) % i64::from(y as i32)) as u32
        }
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::Shl => {
            if y >= 32 {
                0
            } else {
                x << y
            }
        }
        BinOp::Shr => {
            let count = y as i32;
            if count < 0 {
                return Err(RuntimeError::new("negative shift count"));
            }
            // Arithmetic shift; counts past the width saturate at 31.
            ((x as i32) >> count.min(31)) as u32
        }
        _ => return Err(RuntimeError::new("Numeric value is expected")),
    };
    Ok(Cell::Int(result))
}

fn compare(op: BinOp, lhs: Cell, rhs: Cell) -> Result<Cell, RuntimeError> {
    let incomparable = || RuntimeError::new("Comparing values of different or unsupported types");
    if matches!(lhs, Cell::Object(_)) || matches!(rhs, Cell::Object(_)) {
        return Err(incomparable());
    }
    let result = if let (Cell::Str(x), Cell::Str(y)) = (&lhs, &rhs) {
        match op {
            BinOp::Eq => x == y,
            BinOp::Ne => x != y,
            BinOp::Ge => x >= y,
            BinOp::Gt => x > y,
            BinOp::Le => x <= y,
            BinOp::Lt => x < y,
            _ => return Err(incomparable()),
        }
    } else {
        let a = lhs.to_number().map_err(|_| incomparable())?;
        let b = rhs.to_number().map_err(|_| incomparable())?;
        if let (Num::Int(x), Num::Int(y)) = (&a, &b) {
            let (x, y) = (*x as i32, *y as i32);
            match op {
                BinOp::Eq => x == y,
                BinOp::Ne => x != y,
                BinOp::Ge => x >= y,
                BinOp::Gt => x > y,
                BinOp::Le => x <= y,
                BinOp::Lt => x < y,
                _ => return Err(incomparable()),
            }
        } else {
            let (x, y) = (a.as_float(), b.as_float());
            match op {
                BinOp::Eq => x == y,
                BinOp::Ne => x != y,
                BinOp::Ge => x >= y,
                BinOp::Gt => x > y,
                BinOp::Le => x <= y,
                BinOp::Lt => x < y,
                _ => return Err(incomparable()),
            }
        }
    };
    Ok(Cell::Bool(result))
}

fn unary(op: UnOp, value: Cell) -> Result<Cell, RuntimeError> {
    match op {
        UnOp::Not => Ok(Cell::Bool(!value.truthy())),
        UnOp::Invert => Ok(Cell::Int(value.to_int()? ^ 0xffff_ffff)),
        UnOp::Neg => match value.to_number()? {
            Num::Int(n) => Ok(Cell::Int(n.wrapping_neg())),
            Num::Float(d) => Ok(Cell::Float(-d)),
        },
    }
}

/// parseInt / parseDouble: stringify, then take the longest prefix that
/// parses as a whole number; 0 when nothing does.
fn builtin_parse(func: BuiltinFn, arg: &Cell) -> Cell {
    let text = arg.to_text();
    match func {
        BuiltinFn::ParseInt => {
            let mut end = text.len();
            while end > 0 {
                if text.is_char_boundary(end) {
                    if let Some(n) = parse_int_str(&text[..end]) {
                        return Cell::Int(n);
                    }
                }
                end -= 1;
            }
            Cell::Int(0)
        }
        BuiltinFn::ParseFloat => {
            let mut end = text.len();
            while end > 0 {
                if text.is_char_boundary(end) {
                    if let Some(d) = parse_float_str(&text[..end]) {
                        return Cell::Float(d);
                    }
                }
                end -= 1;
            }
            Cell::Float(0.0)
        }
    }
}

/// Attribute read. Stored keys shadow the synthetic `length`; anything
/// unknown reads as null.
fn get_attr(cell: &Cell, name: &str) -> Cell {
    match cell {
        Cell::Object(map) => {
            if let Some(value) = map.get(name) {
                value.clone()
            } else if name == "length" {
                Cell::Int(map.len() as u32)
            } else {
                Cell::Null
            }
        }
        Cell::Str(s) if name == "length" => Cell::Int(s.chars().count() as u32),
        _ => Cell::Null,
    }
}

/// Subscript read. Unlike attribute reads there is no `length` fallback.
fn get_item(cell: &Cell, key: &str) -> Cell {
    match cell {
        Cell::Object(map) => map.get(key).cloned().unwrap_or(Cell::Null),
        _ => Cell::Null,
    }
}

fn set_attr(cell: &Cell, name: &str, value: Cell) -> Result<Cell, RuntimeError> {
    if let Cell::Object(map) = cell {
        let mut updated = map.clone();
        updated.insert(name.to_string(), value);
        Ok(Cell::Object(updated))
    } else {
        Err(RuntimeError::new(format!(
            "setting field [{name}] on not array variable"
        )))
    }
}

fn del_attr(cell: &Cell, name: &str) -> Result<Cell, RuntimeError> {
    if let Cell::Object(map) = cell {
        let mut updated = map.clone();
        updated.shift_remove(name);
        Ok(Cell::Object(updated))
    } else {
        Err(RuntimeError::new(format!(
            "deleting field [{name}] on not array variable"
        )))
    }
}

/// `list@.attr` projection: for every element that is an object the named
/// field is taken (null when absent); non-objects project to null. Keys of
/// the receiver are preserved.
fn attr_filter(cell: &Cell, name: &str) -> Cell {
    match cell {
        Cell::Object(map) => {
            let mut out = IndexMap::new();
            for (key, item) in map {
                let picked = match item {
                    Cell::Object(inner) => inner.get(name).cloned().unwrap_or(Cell::Null),
                    _ => Cell::Null,
                };
                out.insert(key.clone(), picked);
            }
            Cell::Object(out)
        }
        _ => Cell::Object(IndexMap::new()),
    }
}

fn is_numeric_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

/// Splits an object into its numeric-keyed elements (in insertion order)
/// and the remaining entries.
fn normalize(map: IndexMap<String, Cell>) -> (Vec<Cell>, Vec<(String, Cell)>) {
    let mut arr = Vec::new();
    let mut rest = Vec::new();
    for (key, item) in map {
        if is_numeric_key(&key) {
            arr.push(item);
        } else {
            rest.push((key, item));
        }
    }
    (arr, rest)
}

/// Inverse of [`normalize`]: the numeric run renumbered from zero, then
/// the non-numeric entries in their old order.
fn rebuild(arr: Vec<Cell>, rest: Vec<(String, Cell)>) -> IndexMap<String, Cell> {
    let mut out = IndexMap::new();
    for (i, item) in arr.into_iter().enumerate() {
        out.insert(i.to_string(), item);
    }
    out.extend(rest);
    out
}

fn arity_error(name: &str) -> RuntimeError {
    RuntimeError::new(format!("Bad argument count for method {name}"))
}

/// Dispatches a method call; returns the call result together with the
/// receiver as it looks after the call.
fn call_method(recv: Cell, name: &str, args: Vec<Cell>) -> Result<(Cell, Cell), RuntimeError> {
    match recv {
        Cell::Str(s) => str_method(s, name, args),
        Cell::Object(map) => object_method(map, name, args),
        _ => Err(RuntimeError::new("Bad method name")),
    }
}

fn str_method(s: String, name: &str, args: Vec<Cell>) -> Result<(Cell, Cell), RuntimeError> {
    match name {
        "substr" => {
            if args.is_empty() || args.len() > 2 {
                return Err(arity_error(name));
            }
            let out = str_substr(&s, &args);
            Ok((Cell::Str(out), Cell::Str(s)))
        }
        "split" => {
            if args.len() != 1 {
                return Err(arity_error(name));
            }
            let sep = args[0].to_text();
            let mut parts = IndexMap::new();
            if !sep.is_empty() {
                for (i, piece) in s.split(sep.as_str()).enumerate() {
                    parts.insert(i.to_string(), Cell::Str(piece.to_string()));
                }
            }
            Ok((Cell::Object(parts), Cell::Str(s)))
        }
        _ => Err(RuntimeError::new("Bad method name")),
    }
}

/// `substr(start, len)` over characters. Negative start counts from the
/// end; negative len is an end index counted from the end. Arguments that
/// fail numeric coercion yield the empty string.
fn str_substr(s: &str, args: &[Cell]) -> String {
    let Ok(start) = args[0].to_int() else {
        return String::new();
    };
    let len_arg = match args.get(1) {
        Some(cell) => match cell.to_int() {
            Ok(v) => v,
            Err(_) => return String::new(),
        },
        None => 0,
    };
    let n = s.chars().count() as i64;
    let mut a = i64::from(start as i32);
    if a < 0 {
        a += n;
    }
    if a < 0 {
        a = 0;
    }
    let mut b = i64::from(len_arg as i32);
    if b < 0 {
        b += n;
        if b < 0 {
            b = 0;
        }
    } else {
        b += a;
    }
    if b < a {
        return String::new();
    }
    let a = a.min(n) as usize;
    let b = b.min(n) as usize;
    s.chars().skip(a).take(b - a).collect()
}

fn object_method(
    map: IndexMap<String, Cell>,
    name: &str,
    mut args: Vec<Cell>,
) -> Result<(Cell, Cell), RuntimeError> {
    match name {
        "slice" => {
            if args.is_empty() || args.len() > 2 {
                return Err(arity_error(name));
            }
            let (arr, _) = normalize(map.clone());
            let len = arr.len() as i64;
            let mut a = i64::from(args[0].to_int()? as i32);
            let mut b = match args.get(1) {
                Some(cell) => i64::from(cell.to_int()? as i32),
                None => len,
            };
            if a < 0 {
                a += len;
            }
            if a < 0 {
                a = 0;
            }
            if b < 0 {
                b += len;
            }
            if b < 0 {
                b = 0;
            }
            let a = a.min(len) as usize;
            let b = b.min(len) as usize;
            let taken = if b > a { arr[a..b].to_vec() } else { Vec::new() };
            Ok((
                Cell::Object(rebuild(taken, Vec::new())),
                Cell::Object(map),
            ))
        }
        "push" => {
            if args.len() != 1 {
                return Err(arity_error(name));
            }
            let value = args.remove(0);
            let next = map
                .keys()
                .filter_map(|key| {
                    if is_numeric_key(key) {
                        key.parse::<i64>().ok()
                    } else {
                        None
                    }
                })
                .max()
                .map_or(0, |m| m + 1);
            let mut updated = map;
            updated.insert(next.to_string(), value);
            Ok((Cell::Null, Cell::Object(updated)))
        }
        "pop" => {
            if !args.is_empty() {
                return Err(arity_error(name));
            }
            let mut updated = map;
            match updated.pop() {
                Some((_, value)) => Ok((value, Cell::Object(updated))),
                None => Ok((Cell::Null, Cell::Object(updated))),
            }
        }
        "shift" => {
            if !args.is_empty() {
                return Err(arity_error(name));
            }
            let (mut arr, rest) = normalize(map);
            if arr.is_empty() {
                return Ok((Cell::Null, Cell::Object(rebuild(arr, rest))));
            }
            let first = arr.remove(0);
            Ok((first, Cell::Object(rebuild(arr, rest))))
        }
        "unshift" => {
            if args.len() != 1 {
                return Err(arity_error(name));
            }
            let value = args.remove(0);
            let (mut arr, rest) = normalize(map);
            arr.insert(0, value);
            Ok((Cell::Null, Cell::Object(rebuild(arr, rest))))
        }
        "splice" => {
            if args.len() < 2 {
                return Err(arity_error(name));
            }
            let inserted = args.split_off(2);
            let (mut arr, rest) = normalize(map);
            let len = arr.len() as i64;
            let start = i64::from(args[0].to_int()? as i32).clamp(0, len) as usize;
            let count =
                i64::from(args[1].to_int()? as i32).clamp(0, len - start as i64) as usize;
            let tail = arr.split_off(start + count);
            arr.truncate(start);
            arr.extend(inserted);
            arr.extend(tail);
            Ok((Cell::Null, Cell::Object(rebuild(arr, rest))))
        }
        _ => Err(RuntimeError::new("Bad method name")),
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Instr {
    PushConst(Literal),
    Pop,
    PopN(usize),
    /// Copy the slot onto the top of the stack.
    Load(usize),
    /// Copy the top of the stack into the slot; the top stays.
    Store(usize),
    /// Reset the slot to null.
    Clear(usize),
    Jump(usize),
    /// Pop the condition; jump when it is falsy.
    JumpIfFalse(usize),
    /// Short-circuit `&&`: jump keeping the operand when it is falsy,
    /// otherwise pop it and fall through to the right-hand side.
    JumpAnd(usize),
    /// Short-circuit `||`: jump keeping the operand when it is truthy.
    JumpOr(usize),
    Binary(BinOp),
    Unary(UnOp),
    Builtin(BuiltinFn),
    MakeArray(usize),
    MakeObject(Vec<String>),
    Index,
    AttrGet(String),
    AttrSet(String),
    AttrDel(String),
    AttrFilter(String),
    /// Pop an updated object and write it back to where it was read from.
    Update,
    MethodCall {
        name: String,
        argc: usize,
    },
    ApiCall(String),
    Return,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub instrs: Vec<Instr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondKind {
    IfFalse,
    And,
    Or,
}

/// Flat compilation events. Jump events pair up with label events in
/// strict LIFO order; scope events drive slot assignment.
#[derive(Debug, Clone)]
enum Emit {
    Enter,
    Leave,
    Goto,
    Label,
    CondGoto(CondKind),
    CondLabel,
    ComeFrom,
    ComeFromLabel,
    DeclVar(String),
    PopVar(String),
    SetVar { name: String, pos: Pos },
    GetVar { name: String, pos: Pos },
    DelVar { name: String, pos: Pos },
    Code(Instr),
}

enum Step {
    Recur(NodeId),
    Emit(Emit),
}

fn emit(e: Emit) -> Step {
    Step::Emit(e)
}

fn code(instr: Instr) -> Step {
    Step::Emit(Emit::Code(instr))
}

/// Expands one node into its child visits and emissions, in source order.
fn node_steps(ast: &Ast, id: NodeId) -> Result<Vec<Step>, SyntaxError> {
    let mut steps = Vec::new();
    match ast.node(id) {
        Node::Block { stmts, scoped } => {
            if *scoped {
                steps.push(emit(Emit::Enter));
            }
            steps.extend(stmts.iter().map(|stmt| Step::Recur(*stmt)));
            if *scoped {
                steps.push(emit(Emit::Leave));
            }
        }
        Node::If { cond, body, els } => {
            steps.push(Step::Recur(*cond));
            steps.push(emit(Emit::CondGoto(CondKind::IfFalse)));
            steps.push(emit(Emit::Enter));
            steps.extend(body.iter().map(|stmt| Step::Recur(*stmt)));
            steps.push(emit(Emit::Leave));
            match els {
                Some(else_body) => {
                    steps.push(emit(Emit::Goto));
                    steps.push(emit(Emit::CondLabel));
                    steps.push(emit(Emit::Enter));
                    steps.extend(else_body.iter().map(|stmt| Step::Recur(*stmt)));
                    steps.push(emit(Emit::Leave));
                    steps.push(emit(Emit::Label));
                }
                None => steps.push(emit(Emit::CondLabel)),
            }
        }
        Node::While { cond, body } => {
            steps.push(emit(Emit::ComeFrom));
            steps.push(Step::Recur(*cond));
            steps.push(emit(Emit::CondGoto(CondKind::IfFalse)));
            steps.push(emit(Emit::Enter));
            steps.extend(body.iter().map(|stmt| Step::Recur(*stmt)));
            steps.push(emit(Emit::Leave));
            steps.push(emit(Emit::ComeFromLabel));
            steps.push(emit(Emit::CondLabel));
        }
        Node::VarDecl { decls } => {
            for decl in decls {
                match decl.init {
                    Some(init) => {
                        steps.push(Step::Recur(init));
                        steps.push(emit(Emit::PopVar(decl.name.clone())));
                    }
                    None => steps.push(emit(Emit::DeclVar(decl.name.clone()))),
                }
            }
        }
        Node::Delete { target, pos } => match ast.node(*target) {
            Node::AttrGet { recv, name } => {
                steps.push(Step::Recur(*recv));
                steps.push(code(Instr::AttrDel(name.clone())));
                steps.push(code(Instr::Update));
            }
            Node::Var { name, pos } => steps.push(emit(Emit::DelVar {
                name: name.clone(),
                pos: *pos,
            })),
            _ => return Err(SyntaxError::at("expected identifier", *pos)),
        },
        Node::Return { value } => {
            steps.push(Step::Recur(*value));
            steps.push(code(Instr::Return));
        }
        Node::DropExpr { expr } => {
            steps.push(Step::Recur(*expr));
            steps.push(code(Instr::Pop));
        }
        Node::Assign { target, value, pos } => match ast.node(*target) {
            Node::AttrGet { recv, name } => {
                steps.push(Step::Recur(*recv));
                steps.push(Step::Recur(*value));
                steps.push(code(Instr::AttrSet(name.clone())));
                steps.push(code(Instr::Update));
            }
            Node::Var { name, pos } => {
                steps.push(Step::Recur(*value));
                steps.push(emit(Emit::SetVar {
                    name: name.clone(),
                    pos: *pos,
                }));
            }
            _ => return Err(SyntaxError::at("non-variable in assignment", *pos)),
        },
        Node::Ternary { cond, then, els } => {
            steps.push(Step::Recur(*cond));
            steps.push(emit(Emit::CondGoto(CondKind::IfFalse)));
            steps.push(Step::Recur(*then));
            steps.push(emit(Emit::Goto));
            steps.push(emit(Emit::CondLabel));
            steps.push(Step::Recur(*els));
            steps.push(emit(Emit::Label));
        }
        Node::Logic { op, lhs, rhs } => {
            let kind = match op {
                LogicOp::And => CondKind::And,
                LogicOp::Or => CondKind::Or,
            };
            steps.push(Step::Recur(*lhs));
            steps.push(emit(Emit::CondGoto(kind)));
            steps.push(Step::Recur(*rhs));
            steps.push(emit(Emit::CondLabel));
        }
        Node::Binary { op, lhs, rhs } => {
            steps.push(Step::Recur(*lhs));
            steps.push(Step::Recur(*rhs));
            steps.push(code(Instr::Binary(*op)));
        }
        Node::Unary { op, expr } => {
            steps.push(Step::Recur(*expr));
            steps.push(code(Instr::Unary(*op)));
        }
        Node::Literal(lit) => steps.push(code(Instr::PushConst(lit.clone()))),
        Node::Var { name, pos } => steps.push(emit(Emit::GetVar {
            name: name.clone(),
            pos: *pos,
        })),
        Node::Array { items } => {
            steps.extend(items.iter().map(|item| Step::Recur(*item)));
            steps.push(code(Instr::MakeArray(items.len())));
        }
        Node::Object { keys, values } => {
            steps.extend(values.iter().map(|value| Step::Recur(*value)));
            steps.push(code(Instr::MakeObject(keys.clone())));
        }
        Node::ApiCall { method, arg } => {
            match arg {
                Some(arg) => steps.push(Step::Recur(*arg)),
                None => steps.push(code(Instr::MakeObject(Vec::new()))),
            }
            steps.push(code(Instr::ApiCall(method.clone())));
        }
        Node::Builtin { func, arg } => {
            steps.push(Step::Recur(*arg));
            steps.push(code(Instr::Builtin(*func)));
        }
        Node::MethodCall { recv, name, args } => {
            steps.push(Step::Recur(*recv));
            steps.extend(args.iter().map(|arg| Step::Recur(*arg)));
            steps.push(code(Instr::MethodCall {
                name: name.clone(),
                argc: args.len(),
            }));
            steps.push(code(Instr::Update));
        }
        Node::Index { recv, index } => {
            steps.push(Step::Recur(*recv));
            steps.push(Step::Recur(*index));
            steps.push(code(Instr::Index));
        }
        Node::AttrGet { recv, name } => {
            steps.push(Step::Recur(*recv));
            steps.push(code(Instr::AttrGet(name.clone())));
        }
        Node::AttrFilter { recv, name } => {
            steps.push(Step::Recur(*recv));
            steps.push(code(Instr::AttrFilter(name.clone())));
        }
    }
    Ok(steps)
}

/// Phase one: flattens the tree into an event stream with an explicit work
/// stack, so nesting depth never touches the call stack.
fn precompile(ast: &Ast) -> Result<Vec<Emit>, SyntaxError> {
    let mut out = Vec::new();
    let mut first = node_steps(ast, ast.root)?;
    first.reverse();
    let mut work = vec![first];
    while let Some(top) = work.last_mut() {
        let Some(step) = top.pop() else {
            work.pop();
            continue;
        };
        match step {
            Step::Recur(id) => {
                let mut steps = node_steps(ast, id)?;
                steps.reverse();
                work.push(steps);
            }
            Step::Emit(e) => out.push(e),
        }
    }
    Ok(out)
}

struct Scope {
    slots: HashMap<String, usize>,
    declared: HashSet<String>,
    next: usize,
}

fn current(scopes: &mut Vec<Scope>) -> &mut Scope {
    let Some(scope) = scopes.last_mut() else {
        unreachable!("scope stack never empties");
    };
    scope
}

fn declare(scope: &mut Scope, name: String) -> usize {
    let slot = scope.next;
    scope.next += 1;
    scope.slots.insert(name.clone(), slot);
    scope.declared.insert(name);
    slot
}

fn resolve(scopes: &[Scope], name: &str, pos: Pos) -> Result<usize, SyntaxError> {
    scopes
        .last()
        .and_then(|scope| scope.slots.get(name))
        .copied()
        .ok_or_else(|| SyntaxError::at(format!("undefined variable `{name}'"), pos))
}

/// Phase two: resolves variables to stack slots and pairs every jump with
/// its label. Slot 0 always holds the script argument, visible as `Args`.
pub fn compile_ast(ast: &Ast) -> Result<Program, SyntaxError> {
    let emits = precompile(ast)?;
    let mut instrs: Vec<Instr> = Vec::new();
    let mut gotos: Vec<usize> = Vec::new();
    let mut cond_gotos: Vec<(usize, CondKind)> = Vec::new();
    let mut comefroms: Vec<usize> = Vec::new();
    let mut scopes = vec![Scope {
        slots: HashMap::from([("Args".to_string(), 0)]),
        declared: HashSet::from(["Args".to_string()]),
        next: 1,
    }];
    for event in emits {
        match event {
            Emit::Enter => {
                let parent = current(&mut scopes);
                let child = Scope {
                    slots: parent.slots.clone(),
                    declared: HashSet::new(),
                    next: parent.next,
                };
                scopes.push(child);
            }
            Emit::Leave => {
                let Some(scope) = scopes.pop() else {
                    unreachable!("unbalanced scope events");
                };
                if !scope.declared.is_empty() {
                    instrs.push(Instr::PopN(scope.declared.len()));
                }
            }
            Emit::Goto => {
                gotos.push(instrs.len());
                instrs.push(Instr::Jump(usize::MAX));
            }
            Emit::Label => {
                let Some(at) = gotos.pop() else {
                    unreachable!("unbalanced jump events");
                };
                instrs[at] = Instr::Jump(instrs.len());
            }
            Emit::CondGoto(kind) => {
                cond_gotos.push((instrs.len(), kind));
                instrs.push(Instr::Jump(usize::MAX));
            }
            Emit::CondLabel => {
                let Some((at, kind)) = cond_gotos.pop() else {
                    unreachable!("unbalanced jump events");
                };
                let target = instrs.len();
                instrs[at] = match kind {
                    CondKind::IfFalse => Instr::JumpIfFalse(target),
                    CondKind::And => Instr::JumpAnd(target),
                    CondKind::Or => Instr::JumpOr(target),
                };
            }
            Emit::ComeFrom => comefroms.push(instrs.len()),
            Emit::ComeFromLabel => {
                let Some(target) = comefroms.pop() else {
                    unreachable!("unbalanced jump events");
                };
                instrs.push(Instr::Jump(target));
            }
            Emit::DeclVar(name) => {
                let scope = current(&mut scopes);
                if !scope.declared.contains(&name) {
                    instrs.push(Instr::PushConst(Literal::Null));
                    declare(scope, name);
                }
            }
            Emit::PopVar(name) => {
                let scope = current(&mut scopes);
                match scope.slots.get(&name).copied() {
                    Some(slot) if scope.declared.contains(&name) => {
                        instrs.push(Instr::Store(slot));
                        instrs.push(Instr::Pop);
                    }
                    // First declaration adopts the value already on the
                    // stack as the new slot.
                    _ => {
                        declare(scope, name);
                    }
                }
            }
            Emit::SetVar { name, pos } => {
                let slot = resolve(&scopes, &name, pos)?;
                instrs.push(Instr::Store(slot));
            }
            Emit::GetVar { name, pos } => {
                let slot = resolve(&scopes, &name, pos)?;
                instrs.push(Instr::Load(slot));
            }
            Emit::DelVar { name, pos } => {
                let slot = resolve(&scopes, &name, pos)?;
                instrs.push(Instr::Clear(slot));
            }
            Emit::Code(instr) => instrs.push(instr),
        }
    }
    instrs.push(Instr::PushConst(Literal::Null));
    instrs.push(Instr::Return);
    Ok(Program { instrs })
}

pub fn compile(source: &str) -> Result<Program, SyntaxError> {
    compile_ast(&vks_parser::parse(source)?)
}

/// Host hook behind `API.method(arg)` calls.
pub trait ApiHandler {
    fn call(&mut self, method: &str, args: Value) -> Result<Value, RuntimeError>;
}

impl<F> ApiHandler for F
where
    F: FnMut(&str, Value) -> Result<Value, RuntimeError>,
{
    fn call(&mut self, method: &str, args: Value) -> Result<Value, RuntimeError> {
        self(method, args)
    }
}

/// Where a copied object came from: a stack slot plus the chain of keys
/// followed from it. `Update` retraces the chain to write a mutated copy
/// back into the live slot.
#[derive(Debug, Clone)]
struct Origin {
    slot: usize,
    path: Vec<String>,
}

struct StackValue {
    cell: Cell,
    origin: Option<Origin>,
}

fn plain(cell: Cell) -> StackValue {
    StackValue { cell, origin: None }
}

fn underflow() -> RuntimeError {
    RuntimeError::new("stack underflow")
}

fn pop(stack: &mut Vec<StackValue>) -> Result<StackValue, RuntimeError> {
    stack.pop().ok_or_else(underflow)
}

fn take_last(stack: &mut Vec<StackValue>, n: usize) -> Result<Vec<StackValue>, RuntimeError> {
    if stack.len() < n {
        return Err(underflow());
    }
    Ok(stack.split_off(stack.len() - n))
}

/// Origins are only tracked for objects; nothing else is ever written
/// back.
fn child_origin(parent: &Option<Origin>, key: &str, cell: &Cell) -> Option<Origin> {
    if !matches!(cell, Cell::Object(_)) {
        return None;
    }
    parent.clone().map(|mut origin| {
        origin.path.push(key.to_string());
        origin
    })
}

/// Follows the origin chain from the slot and installs the updated cell.
/// A chain broken by an intermediate overwrite is dropped silently.
fn write_back(stack: &mut [StackValue], origin: &Origin, cell: Cell) {
    let Some(entry) = stack.get_mut(origin.slot) else {
        return;
    };
    let Some((last, mid)) = origin.path.split_last() else {
        entry.cell = cell;
        return;
    };
    let mut cursor = &mut entry.cell;
    for key in mid {
        let Cell::Object(map) = cursor else {
            return;
        };
        let Some(next) = map.get_mut(key) else {
            return;
        };
        cursor = next;
    }
    let Cell::Object(map) = cursor else {
        return;
    };
    map.insert(last.clone(), cell);
}

pub struct Vm {
    api: Option<Box<dyn ApiHandler>>,
}

impl Vm {
    pub fn new() -> Self {
        Self { api: None }
    }

    pub fn with_api(api: impl ApiHandler + 'static) -> Self {
        Self {
            api: Some(Box::new(api)),
        }
    }

    /// Runs a compiled program. `args` becomes slot 0, visible to the
    /// script as `Args`.
    pub fn run(&mut self, program: &Program, args: Value) -> Result<Value, RuntimeError> {
        let mut stack = vec![plain(value_to_cell(&args))];
        let mut pc = 0usize;
        let mut ticks = 0usize;
        loop {
            if ticks >= OP_BUDGET {
                return Err(RuntimeError::new("Too many operations"));
            }
            ticks += 1;
            let Some(instr) = program.instrs.get(pc) else {
                return Err(RuntimeError::new("instruction pointer out of range"));
            };
            match instr {
                Instr::PushConst(lit) => stack.push(plain(literal_cell(lit))),
                Instr::Pop => {
                    pop(&mut stack)?;
                }
                Instr::PopN(n) => {
                    if stack.len() < *n {
                        return Err(underflow());
                    }
                    stack.truncate(stack.len() - n);
                }
                Instr::Load(slot) => {
                    let Some(entry) = stack.get(*slot) else {
                        return Err(underflow());
                    };
                    let cell = entry.cell.clone();
                    let origin = matches!(cell, Cell::Object(_)).then(|| Origin {
                        slot: *slot,
                        path: Vec::new(),
                    });
                    stack.push(StackValue { cell, origin });
                }
                Instr::Store(slot) => {
                    let Some(top) = stack.last() else {
                        return Err(underflow());
                    };
                    let cell = top.cell.clone();
                    let Some(entry) = stack.get_mut(*slot) else {
                        return Err(underflow());
                    };
                    *entry = plain(cell);
                }
                Instr::Clear(slot) => {
                    let Some(entry) = stack.get_mut(*slot) else {
                        return Err(underflow());
                    };
                    *entry = plain(Cell::Null);
                }
                Instr::Jump(target) => {
                    pc = *target;
                    continue;
                }
                Instr::JumpIfFalse(target) => {
                    let cond = pop(&mut stack)?;
                    if !cond.cell.truthy() {
                        pc = *target;
                        continue;
                    }
                }
                Instr::JumpAnd(target) => {
                    let Some(top) = stack.last() else {
                        return Err(underflow());
                    };
                    if !top.cell.truthy() {
                        pc = *target;
                        continue;
                    }
                    stack.pop();
                }
                Instr::JumpOr(target) => {
                    let Some(top) = stack.last() else {
                        return Err(underflow());
                    };
                    if top.cell.truthy() {
                        pc = *target;
                        continue;
                    }
                    stack.pop();
                }
                Instr::Binary(op) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(plain(binary(*op, lhs.cell, rhs.cell)?));
                }
                Instr::Unary(op) => {
                    let value = pop(&mut stack)?;
                    stack.push(plain(unary(*op, value.cell)?));
                }
                Instr::Builtin(func) => {
                    let value = pop(&mut stack)?;
                    stack.push(plain(builtin_parse(*func, &value.cell)));
                }
                Instr::MakeArray(n) => {
                    let items = take_last(&mut stack, *n)?;
                    let map = items
                        .into_iter()
                        .enumerate()
                        .map(|(i, sv)| (i.to_string(), sv.cell))
                        .collect();
                    stack.push(plain(Cell::Object(map)));
                }
                Instr::MakeObject(keys) => {
                    let values = take_last(&mut stack, keys.len())?;
                    let mut map = IndexMap::new();
                    for (key, sv) in keys.iter().zip(values) {
                        map.insert(key.clone(), sv.cell);
                    }
                    stack.push(plain(Cell::Object(map)));
                }
                Instr::Index => {
                    let index = pop(&mut stack)?;
                    let recv = pop(&mut stack)?;
                    let key = index.cell.to_text();
                    let value = get_item(&recv.cell, &key);
                    let origin = child_origin(&recv.origin, &key, &value);
                    stack.push(StackValue {
                        cell: value,
                        origin,
                    });
                }
                Instr::AttrGet(name) => {
                    let recv = pop(&mut stack)?;
                    let value = get_attr(&recv.cell, name);
                    let origin = child_origin(&recv.origin, name, &value);
                    stack.push(StackValue {
                        cell: value,
                        origin,
                    });
                }
                Instr::AttrSet(name) => {
                    let value = pop(&mut stack)?;
                    let recv = pop(&mut stack)?;
                    let updated = set_attr(&recv.cell, name, value.cell.clone())?;
                    let value_origin = child_origin(&recv.origin, name, &value.cell);
                    stack.push(StackValue {
                        cell: value.cell,
                        origin: value_origin,
                    });
                    stack.push(StackValue {
                        cell: updated,
                        origin: recv.origin,
                    });
                }
                Instr::AttrDel(name) => {
                    let recv = pop(&mut stack)?;
                    let updated = del_attr(&recv.cell, name)?;
                    stack.push(StackValue {
                        cell: updated,
                        origin: recv.origin,
                    });
                }
                Instr::AttrFilter(name) => {
                    let recv = pop(&mut stack)?;
                    stack.push(plain(attr_filter(&recv.cell, name)));
                }
                Instr::Update => {
                    let sv = pop(&mut stack)?;
                    if let Some(origin) = sv.origin {
                        if matches!(sv.cell, Cell::Object(_)) {
                            write_back(&mut stack, &origin, sv.cell);
                        }
                    }
                }
                Instr::MethodCall { name, argc } => {
                    let arg_values = take_last(&mut stack, *argc)?;
                    let recv = pop(&mut stack)?;
                    let cells = arg_values.into_iter().map(|sv| sv.cell).collect();
                    let (result, updated) = call_method(recv.cell, name, cells)?;
                    stack.push(plain(result));
                    stack.push(StackValue {
                        cell: updated,
                        origin: recv.origin,
                    });
                }
                Instr::ApiCall(method) => {
                    let arg = pop(&mut stack)?;
                    let Some(api) = self.api.as_mut() else {
                        return Err(RuntimeError::new("No API!"));
                    };
                    let result = api.call(method, cell_to_value(&arg.cell))?;
                    stack.push(plain(value_to_cell(&result)));
                }
                Instr::Return => {
                    let value = pop(&mut stack)?;
                    return Ok(cell_to_value(&value.cell));
                }
            }
            pc += 1;
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn literal_cell(lit: &Literal) -> Cell {
    match lit {
        Literal::Null => Cell::Null,
        Literal::Int(n) => Cell::Int(*n),
        Literal::Float(d) => Cell::Float(*d),
        Literal::Str(s) => Cell::Str(s.clone()),
    }
}

/// Compiles and runs a script in one call.
pub fn eval(
    source: &str,
    args: Value,
    api: impl ApiHandler + 'static,
) -> Result<Value, Error> {
    let program = compile(source)?;
    let mut vm = Vm::with_api(api);
    Ok(vm.run(&program, args)?)
}

#[cfg(test)]
mod tests {
    use super::{compile, eval, Error, Instr, Program, RuntimeError, Value, Vm};
    use std::cell::RefCell;
    use std::rc::Rc;
    use vks_syntax::Literal;

    fn run_with(source: &str, args: Value) -> Value {
        let program = compile(source).expect("compile");
        Vm::new().run(&program, args).expect("run")
    }

    fn run_src(source: &str) -> Value {
        run_with(source, Value::Null)
    }

    fn run_err(source: &str) -> String {
        let program = compile(source).expect("compile");
        Vm::new()
            .run(&program, Value::Null)
            .expect_err("expected runtime error")
            .message
    }

    fn compile_err(source: &str) -> String {
        compile(source).expect_err("expected compile error").message
    }

    fn record(entries: &[(&str, Value)]) -> Value {
        Value::Record(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        )
    }

    #[test]
    fn compiles_return_constant() {
        let program = compile("return 1;").expect("compile");
        assert_eq!(
            program.instrs,
            vec![
                Instr::PushConst(Literal::Int(1)),
                Instr::Return,
                Instr::PushConst(Literal::Null),
                Instr::Return,
            ]
        );
    }

    #[test]
    fn compilation_is_deterministic() {
        let source = "var a = {x: 1}; var b = 0; while (b < 3) { a.x = a.x + b; b = b + 1; } return a;";
        let first = compile(source).expect("compile");
        let second = compile(source).expect("compile");
        assert_eq!(first, second);
    }

    #[test]
    fn program_round_trips_through_json() {
        let program = compile("var a = [1, 2]; a.push(3); return a@.x;").expect("compile");
        let text = serde_json::to_string(&program).expect("serialize");
        let back: Program = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(program, back);
    }

    #[test]
    fn undefined_variable_is_compile_error() {
        assert_eq!(compile_err("return y;"), "undefined variable `y'");
        assert_eq!(compile_err("x = 1;"), "undefined variable `x'");
    }

    #[test]
    fn inner_scope_variable_not_visible_outside() {
        let message = compile_err("var x = 1; { var y = 2; } return y;");
        assert_eq!(message, "undefined variable `y'");
    }

    #[test]
    fn delete_requires_variable_or_attribute() {
        assert_eq!(compile_err("delete 1 + 2;"), "expected identifier");
    }

    #[test]
    fn empty_program_returns_null() {
        assert_eq!(run_src(""), Value::Null);
    }

    #[test]
    fn while_loop_counts() {
        let out = run_src("var i = 0; while (i < 5) i = i + 1; return i;");
        assert_eq!(out, Value::Int(5));
    }

    #[test]
    fn args_fields_add() {
        let args = record(&[("a", Value::Int(2)), ("b", Value::Int(3))]);
        assert_eq!(run_with("return Args.a + Args.b;", args), Value::Int(5));
    }

    #[test]
    fn object_field_write_and_read() {
        let out = run_src("var o = {}; o.x = 1; return o.x;");
        assert_eq!(out, Value::Int(1));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            run_src("return \"ab\" + \"cd\";"),
            Value::String("abcd".to_string())
        );
    }

    #[test]
    fn splice_removes_middle_element() {
        let out = run_src("var a = [1, 2, 3]; a.splice(1, 1); return a;");
        assert_eq!(out, Value::Array(vec![Value::Int(1), Value::Int(3)]));
    }

    #[test]
    fn api_callback_receives_method_and_args() {
        let seen: Rc<RefCell<Vec<(String, Value)>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let mut vm = Vm::with_api(move |method: &str, args: Value| {
            log.borrow_mut().push((method.to_string(), args));
            Ok(Value::Int(42))
        });
        let program = compile("return API.foo({});").expect("compile");
        let out = vm.run(&program, Value::Null).expect("run");
        assert_eq!(out, Value::Int(42));
        assert_eq!(
            *seen.borrow(),
            vec![("foo".to_string(), Value::Array(Vec::new()))]
        );
    }

    #[test]
    fn api_call_without_argument_passes_empty_object() {
        let mut vm = Vm::with_api(|_: &str, args: Value| {
            assert_eq!(args, Value::Array(Vec::new()));
            Ok(Value::Null)
        });
        let program = compile("return API.ping();").expect("compile");
        assert_eq!(vm.run(&program, Value::Null).expect("run"), Value::Null);
    }

    #[test]
    fn missing_api_reports_error() {
        assert_eq!(run_err("return API.foo();"), "No API!");
    }

    #[test]
    fn api_error_propagates() {
        let mut vm = Vm::with_api(|_: &str, _: Value| {
            Err(RuntimeError::new("backend unavailable"))
        });
        let program = compile("return API.foo();").expect("compile");
        let err = vm.run(&program, Value::Null).expect_err("expected error");
        assert_eq!(err.message, "backend unavailable");
    }

    #[test]
    fn argument_round_trips_unchanged() {
        let args = record(&[
            ("items", Value::Array(vec![Value::Int(1), Value::String("x".to_string())])),
            ("empty", Value::Array(Vec::new())),
            ("flag", Value::Bool(true)),
            ("none", Value::Null),
        ]);
        assert_eq!(run_with("return Args;", args.clone()), args);
    }

    #[test]
    fn block_scope_shadows_and_restores() {
        let out = run_src("var x = 1; { var x = 2; } return x;");
        assert_eq!(out, Value::Int(1));
    }

    #[test]
    fn nested_attribute_write_propagates() {
        let out = run_src("var a = {b: {c: 1}}; a.b.c = 2; return a.b.c;");
        assert_eq!(out, Value::Int(2));
    }

    #[test]
    fn attribute_copy_does_not_alias() {
        let out = run_src("var a = {b: {c: 1}}; var d = a.b; a.b.c = 2; return d.c;");
        assert_eq!(out, Value::Int(1));
    }

    #[test]
    fn and_short_circuits() {
        assert_eq!(run_src("return 0 && 1 / 0;"), Value::Int(0));
    }

    #[test]
    fn or_short_circuits() {
        assert_eq!(run_src("return 1 || 1 / 0;"), Value::Int(1));
    }

    #[test]
    fn integer_addition_wraps() {
        assert_eq!(run_src("return 2147483647 + 1 < 0;"), Value::Bool(true));
    }

    #[test]
    fn runaway_loop_hits_budget() {
        assert_eq!(run_err("while (1) {}"), "Too many operations");
    }

    #[test]
    fn division_by_zero_errors() {
        assert_eq!(run_err("return 1 / 0;"), "Division by zero");
        assert_eq!(run_err("return 1 % 0;"), "Division by zero");
    }

    #[test]
    fn integer_division_truncates() {
        assert_eq!(run_src("return -7 / 2;"), Value::Int(-3));
        assert_eq!(run_src("return -7 % 2;"), Value::Int(-1));
    }

    #[test]
    fn float_division_yields_infinity() {
        match run_src("return 1.0 / 0;") {
            Value::Float(d) => assert!(d.is_infinite() && d > 0.0),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn shift_semantics() {
        assert_eq!(run_src("return 1 << 33;"), Value::Int(0));
        assert_eq!(run_src("return -8 >> 1;"), Value::Int(-4));
        assert_eq!(run_err("return 1 >> -1;"), "negative shift count");
    }

    #[test]
    fn bitwise_invert() {
        assert_eq!(run_src("return ~0;"), Value::Int(-1));
    }

    #[test]
    fn logical_not() {
        assert_eq!(run_src("return !0;"), Value::Bool(true));
        assert_eq!(run_src("return !\"x\";"), Value::Bool(false));
    }

    #[test]
    fn negation_at_runtime() {
        assert_eq!(run_src("var x = 1.5; return -x;"), Value::Float(-1.5));
        assert_eq!(run_src("var n = 3; return -n;"), Value::Int(-3));
    }

    #[test]
    fn comparing_objects_errors() {
        assert_eq!(
            run_err("return {} == {};"),
            "Comparing values of different or unsupported types"
        );
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        assert_eq!(run_src("return \"abc\" < \"abd\";"), Value::Bool(true));
    }

    #[test]
    fn numeric_string_compares_as_number() {
        assert_eq!(run_src("return \"10\" > 9;"), Value::Bool(true));
    }

    #[test]
    fn not_equal_negates_equality() {
        assert_eq!(run_src("return 1 != 2;"), Value::Bool(true));
        assert_eq!(run_src("return 1 != 1;"), Value::Bool(false));
    }

    #[test]
    fn bool_concatenates_as_digit() {
        assert_eq!(
            run_src("return (1 < 2) + 1;"),
            Value::String("11".to_string())
        );
    }

    #[test]
    fn adding_object_to_number_errors() {
        assert_eq!(run_err("return {} + 1;"), "Numeric value is expected");
    }

    #[test]
    fn object_addition_merges_right_wins() {
        let out = run_src("return {a: 1, b: 2} + {b: 3, c: 4};");
        assert_eq!(
            out,
            record(&[
                ("a", Value::Int(1)),
                ("b", Value::Int(3)),
                ("c", Value::Int(4)),
            ])
        );
    }

    #[test]
    fn object_joins_values_in_string_context() {
        assert_eq!(
            run_src("return \"\" + [1, 2];"),
            Value::String("1,2".to_string())
        );
    }

    #[test]
    fn length_attribute() {
        assert_eq!(run_src("return \"abc\".length;"), Value::Int(3));
        assert_eq!(run_src("return [1, 2].length;"), Value::Int(2));
        assert_eq!(run_src("return {length: 9}.length;"), Value::Int(9));
    }

    #[test]
    fn index_uses_computed_key() {
        assert_eq!(
            run_src("var a = [10, 20]; var i = 1; return a[i];"),
            Value::Int(20)
        );
        assert_eq!(
            run_src("var o = {x: 5}; return o[\"x\"];"),
            Value::Int(5)
        );
        assert_eq!(run_src("return \"abc\"[0];"), Value::Null);
    }

    #[test]
    fn delete_attribute_removes_field() {
        let out = run_src("var o = {a: 1, b: 2}; delete o.a; return o;");
        assert_eq!(out, record(&[("b", Value::Int(2))]));
    }

    #[test]
    fn delete_variable_resets_to_null() {
        assert_eq!(run_src("var x = 1; delete x; return x;"), Value::Null);
    }

    #[test]
    fn substr_slices_by_character() {
        assert_eq!(
            run_src("return \"hello\".substr(1, 3);"),
            Value::String("ell".to_string())
        );
        assert_eq!(
            run_src("return \"hello\".substr(1, -1);"),
            Value::String("ell".to_string())
        );
    }

    #[test]
    fn split_on_separator() {
        let out = run_src("return \"a,b\".split(\",\");");
        assert_eq!(
            out,
            Value::Array(vec![
                Value::String("a".to_string()),
                Value::String("b".to_string()),
            ])
        );
        assert_eq!(run_src("return \"ab\".split(\"\");"), Value::Array(Vec::new()));
    }

    #[test]
    fn push_appends_to_array() {
        let out = run_src("var a = [1]; a.push(5); return a;");
        assert_eq!(out, Value::Array(vec![Value::Int(1), Value::Int(5)]));
    }

    #[test]
    fn pop_returns_last_element() {
        assert_eq!(run_src("var a = [1, 2]; return a.pop();"), Value::Int(2));
        assert_eq!(
            run_src("var a = [1, 2]; a.pop(); return a;"),
            Value::Array(vec![Value::Int(1)])
        );
    }

    #[test]
    fn shift_and_unshift_move_the_front() {
        assert_eq!(run_src("var a = [1, 2]; return a.shift();"), Value::Int(1));
        assert_eq!(
            run_src("var a = [2]; a.unshift(1); return a;"),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn slice_accepts_negative_start() {
        let out = run_src("var a = [1, 2, 3, 4]; return a.slice(-2);");
        assert_eq!(out, Value::Array(vec![Value::Int(3), Value::Int(4)]));
    }

    #[test]
    fn attr_filter_collects_fields() {
        let out = run_src("return [{id: 1}, {id: 2}]@.id;");
        assert_eq!(out, Value::Array(vec![Value::Int(1), Value::Int(2)]));
        let sparse = run_src("return [{id: 1}, {}]@.id;");
        assert_eq!(sparse, Value::Array(vec![Value::Int(1), Value::Null]));
    }

    #[test]
    fn unknown_method_errors() {
        assert_eq!(run_err("return [1].sort();"), "Bad method name");
        assert_eq!(run_err("var x = 5; return x.foo();"), "Bad method name");
    }

    #[test]
    fn wrong_method_arity_errors() {
        assert_eq!(
            run_err("return \"a\".substr();"),
            "Bad argument count for method substr"
        );
        assert_eq!(
            run_err("var a = [1]; a.splice(0); return a;"),
            "Bad argument count for method splice"
        );
    }

    #[test]
    fn parse_int_takes_longest_prefix() {
        assert_eq!(run_src("return parseInt(\"12ab\");"), Value::Int(12));
        assert_eq!(run_src("return parseInt(\"x\");"), Value::Int(0));
    }

    #[test]
    fn parse_double_takes_longest_prefix() {
        assert_eq!(run_src("return parseDouble(\"3.5x\");"), Value::Float(3.5));
        assert_eq!(run_src("return parseDouble(\"x\");"), Value::Float(0.0));
    }

    #[test]
    fn ternary_selects_branch() {
        assert_eq!(run_src("return 0 ? 1 : 2;"), Value::Int(2));
        assert_eq!(run_src("return 3 ? 1 : 2;"), Value::Int(1));
    }

    #[test]
    fn if_else_branches() {
        let out = run_src("var x; if (0) x = 1; else x = 2; return x;");
        assert_eq!(out, Value::Int(2));
    }

    #[test]
    fn assignment_is_an_expression() {
        let out = run_src("var x; var y = (x = 5); return y + x;");
        assert_eq!(out, Value::Int(10));
    }

    #[test]
    fn setting_field_on_scalar_errors() {
        assert_eq!(
            run_err("var x = 1; x.a = 2; return x;"),
            "setting field [a] on not array variable"
        );
    }

    #[test]
    fn eval_runs_source_end_to_end() {
        let out = eval(
            "return API.ping(1);",
            Value::Null,
            |method: &str, args: Value| {
                assert_eq!(method, "ping");
                assert_eq!(args, Value::Int(1));
                Ok(Value::String("pong".to_string()))
            },
        )
        .expect("eval");
        assert_eq!(out, Value::String("pong".to_string()));
    }

    #[test]
    fn eval_reports_syntax_errors() {
        let err = eval("return 1", Value::Null, |_: &str, _: Value| Ok(Value::Null))
            .expect_err("expected error");
        match err {
            Error::Syntax(e) => assert!(e.message.contains("expected"), "{}", e.message),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn while_body_locals_stay_balanced() {
        let out = run_src(
            "var i = 0; var s = 0; while (i < 3) { var t = i * 2; s = s + t; i = i + 1; } return s;",
        );
        assert_eq!(out, Value::Int(6));
    }

    #[test]
    fn non_numeric_keys_survive_array_methods() {
        let out = run_src("var a = {0: 1, tag: \"x\", 1: 2}; a.shift(); return a;");
        assert_eq!(
            out,
            record(&[("0", Value::Int(2)), ("tag", Value::String("x".to_string()))])
        );
    }

    #[test]
    fn method_on_expression_result_leaves_source_untouched() {
        let out = run_src("var a = [1, 2]; var b = a.slice(0, 2); b.pop(); return a.length;");
        assert_eq!(out, Value::Int(2));
    }

    #[test]
    fn record_argument_preserves_key_order() {
        let args = record(&[("z", Value::Int(1)), ("a", Value::Int(2))]);
        let out = run_with("return Args;", args);
        match out {
            Value::Record(map) => {
                let keys: Vec<&String> = map.keys().collect();
                assert_eq!(keys, ["z", "a"]);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn mutating_indexed_element_through_method() {
        let out = run_src("var a = [[1]]; a[0].push(2); return a[0].length;");
        assert_eq!(out, Value::Int(2));
    }

    #[test]
    fn unused_map_key_reads_null() {
        assert_eq!(run_src("return {a: 1}.b;"), Value::Null);
    }
}
