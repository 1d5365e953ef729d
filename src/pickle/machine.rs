//! Opcode interpreter for pickle protocols 0 through 5
//!
//! The machine follows the stack semantics of CPython's unpickler but never
//! resolves a global or calls anything: globals become `Node::Global`, calls
//! become `Node::Object`. Every global reference is recorded so the safety
//! scanner can classify it.

use super::heap::{GlobalRef, Heap, Node, NodeId, Object};
use super::numpy::{self, ArrayData, NdArray};
use std::collections::HashMap;
use thiserror::Error;

/// Stream dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Plain,
    /// joblib writes raw array bytes straight after each `NumpyArrayWrapper`
    Joblib,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PickleError {
    #[error("unexpected end of stream at offset {offset}")]
    Truncated { offset: usize },

    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("unsupported opcode {name} at offset {offset}")]
    Unsupported { name: &'static str, offset: usize },

    #[error("stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },

    #[error("missing MARK at offset {offset}")]
    MissingMark { offset: usize },

    #[error("memo key {key} not found at offset {offset}")]
    BadMemo { key: u64, offset: usize },

    #[error("malformed stream at offset {offset}: {message}")]
    Malformed { message: String, offset: usize },

    #[error("object graph exceeds {limit} nodes")]
    TooLarge { limit: usize },
}

/// One observed reference to a global
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalUse {
    pub global: GlobalRef,
    /// Referenced as the callable of REDUCE/NEWOBJ/INST/OBJ
    pub invoked: bool,
    pub offset: usize,
}

/// Result of interpreting one complete pickle
#[derive(Debug)]
pub struct Unpickled {
    pub heap: Heap,
    pub root: NodeId,
    pub globals: Vec<GlobalUse>,
    pub protocol: u8,
    /// Bytes consumed, including the trailing STOP
    pub consumed: usize,
}

/// Interpret a single pickle from the start of `data`
pub fn unpickle(data: &[u8], flavor: Flavor) -> Result<Unpickled, PickleError> {
    let mut machine = Machine::new(data, flavor);
    let root = machine.run()?;
    let consumed = machine.position();
    let protocol = machine.protocol;
    let (heap, globals) = machine.into_parts();
    Ok(Unpickled {
        heap,
        root,
        globals,
        protocol,
        consumed,
    })
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

const MAX_MARK_DEPTH: usize = 10_000;
const MAX_NESTED_PICKLES: usize = 4;

/// Symbolic pickle machine over a borrowed byte slice
pub struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    heap: Heap,
    globals: Vec<GlobalUse>,
    flavor: Flavor,
    protocol: u8,
    depth: usize,
}

/// Per-pickle interpreter registers
#[derive(Default)]
struct Registers {
    stack: Vec<NodeId>,
    metastack: Vec<Vec<NodeId>>,
    memo: HashMap<u64, NodeId>,
}

impl<'a> Machine<'a> {
    pub fn new(data: &'a [u8], flavor: Flavor) -> Self {
        Self {
            data,
            pos: 0,
            heap: Heap::new(),
            globals: Vec::new(),
            flavor,
            protocol: 0,
            depth: 0,
        }
    }

    /// Start a machine at `offset` (used for concatenated pickle streams)
    pub fn at(data: &'a [u8], offset: usize, flavor: Flavor) -> Self {
        let mut machine = Self::new(data, flavor);
        machine.pos = offset.min(data.len());
        machine
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn globals(&self) -> &[GlobalUse] {
        &self.globals
    }

    pub fn into_parts(self) -> (Heap, Vec<GlobalUse>) {
        (self.heap, self.globals)
    }

    /// Run until STOP and return the root node
    pub fn run(&mut self) -> Result<NodeId, PickleError> {
        self.depth += 1;
        if self.depth > MAX_NESTED_PICKLES {
            return Err(self.malformed("too many nested pickles"));
        }
        let mut regs = Registers::default();
        let result = self.run_loop(&mut regs);
        self.depth -= 1;
        result
    }

    fn run_loop(&mut self, regs: &mut Registers) -> Result<NodeId, PickleError> {
        loop {
            let offset = self.pos;
            let opcode = self.read_u8()?;

            match opcode {
                op::PROTO => {
                    self.protocol = self.read_u8()?;
                }
                op::FRAME => {
                    self.read_bytes(8)?;
                }
                op::STOP => {
                    return regs.stack.pop().ok_or(PickleError::StackUnderflow { offset });
                }
                op::MARK => {
                    if regs.metastack.len() >= MAX_MARK_DEPTH {
                        return Err(self.malformed("MARK nesting too deep"));
                    }
                    let stack = std::mem::take(&mut regs.stack);
                    regs.metastack.push(stack);
                }
                op::POP => {
                    if regs.stack.pop().is_none() {
                        self.pop_mark(regs, offset)?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark(regs, offset)?;
                }
                op::DUP => {
                    let top = *regs
                        .stack
                        .last()
                        .ok_or(PickleError::StackUnderflow { offset })?;
                    regs.stack.push(top);
                }

                // Numbers
                op::NONE => self.push(regs, Node::None)?,
                op::NEWTRUE => self.push(regs, Node::Bool(true))?,
                op::NEWFALSE => self.push(regs, Node::Bool(false))?,
                op::BININT => {
                    let v = i32::from_le_bytes(self.read_array::<4>()?);
                    self.push(regs, Node::Int(v as i64))?;
                }
                op::BININT1 => {
                    let v = self.read_u8()?;
                    self.push(regs, Node::Int(v as i64))?;
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.read_array::<2>()?);
                    self.push(regs, Node::Int(v as i64))?;
                }
                op::LONG1 => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    let node = long_from_le(bytes);
                    self.push(regs, node)?;
                }
                op::LONG4 => {
                    let n = i32::from_le_bytes(self.read_array::<4>()?);
                    if n < 0 {
                        return Err(self.malformed("negative LONG4 length"));
                    }
                    let bytes = self.read_bytes(n as usize)?;
                    let node = long_from_le(bytes);
                    self.push(regs, node)?;
                }
                op::INT => {
                    let line = self.read_line()?;
                    let node = match line {
                        b"00" => Node::Bool(false),
                        b"01" => Node::Bool(true),
                        _ => self.parse_text_int(line)?,
                    };
                    self.push(regs, node)?;
                }
                op::LONG => {
                    let line = self.read_line()?;
                    let digits = line.strip_suffix(b"L").unwrap_or(line);
                    let node = self.parse_text_int(digits)?;
                    self.push(regs, node)?;
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.read_array::<8>()?);
                    self.push(regs, Node::Float(v))?;
                }
                op::FLOAT => {
                    let line = self.read_line()?;
                    let v = std::str::from_utf8(line)
                        .ok()
                        .and_then(|s| s.trim().parse::<f64>().ok())
                        .ok_or_else(|| self.malformed("invalid FLOAT literal"))?;
                    self.push(regs, Node::Float(v))?;
                }

                // Strings and bytes
                op::BINUNICODE => {
                    let n = u32::from_le_bytes(self.read_array::<4>()?) as usize;
                    let s = String::from_utf8_lossy(self.read_bytes(n)?).into_owned();
                    self.push(regs, Node::Str(s))?;
                }
                op::SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    let s = String::from_utf8_lossy(self.read_bytes(n)?).into_owned();
                    self.push(regs, Node::Str(s))?;
                }
                op::BINUNICODE8 => {
                    let n = self.read_len_u64()?;
                    let s = String::from_utf8_lossy(self.read_bytes(n)?).into_owned();
                    self.push(regs, Node::Str(s))?;
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    self.push(regs, Node::Str(decode_raw_unicode_escape(line)))?;
                }
                op::STRING => {
                    let line = self.read_line()?;
                    let s = decode_string_repr(line)
                        .ok_or_else(|| self.malformed("STRING argument must be quoted"))?;
                    self.push(regs, Node::Str(s))?;
                }
                op::BINSTRING => {
                    let n = i32::from_le_bytes(self.read_array::<4>()?);
                    if n < 0 {
                        return Err(self.malformed("negative BINSTRING length"));
                    }
                    let s = latin1(self.read_bytes(n as usize)?);
                    self.push(regs, Node::Str(s))?;
                }
                op::SHORT_BINSTRING => {
                    let n = self.read_u8()? as usize;
                    let s = latin1(self.read_bytes(n)?);
                    self.push(regs, Node::Str(s))?;
                }
                op::BINBYTES => {
                    let n = u32::from_le_bytes(self.read_array::<4>()?) as usize;
                    let b = self.read_bytes(n)?.to_vec();
                    self.push(regs, Node::Bytes(b))?;
                }
                op::SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    let b = self.read_bytes(n)?.to_vec();
                    self.push(regs, Node::Bytes(b))?;
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let n = self.read_len_u64()?;
                    let b = self.read_bytes(n)?.to_vec();
                    self.push(regs, Node::Bytes(b))?;
                }

                // Containers
                op::EMPTY_LIST => self.push(regs, Node::List(Vec::new()))?,
                op::EMPTY_DICT => self.push(regs, Node::Dict(Vec::new()))?,
                op::EMPTY_TUPLE => self.push(regs, Node::Tuple(Vec::new()))?,
                op::EMPTY_SET => self.push(regs, Node::Set(Vec::new()))?,
                op::LIST => {
                    let items = self.pop_mark(regs, offset)?;
                    self.push(regs, Node::List(items))?;
                }
                op::TUPLE => {
                    let items = self.pop_mark(regs, offset)?;
                    self.push(regs, Node::Tuple(items))?;
                }
                op::FROZENSET => {
                    let items = self.pop_mark(regs, offset)?;
                    self.push(regs, Node::Set(items))?;
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    if regs.stack.len() < n {
                        return Err(PickleError::StackUnderflow { offset });
                    }
                    let items = regs.stack.split_off(regs.stack.len() - n);
                    self.push(regs, Node::Tuple(items))?;
                }
                op::DICT => {
                    let items = self.pop_mark(regs, offset)?;
                    let pairs = pairs(items, offset)?;
                    self.push(regs, Node::Dict(pairs))?;
                }
                op::APPEND => {
                    let value = pop(regs, offset)?;
                    let target = top(regs, offset)?;
                    self.extend_list(target, vec![value], offset)?;
                }
                op::APPENDS => {
                    let items = self.pop_mark(regs, offset)?;
                    let target = top(regs, offset)?;
                    self.extend_list(target, items, offset)?;
                }
                op::SETITEM => {
                    let value = pop(regs, offset)?;
                    let key = pop(regs, offset)?;
                    let target = top(regs, offset)?;
                    self.extend_dict(target, vec![(key, value)], offset)?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark(regs, offset)?;
                    let target = top(regs, offset)?;
                    let pairs = pairs(items, offset)?;
                    self.extend_dict(target, pairs, offset)?;
                }
                op::ADDITEMS => {
                    let items = self.pop_mark(regs, offset)?;
                    let target = top(regs, offset)?;
                    match self.heap.get_mut(target) {
                        Node::Set(set) => set.extend(items),
                        _ => return Err(self.malformed("ADDITEMS target is not a set")),
                    }
                }

                // Memo
                op::PUT => {
                    let line = self.read_line()?;
                    let key = self.parse_memo_key(line)?;
                    let value = top(regs, offset)?;
                    regs.memo.insert(key, value);
                }
                op::BINPUT => {
                    let key = self.read_u8()? as u64;
                    let value = top(regs, offset)?;
                    regs.memo.insert(key, value);
                }
                op::LONG_BINPUT => {
                    let key = u32::from_le_bytes(self.read_array::<4>()?) as u64;
                    let value = top(regs, offset)?;
                    regs.memo.insert(key, value);
                }
                op::MEMOIZE => {
                    let key = regs.memo.len() as u64;
                    let value = top(regs, offset)?;
                    regs.memo.insert(key, value);
                }
                op::GET => {
                    let line = self.read_line()?;
                    let key = self.parse_memo_key(line)?;
                    self.memo_get(regs, key, offset)?;
                }
                op::BINGET => {
                    let key = self.read_u8()? as u64;
                    self.memo_get(regs, key, offset)?;
                }
                op::LONG_BINGET => {
                    let key = u32::from_le_bytes(self.read_array::<4>()?) as u64;
                    self.memo_get(regs, key, offset)?;
                }

                // Globals and calls
                op::GLOBAL => {
                    let module = latin1(self.read_line()?);
                    let name = latin1(self.read_line()?);
                    let id = self.global(GlobalRef::new(module, name), false, offset)?;
                    regs.stack.push(id);
                }
                op::STACK_GLOBAL => {
                    let name = pop(regs, offset)?;
                    let module = pop(regs, offset)?;
                    let (Some(module), Some(name)) = (self.heap.str(module), self.heap.str(name))
                    else {
                        return Err(self.malformed("STACK_GLOBAL requires str operands"));
                    };
                    let global = GlobalRef::new(module, name);
                    let id = self.global(global, false, offset)?;
                    regs.stack.push(id);
                }
                op::INST => {
                    let module = latin1(self.read_line()?);
                    let name = latin1(self.read_line()?);
                    let args = self.pop_mark(regs, offset)?;
                    let callable = self.global(GlobalRef::new(module, name), false, offset)?;
                    let id = self.invoke(callable, args, None, offset)?;
                    regs.stack.push(id);
                }
                op::OBJ => {
                    let mut items = self.pop_mark(regs, offset)?;
                    if items.is_empty() {
                        return Err(PickleError::StackUnderflow { offset });
                    }
                    let callable = items.remove(0);
                    let id = self.invoke(callable, items, None, offset)?;
                    regs.stack.push(id);
                }
                op::REDUCE => {
                    let args = pop(regs, offset)?;
                    let callable = pop(regs, offset)?;
                    let args = self.tuple_items(args)?;
                    let id = self.invoke(callable, args, None, offset)?;
                    regs.stack.push(id);
                }
                op::NEWOBJ => {
                    let args = pop(regs, offset)?;
                    let cls = pop(regs, offset)?;
                    let args = self.tuple_items(args)?;
                    let id = self.invoke(cls, args, None, offset)?;
                    regs.stack.push(id);
                }
                op::NEWOBJ_EX => {
                    let kwargs = pop(regs, offset)?;
                    let args = pop(regs, offset)?;
                    let cls = pop(regs, offset)?;
                    let args = self.tuple_items(args)?;
                    let id = self.invoke(cls, args, Some(kwargs), offset)?;
                    regs.stack.push(id);
                }
                op::BUILD => {
                    let state = pop(regs, offset)?;
                    let target = top(regs, offset)?;
                    if let Node::Object(object) = self.heap.get_mut(target) {
                        object.state = Some(state);
                    }
                    if self.flavor == Flavor::Joblib && self.is_joblib_wrapper(target) {
                        self.read_joblib_array(target)?;
                    }
                }
                op::PERSID => {
                    let line = self.read_line()?;
                    let pid = self.alloc(Node::Str(latin1(line)))?;
                    self.push(regs, Node::Persistent(pid))?;
                }
                op::BINPERSID => {
                    let pid = pop(regs, offset)?;
                    self.push(regs, Node::Persistent(pid))?;
                }

                op::EXT1 | op::EXT2 | op::EXT4 => {
                    return Err(PickleError::Unsupported {
                        name: "EXT",
                        offset,
                    });
                }
                op::NEXT_BUFFER | op::READONLY_BUFFER => {
                    return Err(PickleError::Unsupported {
                        name: "out-of-band buffer",
                        offset,
                    });
                }
                other => {
                    return Err(PickleError::UnknownOpcode {
                        opcode: other,
                        offset,
                    });
                }
            }
        }
    }

    fn alloc(&mut self, node: Node) -> Result<NodeId, PickleError> {
        self.heap.push(node).ok_or(PickleError::TooLarge {
            limit: super::heap::MAX_NODES,
        })
    }

    fn push(&mut self, regs: &mut Registers, node: Node) -> Result<(), PickleError> {
        let id = self.alloc(node)?;
        regs.stack.push(id);
        Ok(())
    }

    fn global(
        &mut self,
        global: GlobalRef,
        invoked: bool,
        offset: usize,
    ) -> Result<NodeId, PickleError> {
        self.globals.push(GlobalUse {
            global: global.clone(),
            invoked,
            offset,
        });
        self.alloc(Node::Global(global))
    }

    fn invoke(
        &mut self,
        callable: NodeId,
        args: Vec<NodeId>,
        kwargs: Option<NodeId>,
        offset: usize,
    ) -> Result<NodeId, PickleError> {
        if let Some(global) = self.heap.global(callable).cloned() {
            self.globals.push(GlobalUse {
                global,
                invoked: true,
                offset,
            });
        }
        self.alloc(Node::Object(Object {
            callable,
            args,
            kwargs,
            ..Default::default()
        }))
    }

    fn pop_mark(&self, regs: &mut Registers, offset: usize) -> Result<Vec<NodeId>, PickleError> {
        let previous = regs
            .metastack
            .pop()
            .ok_or(PickleError::MissingMark { offset })?;
        Ok(std::mem::replace(&mut regs.stack, previous))
    }

    fn memo_get(&self, regs: &mut Registers, key: u64, offset: usize) -> Result<(), PickleError> {
        let id = *regs
            .memo
            .get(&key)
            .ok_or(PickleError::BadMemo { key, offset })?;
        regs.stack.push(id);
        Ok(())
    }

    fn tuple_items(&self, id: NodeId) -> Result<Vec<NodeId>, PickleError> {
        match self.heap.get(id) {
            Node::Tuple(items) | Node::List(items) => Ok(items.clone()),
            // Protocol 0 streams may pass None as an empty argument tuple
            Node::None => Ok(Vec::new()),
            _ => Err(self.malformed("call arguments are not a tuple")),
        }
    }

    fn extend_list(
        &mut self,
        target: NodeId,
        items: Vec<NodeId>,
        offset: usize,
    ) -> Result<(), PickleError> {
        match self.heap.get_mut(target) {
            Node::List(list) => list.extend(items),
            Node::Object(object) => object.list_items.extend(items),
            _ => {
                return Err(PickleError::Malformed {
                    message: "APPEND target is not list-like".to_string(),
                    offset,
                });
            }
        }
        Ok(())
    }

    fn extend_dict(
        &mut self,
        target: NodeId,
        pairs: Vec<(NodeId, NodeId)>,
        offset: usize,
    ) -> Result<(), PickleError> {
        match self.heap.get_mut(target) {
            Node::Dict(dict) => dict.extend(pairs),
            Node::Object(object) => object.items.extend(pairs),
            _ => {
                return Err(PickleError::Malformed {
                    message: "SETITEM target is not dict-like".to_string(),
                    offset,
                });
            }
        }
        Ok(())
    }

    fn is_joblib_wrapper(&self, id: NodeId) -> bool {
        self.heap
            .class_of(id)
            .is_some_and(|g| g.module.starts_with("joblib") && g.name == "NumpyArrayWrapper")
    }

    /// Consume the array payload that joblib writes after a wrapper's BUILD
    /// and turn the wrapper node into the array it describes.
    fn read_joblib_array(&mut self, wrapper: NodeId) -> Result<(), PickleError> {
        let field = |name: &str| self.heap.attr(wrapper, name);
        let dtype_id = field("dtype").ok_or_else(|| self.malformed("wrapper without dtype"))?;
        let shape_id = field("shape").ok_or_else(|| self.malformed("wrapper without shape"))?;
        let fortran = field("order").and_then(|o| self.heap.str(o)) == Some("F");
        let alignment = field("numpy_array_alignment_bytes")
            .filter(|id| !self.heap.is_none(*id))
            .is_some();

        let dtype = numpy::dtype_from_node(&self.heap, dtype_id)
            .map_err(|message| self.malformed(&message))?;
        let shape: Vec<usize> = self
            .heap
            .seq(shape_id)
            .ok_or_else(|| self.malformed("wrapper shape is not a tuple"))?
            .iter()
            .map(|d| self.heap.int(*d).filter(|v| *v >= 0).map(|v| v as usize))
            .collect::<Option<_>>()
            .ok_or_else(|| self.malformed("wrapper shape has invalid dimensions"))?;

        if dtype.is_object() {
            let nested = self.run()?;
            let node = self.heap.get(nested).clone();
            *self.heap.get_mut(wrapper) = node;
            return Ok(());
        }

        if alignment {
            let padding = self.read_u8()? as usize;
            self.read_bytes(padding)?;
        }

        let count = shape
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))
            .ok_or_else(|| self.malformed("array size overflow"))?;
        let nbytes = count
            .checked_mul(dtype.itemsize)
            .ok_or_else(|| self.malformed("array size overflow"))?;
        let data = self.read_bytes(nbytes)?.to_vec();

        *self.heap.get_mut(wrapper) = Node::Array(NdArray {
            dtype,
            shape,
            fortran,
            data: ArrayData::Raw(data),
        });
        Ok(())
    }

    fn parse_text_int(&self, digits: &[u8]) -> Result<Node, PickleError> {
        let text = std::str::from_utf8(digits)
            .map_err(|_| self.malformed("non-ASCII integer literal"))?
            .trim();
        match text.parse::<i64>() {
            Ok(v) => Ok(Node::Int(v)),
            Err(_) if !text.is_empty() && text.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Node::BigInt(text.as_bytes().to_vec()))
            }
            Err(_) => Err(self.malformed("invalid integer literal")),
        }
    }

    fn parse_memo_key(&self, line: &[u8]) -> Result<u64, PickleError> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| self.malformed("invalid memo key"))
    }

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(PickleError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(PickleError::Truncated { offset: self.pos })?;
        let data: &'a [u8] = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_len_u64(&mut self) -> Result<usize, PickleError> {
        let n = u64::from_le_bytes(self.read_array::<8>()?);
        usize::try_from(n).map_err(|_| PickleError::Truncated { offset: self.pos })
    }

    /// Read up to (not including) the next newline
    fn read_line(&mut self) -> Result<&'a [u8], PickleError> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(PickleError::Truncated { offset: self.pos })?;
        self.pos += len + 1;
        let line = &rest[..len];
        Ok(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn malformed(&self, message: &str) -> PickleError {
        PickleError::Malformed {
            message: message.to_string(),
            offset: self.pos,
        }
    }
}

fn pop(regs: &mut Registers, offset: usize) -> Result<NodeId, PickleError> {
    regs.stack.pop().ok_or(PickleError::StackUnderflow { offset })
}

fn top(regs: &Registers, offset: usize) -> Result<NodeId, PickleError> {
    regs.stack
        .last()
        .copied()
        .ok_or(PickleError::StackUnderflow { offset })
}

fn pairs(items: Vec<NodeId>, offset: usize) -> Result<Vec<(NodeId, NodeId)>, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Malformed {
            message: "odd number of items for dict".to_string(),
            offset,
        });
    }
    Ok(items.chunks_exact(2).map(|kv| (kv[0], kv[1])).collect())
}

fn long_from_le(bytes: &[u8]) -> Node {
    if bytes.is_empty() {
        return Node::Int(0);
    }
    if bytes.len() > 8 {
        return Node::BigInt(bytes.to_vec());
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Node::Int(i64::from_le_bytes(buf))
}

/// Map each byte to the code point of the same value
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}

fn decode_raw_unicode_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let width = match bytes[i + 1] {
                b'u' => 4,
                b'U' => 8,
                _ => 0,
            };
            if width > 0 && i + 2 + width <= bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 2 + width]).ok();
                if let Some(c) = hex
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .and_then(char::from_u32)
                {
                    out.push(c);
                    i += 2 + width;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Decode a protocol-0 `STRING` argument: a quoted Python bytes repr
fn decode_string_repr(line: &[u8]) -> Option<String> {
    if line.len() < 2 {
        return None;
    }
    let quote = line[0];
    if (quote != b'\'' && quote != b'"') || line[line.len() - 1] != quote {
        return None;
    }
    let body = &line[1..line.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] != b'\\' || i + 1 >= body.len() {
            out.push(body[i]);
            i += 1;
            continue;
        }
        match body[i + 1] {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'x' if i + 3 < body.len() => {
                let hex = std::str::from_utf8(&body[i + 2..i + 4]).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 4;
                continue;
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 2;
    }
    Some(latin1(&out))
}
