//! Arena holding the symbolic object graph built by the pickle machine
//!
//! Pickle streams mutate objects after they have been memoized (`BUILD`,
//! `APPEND`, `SETITEM` on a memo'd reference), so values live in an arena
//! and the stack and memo hold indices into it.

use super::numpy::NdArray;

pub type NodeId = usize;

/// Upper bound on nodes a single artifact may allocate
pub const MAX_NODES: usize = 2_000_000;

/// A `module.name` reference produced by `GLOBAL`, `STACK_GLOBAL` or `INST`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalRef {
    pub module: String,
    pub name: String,
}

impl GlobalRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }
}

impl std::fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// The recorded outcome of invoking a callable (`REDUCE`, `NEWOBJ`, `INST`, `OBJ`).
/// Nothing is ever called; the call is kept as data.
#[derive(Debug, Clone, Default)]
pub struct Object {
    pub callable: NodeId,
    pub args: Vec<NodeId>,
    pub kwargs: Option<NodeId>,
    pub state: Option<NodeId>,
    /// Items set on a dict-like object (e.g. `OrderedDict`)
    pub items: Vec<(NodeId, NodeId)>,
    /// Items appended to a list-like object
    pub list_items: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub enum Node {
    None,
    Bool(bool),
    Int(i64),
    /// Integer wider than 64 bits, kept opaque
    BigInt(Vec<u8>),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<NodeId>),
    Tuple(Vec<NodeId>),
    Dict(Vec<(NodeId, NodeId)>),
    Set(Vec<NodeId>),
    Global(GlobalRef),
    Object(Object),
    Persistent(NodeId),
    /// Array materialised from a joblib inline buffer
    Array(NdArray),
}

#[derive(Debug, Default)]
pub struct Heap {
    nodes: Vec<Node>,
}

impl Heap {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn push(&mut self, node: Node) -> Option<NodeId> {
        if self.nodes.len() >= MAX_NODES {
            return None;
        }
        self.nodes.push(node);
        Some(self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn global(&self, id: NodeId) -> Option<&GlobalRef> {
        match self.get(id) {
            Node::Global(g) => Some(g),
            _ => None,
        }
    }

    pub fn object(&self, id: NodeId) -> Option<&Object> {
        match self.get(id) {
            Node::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Class an object was instantiated from.
    ///
    /// Objects created through `copyreg._reconstructor(cls, base, state)`
    /// report `cls`, not the reconstructor.
    pub fn class_of(&self, id: NodeId) -> Option<&GlobalRef> {
        let object = self.object(id)?;
        let callable = self.global(object.callable)?;
        if callable.is("copyreg", "_reconstructor") || callable.is("copy_reg", "_reconstructor") {
            return object.args.first().and_then(|cls| self.global(*cls));
        }
        Some(callable)
    }

    /// Class name without its module, e.g. `LinearRegression`
    pub fn class_name(&self, id: NodeId) -> Option<&str> {
        self.class_of(id).map(|g| g.name.as_str())
    }

    pub fn str(&self, id: NodeId) -> Option<&str> {
        match self.get(id) {
            Node::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, id: NodeId) -> Option<i64> {
        match self.get(id) {
            Node::Int(i) => Some(*i),
            Node::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn float(&self, id: NodeId) -> Option<f64> {
        match self.get(id) {
            Node::Float(f) => Some(*f),
            Node::Int(i) => Some(*i as f64),
            Node::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_none(&self, id: NodeId) -> bool {
        matches!(self.get(id), Node::None)
    }

    /// Elements of a list, tuple or list-like object
    pub fn seq(&self, id: NodeId) -> Option<&[NodeId]> {
        match self.get(id) {
            Node::List(items) | Node::Tuple(items) | Node::Set(items) => Some(items),
            Node::Object(o) if !o.list_items.is_empty() => Some(&o.list_items),
            _ => None,
        }
    }

    /// Entries of a dict or dict-like object, in insertion order
    pub fn entries(&self, id: NodeId) -> Option<&[(NodeId, NodeId)]> {
        match self.get(id) {
            Node::Dict(entries) => Some(entries),
            Node::Object(o) => Some(&o.items),
            _ => None,
        }
    }

    /// Look up a string key in a dict or dict-like object
    pub fn dict_get(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.entries(id)?
            .iter()
            .find(|(k, _)| self.str(*k) == Some(key))
            .map(|(_, v)| *v)
    }

    /// Attribute of an object restored through `BUILD`.
    ///
    /// Handles both a plain `__dict__` state and the `(dict, slotstate)` pair.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<NodeId> {
        match self.get(id) {
            Node::Object(o) => {
                let state = o.state?;
                if let Some(found) = self.dict_get(state, name) {
                    return Some(found);
                }
                match self.get(state) {
                    Node::Tuple(parts) => parts
                        .iter()
                        .filter(|p| matches!(self.get(**p), Node::Dict(_)))
                        .find_map(|p| self.dict_get(*p, name)),
                    _ => None,
                }
            }
            Node::Dict(_) => self.dict_get(id, name),
            _ => None,
        }
    }

    /// String items of a list or tuple
    pub fn strings(&self, id: NodeId) -> Option<Vec<String>> {
        self.seq(id)?
            .iter()
            .map(|item| self.str(*item).map(str::to_string))
            .collect()
    }
}
