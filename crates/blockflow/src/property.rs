//! Named slots on a block.

use std::sync::{Arc, LazyLock};

use crate::arena::{BindingId, BlockId};
use crate::dispatcher::Dispatcher;
use crate::value::Value;

/// Property kind, decided by the name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Plain name: a function input.
    Input,
    /// Transient result published by the function; never saved or bound.
    Output,
    /// `#name` control/config.
    Config,
    /// `@name` UI metadata.
    Attribute,
    /// `~name` holds the helper block of `name`.
    Helper,
    /// `^name` global context lookup.
    Context,
    /// `+name` structural config.
    Structural,
    /// `##`, `###`, `#parent`: read-only references.
    Virtual,
}

pub const OUTPUT: &str = "#output";
pub const EMIT: &str = "#emit";
pub const WAIT: &str = "#wait";
pub const IS: &str = "#is";
pub const MODE: &str = "#mode";
pub const DISABLED: &str = "#disabled";
pub const SYNC: &str = "#sync";
pub const CALL: &str = "#call";
pub const CANCEL: &str = "#cancel";
pub const SHARED: &str = "#shared";
pub const CACHE_MODE: &str = "#cacheMode";
pub const FLOW: &str = "##";
pub const ROOT_FLOW: &str = "###";
pub const PARENT: &str = "#parent";
pub const HAS_UNDO: &str = "@has-undo";
pub const HAS_REDO: &str = "@has-redo";
pub const HAS_CHANGE: &str = "@has-change";
pub const GLOBAL: &str = "#global";

pub const HELPER_PREFIX: char = '~';
pub const CONTEXT_PREFIX: char = '^';

impl PropertyKind {
    pub fn of(name: &str) -> Self {
        match name {
            OUTPUT | EMIT | WAIT | HAS_UNDO | HAS_REDO | HAS_CHANGE => PropertyKind::Output,
            FLOW | ROOT_FLOW | PARENT => PropertyKind::Virtual,
            _ => match name.as_bytes().first() {
                Some(b'#') => PropertyKind::Config,
                Some(b'@') => PropertyKind::Attribute,
                Some(b'~') => PropertyKind::Helper,
                Some(b'^') => PropertyKind::Context,
                Some(b'+') => PropertyKind::Structural,
                _ => PropertyKind::Input,
            },
        }
    }

    /// Whether values written to this kind end up in `save()`.
    pub fn is_persistent(self) -> bool {
        !matches!(self, PropertyKind::Output | PropertyKind::Virtual)
    }

    pub fn accepts_binding(self) -> bool {
        self.is_persistent()
    }
}

/// Address of a property: owning block plus name. Non-owning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropRef {
    pub block: BlockId,
    pub name: Arc<str>,
}

impl PropRef {
    pub fn new(block: BlockId, name: impl Into<Arc<str>>) -> Self {
        Self { block, name: name.into() }
    }
}

/// Handle for an external value subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Who gets told when a property's value changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Listener {
    /// Hop `hop` of a binding chain.
    Binding { binding: BindingId, hop: u16 },
    /// External callback registered through `Runtime::subscribe`.
    Subscription(SubscriptionId),
    /// Republish the value as an output of another block.
    Forward(PropRef),
}

/// A named slot on a block. Mutation goes through the runtime; this type
/// only exposes reads.
#[derive(Debug)]
pub struct Property {
    name: Arc<str>,
    kind: PropertyKind,
    pub(crate) dispatcher: Dispatcher<Value, Listener>,
    /// Literal that `save()` writes. `None` when unset or bound.
    pub(crate) saved: Option<Value>,
    pub(crate) binding: Option<BindingId>,
    pub(crate) binding_path: Option<Arc<str>>,
    /// Context property attached automatically to the parent scope rather
    /// than set by the user.
    pub(crate) auto_context: bool,
    /// Number of bindings resolving through this context property.
    pub(crate) context_refs: usize,
}

static VOID_PROPERTY: LazyLock<Property> =
    LazyLock::new(|| Property::new(Arc::from(""), PropertyKind::Virtual));

impl Property {
    pub(crate) fn new(name: Arc<str>, kind: PropertyKind) -> Self {
        Self {
            name,
            kind,
            dispatcher: Dispatcher::default(),
            saved: None,
            binding: None,
            binding_path: None,
            auto_context: false,
            context_refs: 0,
        }
    }

    pub(crate) fn named(name: &str) -> Self {
        Self::new(Arc::from(name), PropertyKind::of(name))
    }

    /// Shared sentinel standing in for destroyed or missing properties.
    pub fn void() -> &'static Property {
        &VOID_PROPERTY
    }

    pub fn is_void(&self) -> bool {
        std::ptr::eq(self, Property::void())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Live value.
    pub fn value(&self) -> &Value {
        self.dispatcher.value()
    }

    /// Saved literal, if the property is persisted as a literal.
    pub fn saved_value(&self) -> Option<&Value> {
        self.saved.as_ref()
    }

    pub fn binding_path(&self) -> Option<&str> {
        self.binding_path.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.binding_path.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.dispatcher.listener_count()
    }

    /// Whether the property holds nothing worth keeping: no value, no saved
    /// literal, no binding and nobody listening.
    pub(crate) fn is_idle(&self) -> bool {
        self.value().is_undefined()
            && self.saved.is_none()
            && self.binding_path.is_none()
            && !self.dispatcher.has_listeners()
            && self.context_refs == 0
    }
}
